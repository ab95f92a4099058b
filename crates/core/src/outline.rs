//! Tagged outline beat parsing.
//!
//! Outlines come back from the backend in a tagged per-chapter format:
//!
//! ```text
//! Chapter 1 - [The Lighthouse]
//! Role: [opening]
//! Purpose: [establish the keeper and the storm]
//! Summary: [a supply boat fails to arrive]
//! ```
//!
//! Backends drift from the format often enough that parsing must never
//! abort a run: the outcome is an explicit two-variant result, and an
//! unclassifiable response is carried forward as raw text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^chapter\s+(\d+)\s*[-—:]\s*\[?([^\[\]]*?)\]?\s*$").expect("valid regex")
    })
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(role|purpose|summary)\s*[:：]\s*\[?([^\[\]]*?)\]?\s*$")
            .expect("valid regex")
    })
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineBeat {
    pub number: u32,
    pub title: String,
    pub role: String,
    pub purpose: String,
    pub summary: String,
}

/// Result of parsing an outline response.
///
/// `Unclassified` is not an error: downstream consumers fall back to the
/// raw text and to configured defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutlineParse {
    Structured(Vec<OutlineBeat>),
    Unclassified(String),
}

impl OutlineParse {
    pub fn beat_count(&self) -> Option<usize> {
        match self {
            Self::Structured(beats) => Some(beats.len()),
            Self::Unclassified(_) => None,
        }
    }

    pub fn beat(&self, number: u32) -> Option<&OutlineBeat> {
        match self {
            Self::Structured(beats) => beats.iter().find(|beat| beat.number == number),
            Self::Unclassified(_) => None,
        }
    }
}

/// Splits the text into blank-line separated blocks and parses each block
/// whose first line matches the chapter header. A text yielding no beats at
/// all is returned whole as `Unclassified`.
pub fn parse_outline(text: &str) -> OutlineParse {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return OutlineParse::Unclassified(String::new());
    }

    let mut beats: Vec<OutlineBeat> = Vec::new();
    let mut current: Option<OutlineBeat> = None;

    for raw_line in trimmed.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = header_regex().captures(line) {
            if let Some(beat) = current.take() {
                beats.push(beat);
            }
            let number = header
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            current = Some(OutlineBeat {
                number,
                title: header.get(2).map_or("", |m| m.as_str()).trim().to_string(),
                ..OutlineBeat::default()
            });
            continue;
        }

        let Some(beat) = current.as_mut() else {
            continue;
        };
        if let Some(tag) = tag_regex().captures(line) {
            let value = tag.get(2).map_or("", |m| m.as_str()).trim().to_string();
            match tag
                .get(1)
                .map_or("", |m| m.as_str())
                .to_ascii_lowercase()
                .as_str()
            {
                "role" => beat.role = value,
                "purpose" => beat.purpose = value,
                "summary" => beat.summary = value,
                _ => {}
            }
        }
    }

    if let Some(beat) = current.take() {
        beats.push(beat);
    }

    if beats.is_empty() {
        OutlineParse::Unclassified(trimmed.to_string())
    } else {
        beats.sort_by_key(|beat| beat.number);
        OutlineParse::Structured(beats)
    }
}
