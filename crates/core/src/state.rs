//! Workflow state carried between nodes.
//!
//! The engine owns the only mutable [`WorkflowState`]; nodes see a shared
//! reference and return deltas. Everything here serializes losslessly so a
//! checkpoint can reconstruct a run exactly.

use crate::revision::RevisionRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one discrete step of the workflow state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    ExtractBaseContext,
    GenerateStoryElements,
    GenerateOutline,
    DetermineChapterCount,
    GenerateChapter,
    AdvanceChapter,
    FinalizeStory,
}

impl NodeId {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ExtractBaseContext => "extract_base_context",
            Self::GenerateStoryElements => "generate_story_elements",
            Self::GenerateOutline => "generate_outline",
            Self::DetermineChapterCount => "determine_chapter_count",
            Self::GenerateChapter => "generate_chapter",
            Self::AdvanceChapter => "advance_chapter",
            Self::FinalizeStory => "finalize_story",
        }
    }

    /// First node of every fresh session.
    pub fn initial() -> Self {
        Self::ExtractBaseContext
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered drafting layer within one chapter.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftLayer {
    Plot,
    Character,
    Dialogue,
}

impl DraftLayer {
    pub const ORDER: [DraftLayer; 3] = [DraftLayer::Plot, DraftLayer::Character, DraftLayer::Dialogue];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Plot => "plot",
            Self::Character => "character",
            Self::Dialogue => "dialogue",
        }
    }

    /// Prompt key used to render this layer.
    pub fn prompt_key(&self) -> &'static str {
        match self {
            Self::Plot => "chapter_plot",
            Self::Character => "chapter_character",
            Self::Dialogue => "chapter_dialogue",
        }
    }
}

impl fmt::Display for DraftLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DraftStage {
    pub layer: DraftLayer,
    pub text: String,
}

/// Per-chapter record. Created when chapter generation begins; immutable
/// once `final_text` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub index: u32,
    #[serde(default)]
    pub draft_stages: Vec<DraftStage>,
    #[serde(default)]
    pub final_text: Option<String>,
    #[serde(default)]
    pub revisions: Vec<RevisionRecord>,
    /// True when any underlying call exhausted its retry budget and a
    /// placeholder was substituted.
    #[serde(default)]
    pub degraded: bool,
}

impl ChapterRecord {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            draft_stages: Vec::new(),
            final_text: None,
            revisions: Vec::new(),
            degraded: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.final_text.is_some()
    }
}

/// Mutable record carried through node execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub initial_prompt: String,
    #[serde(default)]
    pub base_prompt_context: Option<String>,
    #[serde(default)]
    pub story_elements: Option<String>,
    #[serde(default)]
    pub outline: Option<String>,
    #[serde(default)]
    pub outline_revisions: Vec<RevisionRecord>,
    #[serde(default)]
    pub chapters: Vec<ChapterRecord>,
    /// 1-based index of the chapter currently being generated; 0 before the
    /// chapter loop starts. Monotonically non-decreasing, never above
    /// `total_chapters`.
    #[serde(default)]
    pub current_chapter_index: u32,
    #[serde(default)]
    pub total_chapters: u32,
    #[serde(default)]
    pub final_manuscript: Option<String>,
}

impl WorkflowState {
    pub fn new(session_id: impl Into<String>, initial_prompt: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            initial_prompt: initial_prompt.into(),
            ..Self::default()
        }
    }

    pub fn chapter(&self, index: u32) -> Option<&ChapterRecord> {
        self.chapters.iter().find(|chapter| chapter.index == index)
    }

    /// Finalized text of the chapter before `index`, the continuity context
    /// for the chapter being generated. Only finalized chapters qualify.
    pub fn previous_chapter_text(&self, index: u32) -> Option<&str> {
        if index <= 1 {
            return None;
        }
        self.chapter(index - 1)
            .and_then(|chapter| chapter.final_text.as_deref())
    }

    /// Number of chapters that have been finalized so far.
    pub fn finalized_chapters(&self) -> usize {
        self.chapters
            .iter()
            .filter(|chapter| chapter.is_finalized())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_chapter_requires_finalization() {
        let mut state = WorkflowState::new("s", "p");
        state.total_chapters = 2;
        let mut first = ChapterRecord::new(1);
        state.chapters.push(first.clone());
        assert_eq!(state.previous_chapter_text(2), None);

        first.final_text = Some("chapter one".to_string());
        state.chapters[0] = first;
        assert_eq!(state.previous_chapter_text(2), Some("chapter one"));
        assert_eq!(state.previous_chapter_text(1), None);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = WorkflowState::new("session-1", "write me a story");
        state.base_prompt_context = Some("keep it gentle".into());
        state.total_chapters = 3;
        state.current_chapter_index = 1;
        state.chapters.push(ChapterRecord::new(1));

        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn node_labels_are_stable() {
        assert_eq!(NodeId::ExtractBaseContext.label(), "extract_base_context");
        assert_eq!(NodeId::FinalizeStory.to_string(), "finalize_story");
        let json = serde_json::to_string(&NodeId::GenerateChapter).unwrap();
        assert_eq!(json, "\"generate_chapter\"");
    }
}
