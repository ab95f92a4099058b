//! Bounded critique/complete/revise loop.
//!
//! One implementation serves both outline-level and chapter-level revision;
//! callers parameterize it with draft, critique, completeness, and revise
//! functions. The minimum iteration count is honored even when the judge
//! approves early, and the maximum is a hard ceiling: a judge that never
//! approves cannot make the loop spin forever, the best available draft is
//! accepted and the outcome stays visible in the returned history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One iteration of a revision loop. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub iteration: u32,
    pub critique: String,
    pub complete: bool,
    pub timestamp: DateTime<Utc>,
}

fn default_min_iterations() -> u32 {
    1
}

fn default_max_iterations() -> u32 {
    3
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionLoop {
    #[serde(default = "default_min_iterations")]
    pub min_iterations: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for RevisionLoop {
    fn default() -> Self {
        Self {
            min_iterations: default_min_iterations(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl RevisionLoop {
    /// Bounds are clamped so that `1 <= min <= max`.
    pub fn new(min_iterations: u32, max_iterations: u32) -> Self {
        let min = min_iterations.max(1);
        Self {
            min_iterations: min,
            max_iterations: max_iterations.max(min),
        }
    }

    /// Runs the loop over an initial draft.
    ///
    /// Per iteration: critique the draft, judge completeness, append a
    /// [`RevisionRecord`]; stop when the judge approves at or past the
    /// minimum, or unconditionally at the maximum; otherwise revise with
    /// the critique and continue.
    pub fn run<E>(
        &self,
        initial_draft: impl FnOnce() -> Result<String, E>,
        mut critique: impl FnMut(&str) -> Result<String, E>,
        mut judge: impl FnMut(&str, &str) -> Result<bool, E>,
        mut revise: impl FnMut(&str, &str) -> Result<String, E>,
    ) -> Result<(String, Vec<RevisionRecord>), E> {
        let bounds = Self::new(self.min_iterations, self.max_iterations);
        let mut draft = initial_draft()?;
        let mut history = Vec::new();

        for iteration in 1..=bounds.max_iterations {
            let feedback = critique(&draft)?;
            let complete = judge(&draft, &feedback)?;
            history.push(RevisionRecord {
                iteration,
                critique: feedback.clone(),
                complete,
                timestamp: Utc::now(),
            });

            if complete && iteration >= bounds.min_iterations {
                break;
            }
            if iteration == bounds.max_iterations {
                break;
            }

            draft = revise(&draft, &feedback)?;
        }

        Ok((draft, history))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn run_with_judgements(
        bounds: RevisionLoop,
        judgements: &[bool],
    ) -> (String, Vec<RevisionRecord>) {
        let mut calls = 0usize;
        let verdicts = judgements.to_vec();
        bounds
            .run::<Infallible>(
                || Ok("draft v1".to_string()),
                |_| Ok("needs work".to_string()),
                |_, _| {
                    let verdict = verdicts.get(calls).copied().unwrap_or(false);
                    calls += 1;
                    Ok(verdict)
                },
                |draft, _| Ok(format!("{draft}+")),
            )
            .unwrap_or_else(|never| match never {})
    }

    #[test]
    fn approves_on_third_iteration() {
        let (_, history) = run_with_judgements(RevisionLoop::new(1, 3), &[false, false, true]);
        assert_eq!(history.len(), 3);
        assert!(history[2].complete);
        assert!(!history[0].complete && !history[1].complete);
    }

    #[test]
    fn minimum_is_honored_despite_early_approval() {
        let (draft, history) = run_with_judgements(RevisionLoop::new(2, 4), &[true, true]);
        assert_eq!(history.len(), 2);
        // One revision happened between the two iterations.
        assert_eq!(draft, "draft v1+");
    }

    #[test]
    fn maximum_caps_a_never_approving_judge() {
        let (draft, history) = run_with_judgements(RevisionLoop::new(1, 3), &[false; 10]);
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|record| !record.complete));
        // Revised after iterations 1 and 2, never after the last.
        assert_eq!(draft, "draft v1++");
    }

    #[test]
    fn iterations_are_numbered_from_one() {
        let (_, history) = run_with_judgements(RevisionLoop::new(1, 2), &[false, false]);
        let numbers: Vec<u32> = history.iter().map(|record| record.iteration).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn degenerate_bounds_are_clamped() {
        let (_, history) = run_with_judgements(RevisionLoop::new(0, 0), &[false]);
        assert_eq!(history.len(), 1);
        let (_, history) = run_with_judgements(RevisionLoop::new(3, 1), &[false, false, false]);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn errors_propagate_out_of_the_loop() {
        let result = RevisionLoop::new(1, 3).run::<&str>(
            || Ok("draft".to_string()),
            |_| Err("critique backend down"),
            |_, _| Ok(false),
            |_, _| Ok(String::new()),
        );
        assert_eq!(result.unwrap_err(), "critique backend down");
    }
}
