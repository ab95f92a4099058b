//! End-to-end workflow runs over a scripted backend.

use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fabula_core::backend::{BackendError, CompletionBackend};
use fabula_core::checkpoint::{CheckpointError, CheckpointStore, SessionStatus};
use fabula_core::engine::{
    is_degraded_text, EngineConfig, EngineError, ProviderBindings, RetryPolicy, WorkflowEngine,
};
use fabula_core::logging::MemorySink;
use fabula_core::prompts::PromptCatalog;
use fabula_core::provider::ProviderHandle;
use fabula_core::revision::RevisionLoop;
use fabula_core::state::NodeId;
use tempfile::tempdir;

const OUTLINE: &str = "\
Chapter 1 - [First Light]
Role: [opening]
Purpose: [establish the keeper]
Summary: [a supply boat fails to arrive]

Chapter 2 - [Landfall]
Role: [ending]
Purpose: [resolve the storm]
Summary: [the keeper rows out]";

/// Replays a fixed script of responses and records every prompt it saw.
/// Optionally raises a stop flag once a call quota is reached.
struct ScriptedBackend {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    stop_after: Option<(usize, Arc<AtomicBool>)>,
}

impl ScriptedBackend {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            stop_after: None,
        }
    }

    fn stopping_after(mut self, calls: usize, flag: Arc<AtomicBool>) -> Self {
        self.stop_after = Some((calls, flag));
        self
    }

    fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl CompletionBackend for ScriptedBackend {
    fn complete(&self, _handle: &ProviderHandle, prompt: &str) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| BackendError::message("script exhausted"))?;
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, flag)) = &self.stop_after {
            if calls >= *after {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(response)
    }
}

/// A backend that is permanently down.
struct DeadBackend;

impl CompletionBackend for DeadBackend {
    fn complete(&self, _handle: &ProviderHandle, _prompt: &str) -> Result<String, BackendError> {
        Err(BackendError::message("connection refused"))
    }
}

fn bindings() -> ProviderBindings {
    ProviderBindings::new(ProviderHandle::resolve("lmstudio://test-model").unwrap())
}

#[test]
fn full_run_completes_and_checkpoints_every_node() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).with_history();
    let prompts = PromptCatalog::built_in().unwrap();
    let sink = MemorySink::new();

    // extract, story elements, outline (draft + critique + approving judge),
    // two chapters of 8 calls each (three layers, then critique/judge/revise
    // and a final critique/judge), finalize.
    let backend = ScriptedBackend::new(&[
        "CTX",
        "ELEMENTS",
        OUTLINE,
        "outline critique",
        "yes",
        "ch1 plot",
        "ch1 character",
        "ch1 dialogue",
        "ch1 crit 1",
        "no",
        "ch1 rev 1",
        "ch1 crit 2",
        "no",
        "ch2 plot",
        "ch2 character",
        "ch2 dialogue",
        "ch2 crit 1",
        "no",
        "ch2 rev 1",
        "ch2 crit 2",
        "no",
        "FRONT MATTER",
    ]);

    let config = EngineConfig {
        total_chapters: 2,
        outline_loop: RevisionLoop::new(1, 1),
        chapter_loop: RevisionLoop::new(1, 2),
        ..EngineConfig::default()
    };
    let engine =
        WorkflowEngine::new(&backend, bindings(), &prompts, &store, &sink).with_config(config);

    let report = engine.start("a lighthouse story").unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.transitions, 9);
    assert_eq!(backend.remaining(), 0, "every scripted response consumed");

    let checkpoint = store.load(&report.session_id).unwrap();
    assert_eq!(checkpoint.status, SessionStatus::Completed);
    assert_eq!(checkpoint.last_completed_node, NodeId::FinalizeStory);
    // One snapshot per completed node.
    assert_eq!(store.history_len(&report.session_id).unwrap(), 9);

    let state = checkpoint.state;
    assert_eq!(state.base_prompt_context.as_deref(), Some("CTX"));
    assert_eq!(state.total_chapters, 2);
    assert_eq!(state.current_chapter_index, 2);
    assert_eq!(state.chapters.len(), 2);

    let first = &state.chapters[0];
    assert_eq!(first.index, 1);
    assert_eq!(first.draft_stages.len(), 3);
    assert_eq!(first.final_text.as_deref(), Some("ch1 rev 1"));
    assert_eq!(first.revisions.len(), 2);
    assert!(first.revisions.iter().all(|r| !r.complete));
    assert!(!first.degraded);

    assert_eq!(state.outline_revisions.len(), 1);
    assert!(state.outline_revisions[0].complete);

    let manuscript = state.final_manuscript.unwrap();
    assert!(manuscript.starts_with("FRONT MATTER"));
    assert!(manuscript.contains("Chapter 1"));
    assert!(manuscript.contains("ch2 rev 1"));

    // Chapter 2 drafting saw the finalized chapter 1 text and its own beat.
    let prompts_seen = backend.prompts();
    let ch2_plot = prompts_seen
        .iter()
        .find(|p| p.contains("Landfall"))
        .expect("chapter 2 plot prompt");
    assert!(ch2_plot.contains("ch1 rev 1"));
}

#[test]
fn interrupted_run_resumes_without_repeating_or_skipping() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let prompts = PromptCatalog::built_in().unwrap();
    let sink = MemorySink::new();
    let stop = Arc::new(AtomicBool::new(false));

    // Phase one holds exactly the responses for the first two nodes; the
    // stop flag goes up as the second call returns.
    let backend = ScriptedBackend::new(&["CTX", "ELEMENTS"]).stopping_after(2, Arc::clone(&stop));
    let config = EngineConfig {
        total_chapters: 1,
        outline_loop: RevisionLoop::new(1, 1),
        chapter_loop: RevisionLoop::new(1, 1),
        ..EngineConfig::default()
    };
    let engine = WorkflowEngine::new(&backend, bindings(), &prompts, &store, &sink)
        .with_config(config)
        .with_stop_flag(Arc::clone(&stop));

    let report = engine.start("a lighthouse story").unwrap();
    assert_eq!(report.status, SessionStatus::Interrupted);
    assert_eq!(report.transitions, 2);
    assert_eq!(backend.remaining(), 0);

    let checkpoint = store.load(&report.session_id).unwrap();
    assert_eq!(checkpoint.status, SessionStatus::Interrupted);
    assert_eq!(checkpoint.last_completed_node, NodeId::GenerateStoryElements);

    // Phase two scripts only what the remaining five nodes need: outline
    // draft/critique/judge, one chapter (three layers + critique/judge),
    // finalize.
    let backend = ScriptedBackend::new(&[
        OUTLINE,
        "outline critique",
        "yes",
        "ch1 plot",
        "ch1 character",
        "ch1 dialogue",
        "ch1 crit",
        "yes",
        "FRONT MATTER",
    ]);
    let config = EngineConfig {
        total_chapters: 1,
        outline_loop: RevisionLoop::new(1, 1),
        chapter_loop: RevisionLoop::new(1, 1),
        ..EngineConfig::default()
    };
    let engine =
        WorkflowEngine::new(&backend, bindings(), &prompts, &store, &sink).with_config(config);

    let report = engine.resume(&report.session_id).unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.transitions, 5);
    assert_eq!(backend.remaining(), 0, "no node re-executed or skipped");

    // Work done before the interruption survived it.
    let state = store.load(&report.session_id).unwrap().state;
    assert_eq!(state.base_prompt_context.as_deref(), Some("CTX"));
    assert_eq!(state.story_elements.as_deref(), Some("ELEMENTS"));
    assert_eq!(state.chapters.len(), 1);
    assert!(state.final_manuscript.is_some());
}

#[test]
fn resuming_a_completed_session_is_a_no_op() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let prompts = PromptCatalog::built_in().unwrap();
    let sink = MemorySink::new();

    let backend = ScriptedBackend::new(&[
        "CTX",
        "ELEMENTS",
        OUTLINE,
        "critique",
        "yes",
        "ch1 plot",
        "ch1 character",
        "ch1 dialogue",
        "ch1 crit",
        "yes",
        "ch2 plot",
        "ch2 character",
        "ch2 dialogue",
        "ch2 crit",
        "yes",
        "FRONT MATTER",
    ]);
    let config = EngineConfig {
        total_chapters: 2,
        outline_loop: RevisionLoop::new(1, 1),
        chapter_loop: RevisionLoop::new(1, 1),
        ..EngineConfig::default()
    };
    let engine =
        WorkflowEngine::new(&backend, bindings(), &prompts, &store, &sink).with_config(config);
    let report = engine.start("a lighthouse story").unwrap();
    assert_eq!(report.status, SessionStatus::Completed);

    let empty = ScriptedBackend::new(&[]);
    let engine = WorkflowEngine::new(&empty, bindings(), &prompts, &store, &sink);
    let resumed = engine.resume(&report.session_id).unwrap();
    assert_eq!(resumed.status, SessionStatus::Completed);
    assert_eq!(resumed.transitions, 0);
    assert!(empty.prompts().is_empty());
}

#[test]
fn unavailable_backend_degrades_but_the_run_still_completes() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let prompts = PromptCatalog::built_in().unwrap();
    let sink = MemorySink::new();

    let backend = DeadBackend;
    let config = EngineConfig {
        total_chapters: 1,
        outline_loop: RevisionLoop::new(1, 1),
        chapter_loop: RevisionLoop::new(1, 1),
        retry: RetryPolicy { max_attempts: 2 },
        ..EngineConfig::default()
    };
    let engine =
        WorkflowEngine::new(&backend, bindings(), &prompts, &store, &sink).with_config(config);

    let report = engine.start("a lighthouse story").unwrap();
    assert_eq!(report.status, SessionStatus::Completed);

    let state = store.load(&report.session_id).unwrap().state;
    let chapter = &state.chapters[0];
    assert!(chapter.degraded);
    assert!(is_degraded_text(chapter.final_text.as_deref().unwrap()));
    assert!(is_degraded_text(state.base_prompt_context.as_deref().unwrap()));
    assert!(sink.contains("retry budget exhausted"));
}

#[test]
fn resume_of_an_unknown_session_reports_not_found() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let prompts = PromptCatalog::built_in().unwrap();
    let sink = MemorySink::new();
    let backend = ScriptedBackend::new(&[]);

    let engine = WorkflowEngine::new(&backend, bindings(), &prompts, &store, &sink);
    match engine.resume("ghost").unwrap_err() {
        EngineError::Checkpoint(CheckpointError::NotFound { session_id }) => {
            assert_eq!(session_id, "ghost");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn corrupted_checkpoint_surfaces_explicitly_on_resume() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let prompts = PromptCatalog::built_in().unwrap();
    let sink = MemorySink::new();

    let backend = ScriptedBackend::new(&["CTX", "ELEMENTS"]);
    let stop = Arc::new(AtomicBool::new(false));
    let backend = backend.stopping_after(2, Arc::clone(&stop));
    let config = EngineConfig {
        total_chapters: 1,
        ..EngineConfig::default()
    };
    let engine = WorkflowEngine::new(&backend, bindings(), &prompts, &store, &sink)
        .with_config(config)
        .with_stop_flag(stop);
    let report = engine.start("a lighthouse story").unwrap();

    let path = dir
        .path()
        .join(&report.session_id)
        .join("checkpoint.json");
    fs::write(&path, "{ definitely not json").unwrap();

    let fresh = ScriptedBackend::new(&[]);
    let engine = WorkflowEngine::new(&fresh, bindings(), &prompts, &store, &sink);
    match engine.resume(&report.session_id).unwrap_err() {
        EngineError::Checkpoint(CheckpointError::Corrupt { session_id, .. }) => {
            assert_eq!(session_id, report.session_id);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unclassified_outline_falls_back_to_the_configured_chapter_count() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let prompts = PromptCatalog::built_in().unwrap();
    let sink = MemorySink::new();

    let backend = ScriptedBackend::new(&[
        "CTX",
        "ELEMENTS",
        "just start at sea and end in fire, no chapters given",
        "critique",
        "yes",
        "ch1 plot",
        "ch1 character",
        "ch1 dialogue",
        "ch1 crit",
        "yes",
        "FRONT MATTER",
    ]);
    let config = EngineConfig {
        total_chapters: 1,
        outline_loop: RevisionLoop::new(1, 1),
        chapter_loop: RevisionLoop::new(1, 1),
        ..EngineConfig::default()
    };
    let engine =
        WorkflowEngine::new(&backend, bindings(), &prompts, &store, &sink).with_config(config);

    let report = engine.start("a lighthouse story").unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(backend.remaining(), 0);

    let state = store.load(&report.session_id).unwrap().state;
    assert_eq!(state.total_chapters, 1);
    // The chapter brief carried the raw outline text instead of a beat.
    let plot_prompt = backend
        .prompts()
        .iter()
        .find(|p| p.contains("plot layer"))
        .cloned()
        .expect("plot prompt");
    assert!(plot_prompt.contains("end in fire"));
}
