//! The generation workflow engine.
//!
//! One engine instance drives one session at a time through a fixed node
//! machine: extract base context, story elements, outline (with a bounded
//! critique/revise loop), chapter count, then per-chapter staged drafting
//! (plot, character, dialogue layers, each consuming the previous layer
//! plus optional retrieval context) with its own revision loop, and a
//! finalize pass. A checkpoint lands after every completed node, so a run
//! can be interrupted between nodes and resumed without re-executing or
//! skipping anything.
//!
//! Backend calls are wrapped in a bounded retry; when the budget is spent
//! the node emits a marked placeholder and the run advances, so one bad
//! chapter never discards the completed ones.

use crate::backend::CompletionBackend;
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, SessionStatus};
use crate::logging::{LogEvent, LogLevel, LogSink};
use crate::outline::{parse_outline, OutlineBeat, OutlineParse};
use crate::prompts::{PromptCatalog, PromptError};
use crate::provider::ProviderHandle;
use crate::retrieval::RetrievalIndex;
use crate::revision::{RevisionLoop, RevisionRecord};
use crate::state::{ChapterRecord, DraftLayer, DraftStage, NodeId, WorkflowState};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Marker prefix of every placeholder substituted after retry exhaustion.
pub const DEGRADED_MARKER: &str = "[degraded:";

const PREVIOUS_EXCERPT_CHARS: usize = 800;
const MANUSCRIPT_HEAD_CHARS: usize = 2_000;

/// Workflow stage families that can be bound to distinct providers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Base context, story elements, outline drafting, finalize.
    Foundation,
    /// Chapter layer drafting.
    Drafting,
    /// Critique, completeness judging, and revision calls.
    Critique,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Foundation => "foundation",
            Self::Drafting => "drafting",
            Self::Critique => "critique",
        };
        f.write_str(label)
    }
}

/// Per-stage provider handles with a default fallback, so e.g. a stronger
/// backend can draft the outline while a cheaper one drafts chapters.
#[derive(Clone, Debug)]
pub struct ProviderBindings {
    default: ProviderHandle,
    overrides: BTreeMap<StageKind, ProviderHandle>,
}

impl ProviderBindings {
    pub fn new(default: ProviderHandle) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn bind(mut self, stage: StageKind, handle: ProviderHandle) -> Self {
        self.overrides.insert(stage, handle);
        self
    }

    pub fn handle_for(&self, stage: StageKind) -> &ProviderHandle {
        self.overrides.get(&stage).unwrap_or(&self.default)
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// Bounded retry around each generation call.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// Whether the chapter retry budget refreshes per drafting/revision call
/// or persists across the whole chapter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryScope {
    #[default]
    PerStage,
    PerChapter,
}

fn default_top_k() -> usize {
    4
}

fn default_min_similarity() -> f32 {
    0.1
}

fn default_retrieval_tokens() -> usize {
    800
}

/// Query parameters applied when a node pulls retrieval context.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetrievalQuery {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_retrieval_tokens")]
    pub max_tokens: usize,
}

impl Default for RetrievalQuery {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            max_tokens: default_retrieval_tokens(),
        }
    }
}

fn default_total_chapters() -> u32 {
    3
}

fn default_words_per_chapter() -> u32 {
    2_000
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Chapter count used for outline prompting and as the fallback when
    /// the outline cannot be parsed into beats.
    #[serde(default = "default_total_chapters")]
    pub total_chapters: u32,
    #[serde(default = "default_words_per_chapter")]
    pub words_per_chapter: u32,
    #[serde(default)]
    pub outline_loop: RevisionLoop,
    #[serde(default)]
    pub chapter_loop: RevisionLoop,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub retry_scope: RetryScope,
    #[serde(default)]
    pub retrieval: RetrievalQuery,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            total_chapters: default_total_chapters(),
            words_per_chapter: default_words_per_chapter(),
            outline_loop: RevisionLoop::default(),
            chapter_loop: RevisionLoop::default(),
            retry: RetryPolicy::default(),
            retry_scope: RetryScope::default(),
            retrieval: RetrievalQuery::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to render prompt for node {node}: {source}")]
    Prompt {
        node: NodeId,
        #[source]
        source: PromptError,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Partial state update produced by one node. Applying a delta is the only
/// way node output reaches the engine-owned [`WorkflowState`].
#[derive(Clone, Debug, Default)]
pub struct StateDelta {
    pub base_prompt_context: Option<String>,
    pub story_elements: Option<String>,
    pub outline: Option<String>,
    pub outline_revisions: Option<Vec<RevisionRecord>>,
    pub total_chapters: Option<u32>,
    pub current_chapter_index: Option<u32>,
    pub push_chapter: Option<ChapterRecord>,
    pub final_manuscript: Option<String>,
}

impl StateDelta {
    pub fn apply(&self, state: &mut WorkflowState) {
        if let Some(value) = &self.base_prompt_context {
            state.base_prompt_context = Some(value.clone());
        }
        if let Some(value) = &self.story_elements {
            state.story_elements = Some(value.clone());
        }
        if let Some(value) = &self.outline {
            state.outline = Some(value.clone());
        }
        if let Some(value) = &self.outline_revisions {
            state.outline_revisions = value.clone();
        }
        if let Some(value) = self.total_chapters {
            state.total_chapters = value;
        }
        if let Some(value) = self.current_chapter_index {
            // The index never moves backwards and never passes the total.
            state.current_chapter_index = value
                .max(state.current_chapter_index)
                .min(state.total_chapters.max(1));
        }
        if let Some(chapter) = &self.push_chapter {
            state.chapters.push(chapter.clone());
        }
        if let Some(value) = &self.final_manuscript {
            state.final_manuscript = Some(value.clone());
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Next(NodeId),
    Complete,
}

/// Outcome of a `start` or `resume` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub session_id: String,
    pub status: SessionStatus,
    /// Node transitions traversed by this call (each one checkpointed).
    pub transitions: usize,
}

/// Next structural node after `node`, given the state that node produced.
/// Pure, so `resume` recomputes the same edge the original run took.
pub fn successor(node: NodeId, state: &WorkflowState) -> Option<NodeId> {
    match node {
        NodeId::ExtractBaseContext => Some(NodeId::GenerateStoryElements),
        NodeId::GenerateStoryElements => Some(NodeId::GenerateOutline),
        NodeId::GenerateOutline => Some(NodeId::DetermineChapterCount),
        NodeId::DetermineChapterCount | NodeId::AdvanceChapter => {
            if (state.finalized_chapters() as u32) < state.total_chapters {
                Some(NodeId::GenerateChapter)
            } else {
                Some(NodeId::FinalizeStory)
            }
        }
        NodeId::GenerateChapter => Some(NodeId::AdvanceChapter),
        NodeId::FinalizeStory => None,
    }
}

/// Lenient reading of an LLM-judged boolean: the first word decides.
pub fn parse_judgement(text: &str) -> bool {
    let first = text
        .trim()
        .split(|ch: char| !ch.is_alphanumeric())
        .find(|token| !token.is_empty())
        .unwrap_or("")
        .to_ascii_lowercase();
    matches!(first.as_str(), "yes" | "true" | "complete" | "ready")
}

fn degraded_placeholder(node: NodeId, attempts: u32) -> String {
    format!(
        "{DEGRADED_MARKER} {} unavailable after {} attempts]",
        node.label(),
        attempts
    )
}

/// True when `text` is a placeholder substituted for a failed generation.
pub fn is_degraded_text(text: &str) -> bool {
    text.trim_start().starts_with(DEGRADED_MARKER)
}

struct RetryBudget {
    remaining: u32,
}

pub struct WorkflowEngine<'a> {
    backend: &'a dyn CompletionBackend,
    bindings: ProviderBindings,
    prompts: &'a PromptCatalog,
    store: &'a CheckpointStore,
    retrieval: RetrievalIndex,
    sink: &'a dyn LogSink,
    config: EngineConfig,
    stop: Arc<AtomicBool>,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(
        backend: &'a dyn CompletionBackend,
        bindings: ProviderBindings,
        prompts: &'a PromptCatalog,
        store: &'a CheckpointStore,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            backend,
            bindings,
            prompts,
            store,
            retrieval: RetrievalIndex::empty(),
            sink,
            config: EngineConfig::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalIndex) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Shares the cooperative stop flag. Raising it interrupts the run at
    /// the next node boundary, never mid-node.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a fresh session and runs it to a terminal status.
    pub fn start(&self, initial_prompt: &str) -> Result<RunReport, EngineError> {
        let session_id = Uuid::new_v4().to_string();
        let state = WorkflowState::new(session_id.clone(), initial_prompt);
        self.log(LogLevel::Info, None, format!("session {session_id} started"));
        self.run_from(state, NodeId::initial(), None)
    }

    /// Continues a checkpointed session from the node after the last
    /// completed one. A corrupted snapshot surfaces as
    /// [`CheckpointError::Corrupt`]; start a fresh session in that case.
    pub fn resume(&self, session_id: &str) -> Result<RunReport, EngineError> {
        let checkpoint = self.store.load(session_id)?;
        if checkpoint.status == SessionStatus::Completed {
            return Ok(RunReport {
                session_id: session_id.to_string(),
                status: SessionStatus::Completed,
                transitions: 0,
            });
        }

        let Some(next) = successor(checkpoint.last_completed_node, &checkpoint.state) else {
            return Ok(RunReport {
                session_id: session_id.to_string(),
                status: checkpoint.status,
                transitions: 0,
            });
        };

        self.log(
            LogLevel::Info,
            None,
            format!(
                "session {session_id} resumed after {}",
                checkpoint.last_completed_node
            ),
        );
        self.run_from(checkpoint.state, next, Some(checkpoint.last_completed_node))
    }

    /// Executes one node against a state snapshot. Pure with respect to the
    /// snapshot: all effects are in the returned delta, and the transition
    /// is the enumerated next node.
    pub fn step(
        &self,
        state: &WorkflowState,
        node: NodeId,
    ) -> Result<(StateDelta, Transition), EngineError> {
        let delta = match node {
            NodeId::ExtractBaseContext => self.node_extract_base_context(state)?,
            NodeId::GenerateStoryElements => self.node_story_elements(state)?,
            NodeId::GenerateOutline => self.node_generate_outline(state)?,
            NodeId::DetermineChapterCount => self.node_determine_chapter_count(state),
            NodeId::GenerateChapter => self.node_generate_chapter(state)?,
            NodeId::AdvanceChapter => self.node_advance_chapter(state),
            NodeId::FinalizeStory => self.node_finalize_story(state)?,
        };

        let mut preview = state.clone();
        delta.apply(&mut preview);
        let transition = match successor(node, &preview) {
            Some(next) => Transition::Next(next),
            None => Transition::Complete,
        };
        Ok((delta, transition))
    }

    fn run_from(
        &self,
        mut state: WorkflowState,
        first: NodeId,
        mut last_completed: Option<NodeId>,
    ) -> Result<RunReport, EngineError> {
        let mut current = Some(first);
        let mut transitions = 0usize;

        while let Some(node) = current {
            if self.stop.load(Ordering::SeqCst) {
                if let Some(last) = last_completed {
                    self.store.save(&Checkpoint::new(
                        last,
                        SessionStatus::Interrupted,
                        state.clone(),
                    ))?;
                }
                self.log(
                    LogLevel::Warn,
                    None,
                    format!("session {} interrupted before {}", state.session_id, node),
                );
                return Ok(RunReport {
                    session_id: state.session_id,
                    status: SessionStatus::Interrupted,
                    transitions,
                });
            }

            let (delta, transition) = match self.step(&state, node) {
                Ok(result) => result,
                Err(err) => {
                    // Structural failure: leave a failed checkpoint behind if
                    // the session got far enough to have one.
                    if let Some(last) = last_completed {
                        let _ = self.store.save(&Checkpoint::new(
                            last,
                            SessionStatus::Failed,
                            state.clone(),
                        ));
                    }
                    return Err(err);
                }
            };
            delta.apply(&mut state);

            let status = match transition {
                Transition::Complete => SessionStatus::Completed,
                Transition::Next(_) => SessionStatus::InProgress,
            };
            self.store
                .save(&Checkpoint::new(node, status, state.clone()))?;
            transitions += 1;
            last_completed = Some(node);
            self.log(LogLevel::Info, Some(node), "node completed");

            current = match transition {
                Transition::Next(next) => Some(next),
                Transition::Complete => None,
            };
        }

        self.log(
            LogLevel::Info,
            None,
            format!("session {} completed", state.session_id),
        );
        Ok(RunReport {
            session_id: state.session_id,
            status: SessionStatus::Completed,
            transitions,
        })
    }

    // --- node implementations ---

    fn node_extract_base_context(&self, state: &WorkflowState) -> Result<StateDelta, EngineError> {
        let node = NodeId::ExtractBaseContext;
        let prompt = self.render(
            node,
            "extract_base_context",
            [("initial_prompt", state.initial_prompt.clone())],
        )?;
        let (text, _) = self.generate_fresh(node, StageKind::Foundation, &prompt);
        Ok(StateDelta {
            base_prompt_context: Some(text),
            ..StateDelta::default()
        })
    }

    fn node_story_elements(&self, state: &WorkflowState) -> Result<StateDelta, EngineError> {
        let node = NodeId::GenerateStoryElements;
        let prompt = self.render(
            node,
            "story_elements",
            [
                ("base_context", base_context(state)),
                ("initial_prompt", state.initial_prompt.clone()),
                ("total_chapters", self.config.total_chapters.to_string()),
                (
                    "words_per_chapter",
                    self.config.words_per_chapter.to_string(),
                ),
            ],
        )?;
        let (text, _) = self.generate_fresh(node, StageKind::Foundation, &prompt);
        Ok(StateDelta {
            story_elements: Some(text),
            ..StateDelta::default()
        })
    }

    fn node_generate_outline(&self, state: &WorkflowState) -> Result<StateDelta, EngineError> {
        let node = NodeId::GenerateOutline;
        let draft_prompt = self.render(
            node,
            "outline",
            [
                ("base_context", base_context(state)),
                (
                    "story_elements",
                    state.story_elements.clone().unwrap_or_default(),
                ),
                ("total_chapters", self.config.total_chapters.to_string()),
            ],
        )?;

        let (outline, history) = self.config.outline_loop.run(
            || Ok(self.generate_fresh(node, StageKind::Foundation, &draft_prompt).0),
            |draft| {
                let prompt = self.render(
                    node,
                    "critique_outline",
                    [("base_context", base_context(state)), ("draft", draft.to_string())],
                )?;
                Ok(self.generate_fresh(node, StageKind::Critique, &prompt).0)
            },
            |_draft, critique| self.judge_complete(node, critique),
            |draft, critique| {
                let prompt = self.render(
                    node,
                    "revise_outline",
                    [
                        ("base_context", base_context(state)),
                        ("draft", draft.to_string()),
                        ("critique", critique.to_string()),
                    ],
                )?;
                Ok(self.generate_fresh(node, StageKind::Critique, &prompt).0)
            },
        )?;

        if history.iter().all(|record| !record.complete) {
            self.log(
                LogLevel::Warn,
                Some(node),
                format!(
                    "outline accepted without convergence after {} iterations",
                    history.len()
                ),
            );
        }

        Ok(StateDelta {
            outline: Some(outline),
            outline_revisions: Some(history),
            ..StateDelta::default()
        })
    }

    fn node_determine_chapter_count(&self, state: &WorkflowState) -> StateDelta {
        let node = NodeId::DetermineChapterCount;
        let outline_text = state.outline.as_deref().unwrap_or("");
        let total = match parse_outline(outline_text) {
            OutlineParse::Structured(beats) => {
                let count = beats.len().max(1) as u32;
                self.log(
                    LogLevel::Info,
                    Some(node),
                    format!("outline parsed into {count} chapter beats"),
                );
                count
            }
            OutlineParse::Unclassified(_) => {
                let fallback = self.config.total_chapters.max(1);
                self.log(
                    LogLevel::Warn,
                    Some(node),
                    format!(
                        "outline is unclassified, falling back to configured count {fallback}"
                    ),
                );
                fallback
            }
        };
        StateDelta {
            total_chapters: Some(total),
            current_chapter_index: Some(1),
            ..StateDelta::default()
        }
    }

    fn node_generate_chapter(&self, state: &WorkflowState) -> Result<StateDelta, EngineError> {
        let node = NodeId::GenerateChapter;
        let index = state.current_chapter_index.max(1);
        let brief = self.chapter_brief(state, index);

        let retrieval_context = {
            let query = self.retrieval.query(
                &brief,
                self.config.retrieval.top_k,
                self.config.retrieval.min_similarity,
                self.config.retrieval.max_tokens,
            );
            query.join("\n\n")
        };
        let previous_excerpt = state
            .previous_chapter_text(index)
            .map(|text| tail_chars(text, PREVIOUS_EXCERPT_CHARS))
            .unwrap_or_default();

        let budget = RefCell::new(self.fresh_budget());
        let degraded = Cell::new(false);
        let mut record = ChapterRecord::new(index);

        let mut previous_layer = String::new();
        for layer in DraftLayer::ORDER {
            let prompt = self.render(
                node,
                layer.prompt_key(),
                [
                    ("base_context", base_context(state)),
                    ("chapter_number", index.to_string()),
                    ("total_chapters", state.total_chapters.to_string()),
                    (
                        "words_per_chapter",
                        self.config.words_per_chapter.to_string(),
                    ),
                    ("chapter_brief", brief.clone()),
                    ("previous_excerpt", previous_excerpt.clone()),
                    ("previous_layer", previous_layer.clone()),
                    ("retrieval_context", retrieval_context.clone()),
                ],
            )?;
            let (text, layer_degraded) = self.generate_scoped(node, StageKind::Drafting, &prompt, &budget);
            degraded.set(degraded.get() || layer_degraded);
            record.draft_stages.push(DraftStage {
                layer,
                text: text.clone(),
            });
            previous_layer = text;
        }

        let initial = previous_layer.clone();
        let (final_text, history) = self.config.chapter_loop.run(
            || Ok(initial),
            |draft| {
                let prompt = self.render(
                    node,
                    "critique_chapter",
                    [
                        ("base_context", base_context(state)),
                        ("chapter_brief", brief.clone()),
                        ("draft", draft.to_string()),
                    ],
                )?;
                let (text, call_degraded) =
                    self.generate_scoped(node, StageKind::Critique, &prompt, &budget);
                degraded.set(degraded.get() || call_degraded);
                Ok(text)
            },
            |_draft, critique| self.judge_complete(node, critique),
            |draft, critique| {
                let prompt = self.render(
                    node,
                    "revise_chapter",
                    [
                        ("base_context", base_context(state)),
                        ("draft", draft.to_string()),
                        ("critique", critique.to_string()),
                    ],
                )?;
                let (text, call_degraded) =
                    self.generate_scoped(node, StageKind::Critique, &prompt, &budget);
                degraded.set(degraded.get() || call_degraded);
                Ok(text)
            },
        )?;

        if history.iter().all(|record| !record.complete) {
            self.log(
                LogLevel::Warn,
                Some(node),
                format!(
                    "chapter {index} accepted without convergence after {} iterations",
                    history.len()
                ),
            );
        }

        record.final_text = Some(final_text);
        record.revisions = history;
        record.degraded = degraded.get();

        Ok(StateDelta {
            push_chapter: Some(record),
            ..StateDelta::default()
        })
    }

    fn node_advance_chapter(&self, state: &WorkflowState) -> StateDelta {
        let mut delta = StateDelta::default();
        if (state.finalized_chapters() as u32) < state.total_chapters {
            delta.current_chapter_index = Some(state.current_chapter_index + 1);
        }
        delta
    }

    fn node_finalize_story(&self, state: &WorkflowState) -> Result<StateDelta, EngineError> {
        let node = NodeId::FinalizeStory;
        let mut body = String::new();
        let mut chapters: Vec<&ChapterRecord> = state.chapters.iter().collect();
        chapters.sort_by_key(|chapter| chapter.index);
        for chapter in chapters {
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(&format!("Chapter {}\n\n", chapter.index));
            body.push_str(chapter.final_text.as_deref().unwrap_or(""));
        }

        let prompt = self.render(
            node,
            "finalize_story",
            [
                ("base_context", base_context(state)),
                ("outline", state.outline.clone().unwrap_or_default()),
                ("manuscript_head", head_chars(&body, MANUSCRIPT_HEAD_CHARS)),
            ],
        )?;
        let (front_matter, _) = self.generate_fresh(node, StageKind::Foundation, &prompt);

        Ok(StateDelta {
            final_manuscript: Some(format!("{front_matter}\n\n{body}")),
            ..StateDelta::default()
        })
    }

    // --- helpers ---

    fn render<I, K, V>(&self, node: NodeId, key: &str, args: I) -> Result<String, EngineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.prompts
            .render_with(key, args)
            .map_err(|source| EngineError::Prompt { node, source })
    }

    fn judge_complete(&self, node: NodeId, critique: &str) -> Result<bool, EngineError> {
        let prompt = self.render(node, "judge_complete", [("critique", critique.to_string())])?;
        let (verdict, call_degraded) = self.generate_fresh(node, StageKind::Critique, &prompt);
        // A degraded judge never approves; the iteration ceiling still ends
        // the loop.
        Ok(!call_degraded && parse_judgement(&verdict))
    }

    fn chapter_brief(&self, state: &WorkflowState, index: u32) -> String {
        let outline_text = state.outline.as_deref().unwrap_or("");
        match parse_outline(outline_text) {
            OutlineParse::Structured(ref beats) => beats
                .iter()
                .find(|beat| beat.number == index)
                .map(format_beat)
                .unwrap_or_else(|| {
                    format!("Chapter {index} of {}.", state.total_chapters)
                }),
            OutlineParse::Unclassified(raw) => format!(
                "Chapter {index} of {}. Outline (unstructured):\n{}",
                state.total_chapters,
                head_chars(&raw, 1_000)
            ),
        }
    }

    fn fresh_budget(&self) -> RetryBudget {
        RetryBudget {
            remaining: self.config.retry.max_attempts.max(1),
        }
    }

    /// Generation with a budget refreshed for this single call.
    fn generate_fresh(&self, node: NodeId, stage: StageKind, prompt: &str) -> (String, bool) {
        let mut budget = self.fresh_budget();
        self.generate(node, stage, prompt, &mut budget)
    }

    /// Generation honoring the configured retry scope: `PerStage` refreshes
    /// the budget, `PerChapter` draws down the shared one.
    fn generate_scoped(
        &self,
        node: NodeId,
        stage: StageKind,
        prompt: &str,
        shared: &RefCell<RetryBudget>,
    ) -> (String, bool) {
        match self.config.retry_scope {
            RetryScope::PerStage => self.generate_fresh(node, stage, prompt),
            RetryScope::PerChapter => {
                let mut budget = shared.borrow_mut();
                self.generate(node, stage, prompt, &mut budget)
            }
        }
    }

    fn generate(
        &self,
        node: NodeId,
        stage: StageKind,
        prompt: &str,
        budget: &mut RetryBudget,
    ) -> (String, bool) {
        let handle = self.bindings.handle_for(stage);
        let mut attempt = 0u32;
        while budget.remaining > 0 {
            budget.remaining -= 1;
            attempt += 1;
            match self.backend.complete(handle, prompt) {
                Ok(response) => {
                    let cleaned = response.replace("```", "").trim().to_string();
                    if !cleaned.is_empty() {
                        return (cleaned, false);
                    }
                    self.log(
                        LogLevel::Warn,
                        Some(node),
                        format!("{stage} call returned empty content (attempt {attempt})"),
                    );
                }
                Err(err) => {
                    self.log(
                        LogLevel::Warn,
                        Some(node),
                        format!("{stage} call failed (attempt {attempt}): {err}"),
                    );
                }
            }
        }

        self.log(
            LogLevel::Error,
            Some(node),
            "retry budget exhausted, substituting placeholder",
        );
        (
            degraded_placeholder(node, self.config.retry.max_attempts),
            true,
        )
    }

    fn log(&self, level: LogLevel, node: Option<NodeId>, message: impl Into<String>) {
        let event = match node {
            Some(node) => LogEvent::for_node(level, node.label(), message),
            None => LogEvent::new(level, message),
        };
        self.sink.emit(event);
    }
}

fn base_context(state: &WorkflowState) -> String {
    state.base_prompt_context.clone().unwrap_or_default()
}

fn format_beat(beat: &OutlineBeat) -> String {
    format!(
        "Chapter {} - {}\nRole: {}\nPurpose: {}\nSummary: {}",
        beat.number, beat.title, beat.role, beat.purpose, beat.summary
    )
}

fn head_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn tail_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(limit)).collect()
}
