//! Resumable long-form story generation.
//!
//! The engine in [`engine`] drives a fixed workflow of generation nodes
//! over a [`state::WorkflowState`], checkpointing after every node through
//! [`checkpoint::CheckpointStore`] so interrupted runs resume exactly where
//! they left off. Text generation goes through the [`backend`] seam;
//! concrete HTTP backends live in the adapters crate.

pub mod backend;
pub mod checkpoint;
pub mod engine;
pub mod logging;
pub mod outline;
pub mod prompts;
pub mod provider;
pub mod retrieval;
pub mod revision;
pub mod state;

pub use backend::{BackendError, CompletionBackend};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, SessionStatus, SessionSummary};
pub use engine::{
    EngineConfig, EngineError, ProviderBindings, RetryPolicy, RetryScope, RunReport, StageKind,
    StateDelta, Transition, WorkflowEngine,
};
pub use logging::{ConsoleSink, LogEvent, LogLevel, LogSink, MemorySink, NullSink, SharedSink};
pub use outline::{parse_outline, OutlineBeat, OutlineParse};
pub use prompts::{PromptArgs, PromptCatalog, PromptError, PromptTemplate};
pub use provider::{ProviderHandle, ProviderResolutionError, ProviderScheme};
pub use retrieval::{Embedder, EmbedderError, RetrievalConfig, RetrievalIndex};
pub use revision::{RevisionLoop, RevisionRecord};
pub use state::{ChapterRecord, DraftLayer, DraftStage, NodeId, WorkflowState};
