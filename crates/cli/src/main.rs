use clap::{Args, Parser, Subcommand};
use fabula_adapters::{AdapterError, HttpCompletionBackend, HttpEmbedder};
use fabula_core::retrieval::{RetrievalConfig, RetrievalIndex};
use fabula_core::{
    CheckpointError, CheckpointStore, ConsoleSink, Embedder, EngineConfig, EngineError, LogSink,
    PromptCatalog, PromptError, ProviderBindings, ProviderHandle, ProviderResolutionError,
    RetryPolicy, RetryScope, RevisionLoop, RunReport, SessionStatus, StageKind, WorkflowEngine,
};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let sink = ConsoleSink::new();

    match cli.command {
        Command::Run(args) => run_session(args, &sink),
        Command::Resume(args) => resume_session(args, &sink),
        Command::Sessions(args) => list_sessions(args),
        Command::Delete(args) => delete_session(args),
    }
}

fn run_session(args: RunArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let initial_prompt = read_initial_prompt(&args)?;
    let store = open_store(&args.engine);
    let prompts = load_prompts(&args.engine)?;
    let bindings = build_bindings(&args.engine)?;
    let backend = HttpCompletionBackend::new()?;
    let retrieval = build_retrieval(&args.engine, sink)?;

    let engine = WorkflowEngine::new(&backend, bindings, &prompts, &store, sink)
        .with_config(engine_config(&args.engine))
        .with_retrieval(retrieval);

    let report = engine.start(&initial_prompt)?;
    finish(&store, report, args.output.as_deref())
}

fn resume_session(args: ResumeArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let store = open_store(&args.engine);
    let prompts = load_prompts(&args.engine)?;
    let bindings = build_bindings(&args.engine)?;
    let backend = HttpCompletionBackend::new()?;
    let retrieval = build_retrieval(&args.engine, sink)?;

    let engine = WorkflowEngine::new(&backend, bindings, &prompts, &store, sink)
        .with_config(engine_config(&args.engine))
        .with_retrieval(retrieval);

    let report = engine.resume(&args.session_id)?;
    finish(&store, report, args.output.as_deref())
}

fn list_sessions(args: SessionsArgs) -> Result<(), CliError> {
    let store = CheckpointStore::new(&args.checkpoints);
    let summaries = store.list()?;
    if summaries.is_empty() {
        println!("no sessions under {}", args.checkpoints.display());
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{}  {}  last node: {}  {}",
            summary.session_id, summary.status, summary.last_completed_node, summary.created_at
        );
    }
    Ok(())
}

fn delete_session(args: DeleteArgs) -> Result<(), CliError> {
    let store = CheckpointStore::new(&args.checkpoints);
    store.delete(&args.session_id)?;
    println!("deleted session {}", args.session_id);
    Ok(())
}

fn finish(
    store: &CheckpointStore,
    report: RunReport,
    output: Option<&std::path::Path>,
) -> Result<(), CliError> {
    println!(
        "session {} finished with status {} ({} node transitions)",
        report.session_id, report.status, report.transitions
    );

    if report.status != SessionStatus::Completed {
        if report.status == SessionStatus::Interrupted {
            println!("resume with: fabula resume {}", report.session_id);
        }
        return Ok(());
    }

    let checkpoint = store.load(&report.session_id)?;
    let Some(manuscript) = checkpoint.state.final_manuscript else {
        return Err(CliError::MissingManuscript(report.session_id));
    };

    match output {
        Some(path) => {
            fs::write(path, &manuscript).map_err(|source| CliError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            println!("manuscript written to {}", path.display());
        }
        None => println!("{manuscript}"),
    }
    Ok(())
}

fn read_initial_prompt(args: &RunArgs) -> Result<String, CliError> {
    let text = match (&args.prompt, &args.prompt_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => fs::read_to_string(path).map_err(|source| CliError::Io {
            path: path.clone(),
            source,
        })?,
        (None, None) => return Err(CliError::MissingPrompt),
    };
    if text.trim().is_empty() {
        return Err(CliError::MissingPrompt);
    }
    Ok(text)
}

fn open_store(args: &EngineArgs) -> CheckpointStore {
    let store = CheckpointStore::new(&args.checkpoints);
    if args.retain_history {
        store.with_history()
    } else {
        store
    }
}

fn load_prompts(args: &EngineArgs) -> Result<PromptCatalog, CliError> {
    Ok(PromptCatalog::with_overrides(&args.prompt_dir)?)
}

fn build_bindings(args: &EngineArgs) -> Result<ProviderBindings, CliError> {
    let default = ProviderHandle::resolve(&args.provider)?;
    let mut bindings = ProviderBindings::new(default);
    if let Some(uri) = &args.drafting_provider {
        bindings = bindings.bind(StageKind::Drafting, ProviderHandle::resolve(uri)?);
    }
    if let Some(uri) = &args.critique_provider {
        bindings = bindings.bind(StageKind::Critique, ProviderHandle::resolve(uri)?);
    }
    Ok(bindings)
}

fn build_retrieval(args: &EngineArgs, sink: &dyn LogSink) -> Result<RetrievalIndex, CliError> {
    let Some(dir) = &args.knowledge else {
        return Ok(RetrievalIndex::empty());
    };
    let Some(uri) = &args.embedding_provider else {
        return Err(CliError::MissingEmbeddingProvider);
    };
    let handle = ProviderHandle::resolve(uri)?;
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(handle)?);
    Ok(RetrievalIndex::build(
        Some(dir),
        Some(embedder),
        RetrievalConfig::default(),
        sink,
    ))
}

fn engine_config(args: &EngineArgs) -> EngineConfig {
    EngineConfig {
        total_chapters: args.chapters,
        words_per_chapter: args.words,
        outline_loop: RevisionLoop::new(args.outline_min_revisions, args.outline_max_revisions),
        chapter_loop: RevisionLoop::new(args.chapter_min_revisions, args.chapter_max_revisions),
        retry: RetryPolicy {
            max_attempts: args.retry,
        },
        retry_scope: args.retry_scope.into(),
        ..EngineConfig::default()
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("provide a story request with --prompt or --prompt-file")]
    MissingPrompt,
    #[error("--knowledge requires --embedding-provider")]
    MissingEmbeddingProvider,
    #[error("session {0} completed without a final manuscript")]
    MissingManuscript(String),
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid provider: {0}")]
    Provider(#[from] ProviderResolutionError),
    #[error("prompt catalog error: {0}")]
    Prompt(#[from] PromptError),
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("workflow error: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Parser)]
#[command(name = "fabula", version, about = "Resumable long-form story generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new generation session and run it to completion
    Run(RunArgs),
    /// Resume an interrupted or failed session from its checkpoint
    Resume(ResumeArgs),
    /// List checkpointed sessions
    Sessions(SessionsArgs),
    /// Delete a session and its checkpoints
    Delete(DeleteArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Story request text
    #[arg(long, value_name = "TEXT")]
    prompt: Option<String>,
    /// File containing the story request
    #[arg(long, value_name = "FILE")]
    prompt_file: Option<PathBuf>,
    /// Write the final manuscript here instead of stdout
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args)]
struct ResumeArgs {
    /// Session to resume
    session_id: String,
    /// Write the final manuscript here instead of stdout
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args)]
struct SessionsArgs {
    /// Checkpoint directory
    #[arg(long, default_value = "sessions")]
    checkpoints: PathBuf,
}

#[derive(Args)]
struct DeleteArgs {
    /// Session to delete
    session_id: String,
    /// Checkpoint directory
    #[arg(long, default_value = "sessions")]
    checkpoints: PathBuf,
}

#[derive(Args)]
struct EngineArgs {
    /// Default provider URI, scheme://model[@host[:port]]
    #[arg(long, default_value = "ollama://qwen2.5")]
    provider: String,
    /// Provider override for chapter drafting
    #[arg(long, value_name = "URI")]
    drafting_provider: Option<String>,
    /// Provider override for critique and revision calls
    #[arg(long, value_name = "URI")]
    critique_provider: Option<String>,
    /// Number of chapters to target when the outline cannot decide
    #[arg(long, default_value_t = 3)]
    chapters: u32,
    /// Words per chapter to aim for
    #[arg(long, default_value_t = 2000)]
    words: u32,
    /// Checkpoint directory
    #[arg(long, default_value = "sessions")]
    checkpoints: PathBuf,
    /// Keep every checkpoint instead of only the latest
    #[arg(long)]
    retain_history: bool,
    /// Directories with prompt overrides, applied in order
    #[arg(long, value_name = "DIR")]
    prompt_dir: Vec<PathBuf>,
    /// Knowledge-base directory for retrieval context
    #[arg(long, value_name = "DIR")]
    knowledge: Option<PathBuf>,
    /// Embedding provider URI, required with --knowledge
    #[arg(long, value_name = "URI")]
    embedding_provider: Option<String>,
    /// Minimum outline revision iterations
    #[arg(long, default_value_t = 1, value_name = "N")]
    outline_min_revisions: u32,
    /// Maximum outline revision iterations
    #[arg(long, default_value_t = 3, value_name = "N")]
    outline_max_revisions: u32,
    /// Minimum chapter revision iterations
    #[arg(long, default_value_t = 1, value_name = "N")]
    chapter_min_revisions: u32,
    /// Maximum chapter revision iterations
    #[arg(long, default_value_t = 3, value_name = "N")]
    chapter_max_revisions: u32,
    /// Generation attempts per call before degrading to a placeholder
    #[arg(long, default_value_t = 3, value_name = "N")]
    retry: u32,
    /// Whether the retry budget refreshes per stage or spans a chapter
    #[arg(long, value_enum, default_value_t = RetryScopeArg::PerStage)]
    retry_scope: RetryScopeArg,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum RetryScopeArg {
    PerStage,
    PerChapter,
}

impl From<RetryScopeArg> for RetryScope {
    fn from(value: RetryScopeArg) -> Self {
        match value {
            RetryScopeArg::PerStage => RetryScope::PerStage,
            RetryScopeArg::PerChapter => RetryScope::PerChapter,
        }
    }
}
