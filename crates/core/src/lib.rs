pub mod client;
pub mod config;
pub mod context;
pub mod generator;
pub mod logging;
pub mod pipeline;
pub mod project;
pub mod prompts;
pub mod request;
pub mod store;
pub mod unit;

pub use client::{
    CircuitState, Clock, GenerationClient, GenerationClientBuilder, GenerationError,
    HealthReport, ManualClock, ProviderAdapter, ProviderError, ProviderOptions, ProviderOutcome,
    ProviderReport, RetryPolicy, SystemClock,
};
pub use config::{
    CircuitSettings, Config, ConfigError, GenerationSettings, PathSettings, PromptConfig,
    ProviderConfig, RateLimitConfig, RetrySettings,
};
pub use context::{build_window, ContextError, ContextWindow, ContextWindowBuilder, SummaryStore};
pub use generator::{
    DraftExpander, ExpansionWorker, OutlineGenerator, UnitError, UnitProduct, UnitWorker,
};
pub use logging::{
    GenerationEvent, LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StdoutLogSink,
    VecLogSink,
};
pub use pipeline::{
    paginate, stage_status, BatchPipeline, CancellationToken, Checkpoint, FailureEntry,
    FailureLedger, PipelineError, RunOptions, RunReport, RunState, StageLayout, StageStatus,
    UnitFailure,
};
pub use project::{CoreSetting, OverallOutline, Project, ProjectError};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptSource, PromptTemplate};
pub use request::{ChatMessage, GenerationOutput, GenerationRequest, ModelClass, Role};
pub use store::{ArtifactStore, FsArtifactStore, StoreError};
pub use unit::{Stage, UnitOutline, UnitSummary};
