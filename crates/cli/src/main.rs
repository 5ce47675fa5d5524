use clap::{Args, Parser, Subcommand, ValueEnum};
use longform_adapters::{build_generation_client, AdapterError};
use longform_core::prompts::{HEALTH_PROBE, REQUIRED_KEYS};
use longform_core::{
    stage_status, BatchPipeline, CancellationToken, ChatMessage, Config, ConfigError,
    ContextError, ContextWindowBuilder, DraftExpander, ExpansionWorker, FsArtifactStore,
    GenerationClient, GenerationRequest, LogLevel, LogRecord, LogSink, ModelClass,
    OutlineGenerator, PipelineError, Project, ProjectError, PromptError, PromptRegistry,
    RunOptions, RunReport, SharedLogSink, Stage, StageLayout, StdoutLogSink,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

const EXIT_PARTIAL: i32 = 2;
const DEFAULT_REGENERATE_WORKERS: usize = 4;

fn main() {
    match run() {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, CliError> {
    let cli = Cli::parse();
    let sink: SharedLogSink = Arc::new(StdoutLogSink::with_min_level(LogLevel::Info));
    install_log_bridge();

    match cli.command {
        Command::Outline(command) => handle_outline(&cli.config, command, sink),
        Command::Expand(command) => handle_expand(&cli.config, command, sink),
        Command::Status(args) => run_status(&cli.config, args, sink.as_ref()),
        Command::Providers(command) => handle_providers(&cli.config, command, sink),
    }
}

fn handle_outline(
    config_path: &Path,
    command: OutlineCommand,
    sink: SharedLogSink,
) -> Result<i32, CliError> {
    match command {
        OutlineCommand::Run(args) => run_outline(config_path, args, sink),
    }
}

fn handle_expand(
    config_path: &Path,
    command: ExpandCommand,
    sink: SharedLogSink,
) -> Result<i32, CliError> {
    match command {
        ExpandCommand::Run(args) => run_expand(config_path, args, sink),
        ExpandCommand::Regenerate(args) => run_regenerate(config_path, args, sink),
    }
}

fn handle_providers(
    config_path: &Path,
    command: ProvidersCommand,
    sink: SharedLogSink,
) -> Result<i32, CliError> {
    match command {
        ProvidersCommand::Check(args) => run_providers_check(config_path, args, sink),
    }
}

/// Everything a generation command needs, loaded once.
struct Session {
    config: Config,
    client: GenerationClient,
    prompts: PromptRegistry,
    project: Project,
    store: FsArtifactStore,
}

impl Session {
    fn open(config_path: &Path, sink: &SharedLogSink) -> Result<Self, CliError> {
        let config = Config::load(config_path)?;
        let client = build_generation_client(&config, Arc::clone(sink))?;
        let prompts = PromptRegistry::from_prompt_config(&config.prompts)?;
        prompts.require(&REQUIRED_KEYS)?;
        let project = Project::load(&config.paths)?;
        Ok(Self {
            config,
            client,
            prompts,
            project,
            store: FsArtifactStore::new(),
        })
    }

    fn options(&self, overrides: &RunArgs) -> RunOptions {
        let mut options = RunOptions::from_settings(&self.config.generation);
        if let Some(batch_size) = overrides.batch_size {
            options.batch_size = batch_size.max(1);
        }
        options.fail_fast |= overrides.fail_fast;
        options
    }

    fn window(&self) -> Result<ContextWindowBuilder, CliError> {
        Ok(ContextWindowBuilder::from_settings(&self.config.generation)?)
    }

    fn layout(&self, stage: Stage) -> StageLayout {
        StageLayout::from_paths(stage, &self.config.paths)
    }
}

fn run_outline(config_path: &Path, args: OutlineRunArgs, sink: SharedLogSink) -> Result<i32, CliError> {
    let session = Session::open(config_path, &sink)?;
    let total = session.project.outline.total_units()?;
    let mut options = session.options(&args.run);
    options.accept_unit_count_change = args.accept_unit_count_change;

    log_info(
        sink.as_ref(),
        format!("开始生成章节大纲：共 {total} 章，每批 {} 章", options.batch_size),
    );

    let generator = OutlineGenerator::new(
        &session.client,
        &session.prompts,
        &session.project,
        sink.as_ref(),
    )
    .with_settings(&session.config.generation);
    let pipeline = BatchPipeline::new(
        session.layout(Stage::Outline),
        &generator,
        &session.store,
        session.window()?,
        sink.as_ref(),
    )
    .with_options(options);
    install_interrupt_handler(pipeline.cancellation_token());

    let report = pipeline.run(total)?;
    Ok(finish(&report, sink.as_ref()))
}

fn run_expand(config_path: &Path, args: ExpandRunArgs, sink: SharedLogSink) -> Result<i32, CliError> {
    let session = Session::open(config_path, &sink)?;
    let total = session.project.outline.total_units()?;
    let range = match (args.unit, args.start, args.end) {
        (Some(unit), _, _) => unit..=unit,
        (None, Some(start), Some(end)) => start..=end,
        (None, None, None) => 1..=total,
        _ => return Err(CliError::IncompleteRange),
    };

    log_info(
        sink.as_ref(),
        format!(
            "开始扩写正文：第 {} 至 {} 章（共 {total} 章）",
            range.start(),
            range.end()
        ),
    );

    let expander = DraftExpander::new(
        &session.client,
        &session.prompts,
        &session.project,
        sink.as_ref(),
    )
    .with_settings(&session.config.generation);
    let worker = ExpansionWorker::new(
        expander,
        &session.store,
        session.config.paths.resolve(&session.config.paths.outline_dir),
    );
    let pipeline = BatchPipeline::new(
        session.layout(Stage::Expansion),
        &worker,
        &session.store,
        session.window()?,
        sink.as_ref(),
    )
    .with_options(session.options(&args.run));
    install_interrupt_handler(pipeline.cancellation_token());

    let report = pipeline.run_range(total, range)?;
    Ok(finish(&report, sink.as_ref()))
}

fn run_regenerate(
    config_path: &Path,
    args: RegenerateArgs,
    sink: SharedLogSink,
) -> Result<i32, CliError> {
    if args.start == 0 || args.start > args.end {
        return Err(CliError::InvalidUnits {
            start: args.start,
            end: args.end,
        });
    }
    let session = Session::open(config_path, &sink)?;
    let workers = args.workers.max(1);
    log_info(
        sink.as_ref(),
        format!(
            "重新扩写第 {} 至 {} 章，并发数 {workers}",
            args.start, args.end
        ),
    );

    let expander = DraftExpander::new(
        &session.client,
        &session.prompts,
        &session.project,
        sink.as_ref(),
    )
    .with_settings(&session.config.generation);
    let worker = ExpansionWorker::new(
        expander,
        &session.store,
        session.config.paths.resolve(&session.config.paths.outline_dir),
    );
    let pipeline = BatchPipeline::new(
        session.layout(Stage::Expansion),
        &worker,
        &session.store,
        session.window()?,
        sink.as_ref(),
    );
    install_interrupt_handler(pipeline.cancellation_token());

    let indices: Vec<u32> = (args.start..=args.end).collect();
    let report = pipeline.regenerate(&indices, workers)?;
    Ok(finish(&report, sink.as_ref()))
}

fn run_status(config_path: &Path, args: StatusArgs, sink: &dyn LogSink) -> Result<i32, CliError> {
    let config = Config::load(config_path)?;
    let store = FsArtifactStore::new();
    let stages = match args.stage {
        Some(stage) => vec![stage.into()],
        None => vec![Stage::Outline, Stage::Expansion],
    };

    for stage in stages {
        let status = stage_status(&StageLayout::from_paths(stage, &config.paths), &store)?;
        match &status.checkpoint {
            Some(checkpoint) => log_info(
                sink,
                format!(
                    "[{}] 已完成 {}/{} 章，摘要 {} 条，最近运行 {}（{}）",
                    stage.label(),
                    checkpoint.last_completed_unit_index,
                    checkpoint.total_units,
                    status.summaries,
                    checkpoint.run_id,
                    checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S"),
                ),
            ),
            None => log_info(sink, format!("[{}] 尚未开始", stage.label())),
        }
        for (index, entry) in status.ledger.iter() {
            sink.log(LogRecord::new(
                LogLevel::Warn,
                format!(
                    "[{}] 第 {index} 章待重试（已尝试 {} 次）：{}",
                    stage.label(),
                    entry.attempts,
                    entry.reason
                ),
            ));
        }
    }
    Ok(0)
}

fn run_providers_check(
    config_path: &Path,
    args: ProvidersCheckArgs,
    sink: SharedLogSink,
) -> Result<i32, CliError> {
    let config = Config::load(config_path)?;
    if let Some(name) = &args.provider {
        if config.get_provider(name).is_none() {
            return Err(CliError::UnknownProvider(name.clone()));
        }
    }
    let client = build_generation_client(&config, Arc::clone(&sink))?;
    let prompts = PromptRegistry::from_prompt_config(&config.prompts)?;
    let probe = GenerationRequest::new(
        ModelClass::Planning,
        vec![ChatMessage::user(
            prompts.format_with(HEALTH_PROBE, Vec::<(String, String)>::new())?,
        )],
    )
    .with_max_tokens(16);

    let reports = match &args.provider {
        Some(name) => vec![client
            .health_check_provider(name, &probe)
            .ok_or_else(|| CliError::UnroutedProvider(name.clone()))?],
        None => client.health_check(&probe),
    };

    let mut failures = 0;
    for report in &reports {
        match &report.result {
            Ok(latency) => log_info(
                sink.as_ref(),
                format!(
                    "✅ {}（{}）连接正常，耗时 {} ms，熔断状态 {}",
                    report.provider,
                    report.model,
                    latency.as_millis(),
                    report.circuit
                ),
            ),
            Err(err) => {
                failures += 1;
                sink.log(LogRecord::new(
                    LogLevel::Error,
                    format!("❌ {}（{}）连接失败：{err}", report.provider, report.model),
                ));
            }
        }
    }
    Ok(if failures == 0 { 0 } else { EXIT_PARTIAL })
}

fn finish(report: &RunReport, sink: &dyn LogSink) -> i32 {
    log_info(
        sink,
        format!(
            "[{}] 运行 {} 结束：成功 {} 章，跳过 {} 章，修复 {} 章，失败 {} 章，检查点 {}/{}",
            report.stage.label(),
            report.run_id,
            report.succeeded.len(),
            report.skipped.len(),
            report.healed.len(),
            report.failed.len(),
            report.checkpoint,
            report.total_units,
        ),
    );
    for failure in &report.failed {
        sink.log(LogRecord::new(
            LogLevel::Error,
            format!("第 {} 章失败：{}", failure.index, failure.reason),
        ));
    }
    if report.cancelled {
        sink.log(LogRecord::new(
            LogLevel::Warn,
            "运行已被中断，下次运行将从检查点继续。".to_string(),
        ));
    }

    if report.is_complete() {
        0
    } else {
        EXIT_PARTIAL
    }
}

fn log_info(sink: &dyn LogSink, message: String) {
    sink.log(LogRecord::new(LogLevel::Info, message));
}

/// Ctrl-C cancels the run between units; the unit in flight still finishes.
fn install_interrupt_handler(token: CancellationToken) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                log::warn!("failed to start the interrupt listener: {err}");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("收到中断信号，当前章节完成后停止……");
                token.cancel();
            }
        });
    });
}

/// Forwards `log` macros from the adapters into the stdout sink.
struct SinkLogger;

static LOGGER: SinkLogger = SinkLogger;

impl log::Log for SinkLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Trace => LogLevel::Trace,
        };
        StdoutLogSink::new().log(LogRecord::new(level, record.args().to_string()));
    }

    fn flush(&self) {}
}

fn install_log_bridge() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置文件错误: {0}")]
    Config(#[from] ConfigError),
    #[error("项目文件错误: {0}")]
    Project(#[from] ProjectError),
    #[error("提示词加载失败: {0}")]
    Prompt(#[from] PromptError),
    #[error("上下文窗口配置错误: {0}")]
    Context(#[from] ContextError),
    #[error("适配器初始化失败: {0}")]
    Adapter(#[from] AdapterError),
    #[error("流水线执行失败: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("--start 与 --end 必须同时指定")]
    IncompleteRange,
    #[error("章节范围无效：{start}-{end}")]
    InvalidUnits { start: u32, end: u32 },
    #[error("未找到名为 `{0}` 的接口配置")]
    UnknownProvider(String),
    #[error("接口 `{0}` 未出现在任何路由中")]
    UnroutedProvider(String),
}

#[derive(Parser)]
#[command(
    name = "longformctl",
    version,
    about = "长篇小说分批大纲与正文生成命令行工具"
)]
struct Cli {
    /// 指定配置文件路径
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 章节大纲相关操作
    #[command(subcommand)]
    Outline(OutlineCommand),
    /// 正文扩写相关操作
    #[command(subcommand)]
    Expand(ExpandCommand),
    /// 查看检查点与待重试章节
    Status(StatusArgs),
    /// 接口相关操作
    #[command(subcommand)]
    Providers(ProvidersCommand),
}

#[derive(Subcommand)]
enum OutlineCommand {
    /// 生成或续跑全部章节大纲
    Run(OutlineRunArgs),
}

#[derive(Subcommand)]
enum ExpandCommand {
    /// 扩写正文，默认从检查点继续
    Run(ExpandRunArgs),
    /// 并行重新扩写已完成的章节
    Regenerate(RegenerateArgs),
}

#[derive(Subcommand)]
enum ProvidersCommand {
    /// 探测各接口的连通性
    Check(ProvidersCheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// 任一章节失败即停止
    #[arg(long)]
    fail_fast: bool,
    /// 每批生成的章节数，默认使用配置
    #[arg(long, value_name = "N")]
    batch_size: Option<u32>,
}

#[derive(Args)]
struct OutlineRunArgs {
    #[command(flatten)]
    run: RunArgs,
    /// 总章节数变化时仍继续运行
    #[arg(long)]
    accept_unit_count_change: bool,
}

#[derive(Args)]
struct ExpandRunArgs {
    #[command(flatten)]
    run: RunArgs,
    /// 仅扩写指定章节
    #[arg(long, value_name = "N", conflicts_with_all = ["start", "end"])]
    unit: Option<u32>,
    /// 起始章节
    #[arg(long, value_name = "A", requires = "end")]
    start: Option<u32>,
    /// 结束章节
    #[arg(long, value_name = "B", requires = "start")]
    end: Option<u32>,
}

#[derive(Args)]
struct RegenerateArgs {
    /// 起始章节
    #[arg(long, value_name = "A")]
    start: u32,
    /// 结束章节
    #[arg(long, value_name = "B")]
    end: u32,
    /// 并发数
    #[arg(long, value_name = "N", default_value_t = DEFAULT_REGENERATE_WORKERS)]
    workers: usize,
}

#[derive(Args)]
struct StatusArgs {
    /// 仅查看指定阶段
    #[arg(long, value_enum)]
    stage: Option<StageArg>,
}

#[derive(Args)]
struct ProvidersCheckArgs {
    /// 仅探测指定接口
    #[arg(long, value_name = "NAME")]
    provider: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StageArg {
    Outline,
    Expand,
}

impl From<StageArg> for Stage {
    fn from(value: StageArg) -> Self {
        match value {
            StageArg::Outline => Stage::Outline,
            StageArg::Expand => Stage::Expansion,
        }
    }
}
