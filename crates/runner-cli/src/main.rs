use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use runner_backend::mock::MatchedMockRuntime;
use runner_backend::ModelRuntime;
use runner_backend_llamacpp::LlamaCppBackend;
use runner_common::config::RunnerConfig;
use runner_core::{Engine, GenerationConfig, GenerationEvent, PagedKvCache, SamplingConfig};
use tokio_stream::StreamExt as _;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_OK: u8 = 0;
const EXIT_BAD_CONFIG: u8 = 64;
const EXIT_MODEL_LOAD_FAILURE: u8 = 69;
const EXIT_INTERNAL_ERROR: u8 = 70;

#[derive(Parser, Debug)]
#[command(name = "runner", version, about = "Speculative-decoding inference runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server.
    Serve(ServeArgs),
    /// Run one generation locally through the engine, bypassing HTTP.
    Run(RunArgs),
    List,
    Stats,
    Pull(PullArgs),
    Version,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long)]
    prompt: String,
    #[arg(short = 'n', long, default_value_t = 128)]
    max_tokens: usize,
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = 4)]
    speculation_depth: usize,
    #[arg(long, default_value_t = true)]
    adaptive: bool,
}

#[derive(Args, Debug)]
struct PullArgs {
    /// Source URL (hf://org/repo/file or https URL)
    source: String,
    /// Optional model name to save under models/<name>.gguf
    #[arg(short, long)]
    name: Option<String>,
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().expect("failed to start the tokio runtime");
    rt.block_on(dispatch(cli.command))
}

async fn dispatch(command: Commands) -> ExitCode {
    match command {
        Commands::Serve(args) => serve(args).await,
        Commands::Run(args) => run_local(args).await,
        Commands::List => list_models().await,
        Commands::Pull(args) => pull_model(args).await,
        Commands::Stats => stats().await,
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            ExitCode::from(EXIT_OK)
        }
    }
}

fn load_config() -> Result<RunnerConfig, ExitCode> {
    RunnerConfig::load().map_err(|e| {
        eprintln!("bad config: {e}");
        ExitCode::from(EXIT_BAD_CONFIG)
    })
}

/// Builds the runtime this binary serves. `RUNNER_MODEL` pointing at a
/// real model file selects `runner-backend-llamacpp`; otherwise the
/// deterministic mock stands in, same as the teacher's own backend
/// selection by environment variable. The engine never knows which it's
/// talking to.
fn load_runtime(cfg: &RunnerConfig) -> Result<Arc<dyn ModelRuntime>, ExitCode> {
    if let Ok(model_path) = std::env::var("RUNNER_MODEL") {
        let backend = LlamaCppBackend::new();
        let n_ctx = cfg.context_size.unwrap_or(4096);
        return match backend.load_model(&model_path, n_ctx) {
            Ok(()) => Ok(Arc::new(backend)),
            Err(e) => {
                eprintln!("model load failure: {e}");
                Err(ExitCode::from(EXIT_MODEL_LOAD_FAILURE))
            }
        };
    }
    let _ = &cfg.model_dir;
    Ok(Arc::new(MatchedMockRuntime::new(32_000)))
}

async fn serve(args: ServeArgs) -> ExitCode {
    let cfg = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let runtime = match load_runtime(&cfg) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let addr: std::net::SocketAddr = match args.addr.parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("bad config: invalid --addr: {e}");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };

    let router = runner_api::app(runtime, Arc::new(cfg), true);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("internal error: failed to bind {addr}: {e}");
            return ExitCode::from(EXIT_INTERNAL_ERROR);
        }
    };

    tracing::info!(%addr, "listening");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    match axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            eprintln!("internal error: {e}");
            ExitCode::from(EXIT_INTERNAL_ERROR)
        }
    }
}

/// Drives exactly one generation through the engine directly, no HTTP
/// involved — the smoke-test path for checking a runtime end to end.
async fn run_local(args: RunArgs) -> ExitCode {
    let cfg = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let runtime = match load_runtime(&cfg) {
        Ok(r) => r,
        Err(code) => return code,
    };

    let cache = Arc::new(PagedKvCache::new(cfg.block_size, cfg.n_blocks));
    let engine = Engine::new(runtime, cache, Arc::new(cfg));

    let gen_cfg = GenerationConfig {
        max_tokens: args.max_tokens,
        sampling: SamplingConfig { temperature: args.temperature, top_k: None, top_p: None, seed: args.seed },
        speculation_depth: args.speculation_depth,
        use_speculative: args.speculation_depth > 0,
        adaptive: args.adaptive,
        stop_strings: vec![],
    };

    let mut submission = match engine.submit(args.prompt, gen_cfg, args.seed) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("internal error: {e}");
            return ExitCode::from(EXIT_INTERNAL_ERROR);
        }
    };

    let mut saw_error = false;
    while let Some(ev) = submission.events.next().await {
        match ev {
            GenerationEvent::Token { text, .. } => print!("{text}"),
            GenerationEvent::Done { reason, .. } => {
                println!();
                tracing::info!(?reason, "generation finished");
            }
            GenerationEvent::Error { kind, message, .. } => {
                eprintln!("generation error [{kind}]: {message}");
                saw_error = true;
            }
            GenerationEvent::Metrics { .. } => {}
        }
    }

    if saw_error {
        ExitCode::from(EXIT_INTERNAL_ERROR)
    } else {
        ExitCode::from(EXIT_OK)
    }
}

async fn list_models() -> ExitCode {
    let cfg = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let path = cfg.model_dir;
    match std::fs::read_dir(&path) {
        Ok(read_dir) => {
            println!("models dir: {}", path.display());
            for entry in read_dir.flatten() {
                println!("- {}", entry.path().display());
            }
        }
        Err(_) => println!("no models directory at {}", path.display()),
    }
    ExitCode::from(EXIT_OK)
}

async fn stats() -> ExitCode {
    use sysinfo::{CpuExt, System, SystemExt};
    let mut sys = System::new_all();
    sys.refresh_all();
    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let cpu_avg: f32 = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / (sys.cpus().len().max(1) as f32);
    println!("CPU: {cpu_avg:.1}%");
    println!("Memory: {} / {} MiB", used_mem / 1024 / 1024, total_mem / 1024 / 1024);
    ExitCode::from(EXIT_OK)
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).init();
}

async fn pull_model(args: PullArgs) -> ExitCode {
    let cfg = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let models_dir = cfg.model_dir;
    let _ = std::fs::create_dir_all(&models_dir);

    let (url, filename) = if let Some(rest) = args.source.strip_prefix("hf://") {
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() < 3 {
            eprintln!("bad config: invalid hf:// URL; expected hf://org/repo/file");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
        let org = parts[0];
        let repo = parts[1];
        let file = parts[2..].join("/");
        (format!("https://huggingface.co/{org}/{repo}/resolve/main/{file}"), file)
    } else {
        let fname = args.source.split('/').last().unwrap_or("model.gguf").to_string();
        (args.source, fname)
    };

    let name = args.name.unwrap_or_else(|| filename.clone());
    let target_path = models_dir.join(name);
    println!("Downloading to {}", target_path.display());

    match reqwest::get(&url).await {
        Ok(resp) => {
            if !resp.status().is_success() {
                eprintln!("model load failure: download status {}", resp.status());
                return ExitCode::from(EXIT_MODEL_LOAD_FAILURE);
            }
            let bytes = match resp.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("model load failure: {e}");
                    return ExitCode::from(EXIT_MODEL_LOAD_FAILURE);
                }
            };
            if let Err(e) = std::fs::write(&target_path, &bytes) {
                eprintln!("internal error: {e}");
                return ExitCode::from(EXIT_INTERNAL_ERROR);
            }
            println!("Saved {} bytes", bytes.len());
            ExitCode::from(EXIT_OK)
        }
        Err(e) => {
            eprintln!("model load failure: {e}");
            ExitCode::from(EXIT_MODEL_LOAD_FAILURE)
        }
    }
}
