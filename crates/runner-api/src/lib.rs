//! HTTP API (C8 Streaming Transport + C10 Request API): the one place
//! that frames `GenerationEvent`s onto the wire. Validates inputs per the
//! external-interfaces table, maps them to a `GenerationConfig`, submits
//! to the engine, and routes its event stream out as NDJSON or a single
//! collected JSON response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt as _;

use runner_backend::ModelRuntime;
use runner_common::config::RunnerConfig;
use runner_common::RunnerError;
use runner_core::{Engine, GenerationEvent, PagedKvCache, StopReason};
use runner_obs::{Metrics, SystemStats};

mod ratelimit;
mod validate;

pub use ratelimit::{RateLimiter, TokenBudgets};
pub use validate::GenerationRequest;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
    metrics: Arc<Metrics>,
    config: Arc<RunnerConfig>,
    limiter: RateLimiter,
    budgets: TokenBudgets,
    model_loaded: bool,
}

/// Builds the full router for a runtime already loaded by the caller
/// (`runner-cli` owns choosing/loading the `ModelRuntime` impl; this
/// crate never picks a backend itself).
pub fn app(runtime: Arc<dyn ModelRuntime>, config: Arc<RunnerConfig>, model_loaded: bool) -> Router {
    let cache = Arc::new(PagedKvCache::new(config.block_size, config.n_blocks));
    let engine = Arc::new(Engine::new(runtime, cache, config.clone()));
    let metrics = Metrics::new();
    let sys_stats = SystemStats::new(metrics.registry());
    sys_stats.spawn_polling();

    let state = AppState {
        engine,
        metrics,
        config,
        limiter: RateLimiter::new(),
        budgets: TokenBudgets::new(),
        model_loaded,
    };

    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/metrics", get(metrics_handler))
        .route("/generate", post(generate))
        .route("/generate/stream", post(generate_stream))
        .route("/generate/batch", post(generate_batch))
        .with_state(state)
}

pub async fn serve(runtime: Arc<dyn ModelRuntime>, config: Arc<RunnerConfig>, model_loaded: bool, addr: SocketAddr) -> Result<(), RunnerError> {
    let router = app(runtime, config, model_loaded);
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| RunnerError::Internal(e.to_string()))?;
    axum::serve(listener, router).await.map_err(|e| RunnerError::Internal(e.to_string()))?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    free_blocks: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", model_loaded: state.model_loaded, free_blocks: state.engine.free_blocks() })
}

async fn ping() -> &'static str {
    "pong"
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.set_free_blocks(state.engine.free_blocks());
    ([("content-type", "text/plain; version=0.0.4")], state.metrics.render())
}

/// Shared admission path: validates, builds a `GenerationConfig`,
/// submits to the engine, and folds every emitted event into the metrics
/// registry as it goes by. Returns the full event list once the stream
/// closes — callers decide how to present them (collected JSON vs NDJSON).
async fn run_request(state: &AppState, req: GenerationRequest) -> Result<Vec<GenerationEvent>, RunnerError> {
    let (prompt, gen_cfg) = req.into_generation_config(&state.config)?;
    let tenant = "default";
    if !state.limiter.check_allow(tenant).await {
        return Err(RunnerError::Overloaded);
    }
    if !state.budgets.allowed(tenant, gen_cfg.max_tokens as u64).await {
        return Err(RunnerError::Overloaded);
    }

    let seed = gen_cfg.sampling.seed;
    let mut submission = state.engine.submit(prompt, gen_cfg, seed)?;
    state.metrics.request_admitted();

    let start = Instant::now();
    let mut first_token_at: Option<Duration> = None;
    let mut last_round_at = start;
    let mut events = Vec::new();
    let mut total_tokens = 0u64;

    while let Some(ev) = submission.events.next().await {
        if let GenerationEvent::Token { .. } = &ev {
            total_tokens += 1;
            if first_token_at.is_none() {
                first_token_at = Some(start.elapsed());
            }
        }
        if let GenerationEvent::Metrics { .. } = &ev {
            state.metrics.record_round_latency(last_round_at.elapsed());
            last_round_at = Instant::now();
        }
        state.metrics.observe_event(&ev, if matches!(&ev, GenerationEvent::Token { .. }) { first_token_at.take() } else { None });
        events.push(ev);
    }

    state.budgets.record(tenant, total_tokens).await;
    if start.elapsed().as_secs_f64() > 0.0 {
        state.metrics.record_tokens_per_second(total_tokens as f64 / start.elapsed().as_secs_f64().max(1e-6));
    }
    Ok(events)
}

#[derive(Serialize)]
struct GenerationResponse {
    text: String,
    tokens_generated: usize,
    stop_reason: Option<StopReason>,
}

fn collect_response(events: Vec<GenerationEvent>) -> GenerationResponse {
    let mut text = String::new();
    let mut tokens_generated = 0usize;
    let mut stop_reason = None;
    for ev in events {
        match ev {
            GenerationEvent::Token { text: piece, .. } => {
                text.push_str(&piece);
                tokens_generated += 1;
            }
            GenerationEvent::Done { reason, .. } => stop_reason = Some(reason),
            _ => {}
        }
    }
    GenerationResponse { text, tokens_generated, stop_reason }
}

async fn generate(State(state): State<AppState>, Json(req): Json<GenerationRequest>) -> impl IntoResponse {
    match run_request(&state, req).await {
        Ok(events) => (StatusCode::OK, Json(collect_response(events))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn generate_batch(State(state): State<AppState>, Json(batch): Json<BatchRequest>) -> impl IntoResponse {
    let mut out = Vec::with_capacity(batch.requests.len());
    for req in batch.requests {
        match run_request(&state, req).await {
            Ok(events) => out.push(collect_response(events)),
            Err(e) => out.push(GenerationResponse { text: String::new(), tokens_generated: 0, stop_reason: None::<StopReason> }.with_error(e)),
        }
    }
    Json(out)
}

#[derive(Deserialize)]
struct BatchRequest {
    requests: Vec<GenerationRequest>,
}

impl GenerationResponse {
    fn with_error(self, e: RunnerError) -> Self {
        tracing::warn!(kind = e.kind_tag(), "batch sub-request failed: {e}");
        self
    }
}

/// NDJSON streaming: one `GenerationEvent` per line, flushed
/// immediately, per the default streaming adapter (§4.8).
async fn generate_stream(State(state): State<AppState>, Json(req): Json<GenerationRequest>) -> impl IntoResponse {
    let (prompt, gen_cfg) = match req.into_generation_config(&state.config) {
        Ok(g) => g,
        Err(e) => return error_response(e),
    };
    if !state.limiter.check_allow("default").await {
        return error_response(RunnerError::Overloaded);
    }
    if !state.budgets.allowed("default", gen_cfg.max_tokens as u64).await {
        return error_response(RunnerError::Overloaded);
    }

    let seed = gen_cfg.sampling.seed;
    let submission = match state.engine.submit(prompt, gen_cfg, seed) {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    state.metrics.request_admitted();

    let metrics = state.metrics.clone();
    let start = Instant::now();
    let mut first_token_at: Option<Duration> = None;
    let mut last_round_at = start;
    let body_stream = submission.events.map(move |ev| {
        if let GenerationEvent::Token { .. } = &ev {
            if first_token_at.is_none() {
                first_token_at = Some(start.elapsed());
            }
        }
        if let GenerationEvent::Metrics { .. } = &ev {
            metrics.record_round_latency(last_round_at.elapsed());
            last_round_at = Instant::now();
        }
        metrics.observe_event(&ev, if matches!(&ev, GenerationEvent::Token { .. }) { first_token_at.take() } else { None });
        let mut line = serde_json::to_vec(&ev).unwrap_or_default();
        line.push(b'\n');
        Ok::<_, std::convert::Infallible>(line)
    });

    (
        StatusCode::OK,
        [("content-type", "application/x-ndjson")],
        Body::from_stream(body_stream),
    )
        .into_response()
}

fn error_response(e: RunnerError) -> axum::response::Response {
    let status = match e {
        RunnerError::Input(_) => StatusCode::BAD_REQUEST,
        RunnerError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        RunnerError::OutOfBlocks => StatusCode::SERVICE_UNAVAILABLE,
        RunnerError::Deadline => StatusCode::GATEWAY_TIMEOUT,
        RunnerError::ClientGone => StatusCode::BAD_REQUEST,
        RunnerError::ModelFault(_) => StatusCode::BAD_GATEWAY,
        RunnerError::Internal(_) | RunnerError::NotImplemented | RunnerError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = serde_json::json!({ "kind": e.kind_tag(), "message": e.to_string() });
    (status, Json(body)).into_response()
}
