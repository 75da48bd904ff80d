//! Metrics Registry (C9): the counters, gauges, and histograms the core
//! design names, plus the ambient system-stats polling the rest of this
//! stack carries regardless of what a request-scoped Non-goal excludes.
//!
//! The registry does not reach into the engine. It is driven by whoever
//! owns the transport: `runner-api` observes each `GenerationEvent` as it
//! flows to the client and calls the `record_*` methods here, and
//! `Engine::free_blocks`/active-sequence counts are sampled from the
//! scrape handler. This keeps `runner-core` free of a `prometheus`
//! dependency — the engine produces events, it doesn't know who counts
//! them.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use sysinfo::{CpuExt, System, SystemExt};

use runner_core::{GenerationEvent, StopReason};

/// Owns every metric this process exposes. One instance per server,
/// shared behind an `Arc` with the HTTP layer and the engine's caller.
pub struct Metrics {
    registry: Registry,
    tokens_generated_total: IntCounter,
    tokens_accepted_total: IntCounter,
    tokens_rejected_total: IntCounter,
    rounds_total: IntCounter,
    requests_total: IntCounterVec,
    active_sequences: IntGauge,
    free_blocks: IntGauge,
    current_k_mean: prometheus::Gauge,
    time_to_first_token_seconds: Histogram,
    tokens_per_second: Histogram,
    round_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let tokens_generated_total =
            IntCounter::with_opts(Opts::new("tokens_generated_total", "total tokens emitted to clients")).unwrap();
        let tokens_accepted_total =
            IntCounter::with_opts(Opts::new("tokens_accepted_total", "draft tokens accepted by the arbiter")).unwrap();
        let tokens_rejected_total =
            IntCounter::with_opts(Opts::new("tokens_rejected_total", "draft tokens rejected by the arbiter")).unwrap();
        let rounds_total = IntCounter::with_opts(Opts::new("rounds_total", "speculative/autoregressive rounds run")).unwrap();
        let requests_total =
            IntCounterVec::new(Opts::new("requests_total", "requests completed, by terminal status"), &["status"]).unwrap();
        let active_sequences = IntGauge::with_opts(Opts::new("active_sequences", "sequences currently admitted")).unwrap();
        let free_blocks = IntGauge::with_opts(Opts::new("free_blocks", "free KV blocks remaining in the pool")).unwrap();
        let current_k_mean =
            prometheus::Gauge::with_opts(Opts::new("current_k_mean", "mean speculation depth across active sequences")).unwrap();

        let time_to_first_token_seconds = Histogram::with_opts(
            HistogramOpts::new("time_to_first_token_seconds", "latency from admission to the first token event")
                .buckets(exponential_buckets(0.005, 2.0, 14).unwrap()),
        )
        .unwrap();
        let tokens_per_second =
            Histogram::with_opts(HistogramOpts::new("tokens_per_second", "per-request output token rate").buckets(
                exponential_buckets(1.0, 1.6, 14).unwrap(),
            ))
            .unwrap();
        let round_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("round_latency_seconds", "wall-clock duration of one speculative/autoregressive round")
                .buckets(exponential_buckets(0.001, 2.0, 14).unwrap()),
        )
        .unwrap();

        for c in [&tokens_generated_total, &tokens_accepted_total, &tokens_rejected_total, &rounds_total] {
            registry.register(Box::new(c.clone())).unwrap();
        }
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(active_sequences.clone())).unwrap();
        registry.register(Box::new(free_blocks.clone())).unwrap();
        registry.register(Box::new(current_k_mean.clone())).unwrap();
        registry.register(Box::new(time_to_first_token_seconds.clone())).unwrap();
        registry.register(Box::new(tokens_per_second.clone())).unwrap();
        registry.register(Box::new(round_latency_seconds.clone())).unwrap();

        Arc::new(Self {
            registry,
            tokens_generated_total,
            tokens_accepted_total,
            tokens_rejected_total,
            rounds_total,
            requests_total,
            active_sequences,
            free_blocks,
            current_k_mean,
            time_to_first_token_seconds,
            tokens_per_second,
            round_latency_seconds,
        })
    }

    /// The registry backing this instance, so callers can register
    /// additional series (host stats, build info) into the same scrape
    /// rather than standing up a second `/metrics` family.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn request_admitted(&self) {
        self.active_sequences.inc();
    }

    /// Folds one `GenerationEvent` into the registry. Called once per
    /// event as the transport layer forwards it to the client; `time_to_first_token`
    /// should be `Some` only for the very first `Token` event of a request.
    pub fn observe_event(&self, event: &GenerationEvent, time_to_first_token: Option<Duration>) {
        match event {
            GenerationEvent::Token { .. } => {
                self.tokens_generated_total.inc();
                if let Some(d) = time_to_first_token {
                    self.time_to_first_token_seconds.observe(d.as_secs_f64());
                }
            }
            GenerationEvent::Metrics { acceptance_rate, current_k, .. } => {
                self.rounds_total.inc();
                self.current_k_mean.set(*current_k as f64);
                // acceptance_rate is accepted/K for the round; infer counts
                // from it relative to the configured K rather than threading
                // raw accept/reject counts through the event (kept minimal).
                let accepted = (*acceptance_rate * *current_k as f32).round() as u64;
                self.tokens_accepted_total.inc_by(accepted);
                self.tokens_rejected_total.inc_by((*current_k as u64).saturating_sub(accepted));
            }
            GenerationEvent::Done { reason, .. } => {
                self.active_sequences.dec();
                self.requests_total.with_label_values(&[status_label(*reason)]).inc();
            }
            GenerationEvent::Error { kind, .. } => {
                self.active_sequences.dec();
                self.requests_total.with_label_values(&[kind.as_str()]).inc();
            }
        }
    }

    pub fn record_round_latency(&self, elapsed: Duration) {
        self.round_latency_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn record_tokens_per_second(&self, rate: f64) {
        self.tokens_per_second.observe(rate);
    }

    pub fn set_free_blocks(&self, n: usize) {
        self.free_blocks.set(n as i64);
    }

    /// Renders the Prometheus text exposition format for the `/metrics`
    /// scrape endpoint. Format is the stable wire contract: callers must
    /// not reorder or rename existing series.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).expect("prometheus text encoding cannot fail");
        String::from_utf8(buf).expect("prometheus text encoder always emits valid utf-8")
    }
}

fn status_label(reason: StopReason) -> &'static str {
    match reason {
        StopReason::MaxTokens => "max_tokens",
        StopReason::EosSampled => "eos",
        StopReason::StopString => "stop_string",
        StopReason::Deadline => "deadline",
        StopReason::Cancelled => "cancelled",
        StopReason::Error => "error",
    }
}

/// Ambient host stats (CPU/memory), refreshed on a timer and exposed as
/// plain gauges alongside the engine's own metrics. Carried as ambient
/// texture the way a long-running service reports its own health,
/// independent of anything request-scoped.
pub struct SystemStats {
    cpu_usage_percent: prometheus::Gauge,
    memory_used_bytes: IntGauge,
}

impl SystemStats {
    pub fn new(registry: &Registry) -> Arc<Self> {
        let cpu_usage_percent = prometheus::Gauge::with_opts(Opts::new("process_cpu_usage_percent", "host CPU usage percent")).unwrap();
        let memory_used_bytes = IntGauge::with_opts(Opts::new("process_memory_used_bytes", "host memory used, in bytes")).unwrap();
        registry.register(Box::new(cpu_usage_percent.clone())).unwrap();
        registry.register(Box::new(memory_used_bytes.clone())).unwrap();
        Arc::new(Self { cpu_usage_percent, memory_used_bytes })
    }

    pub fn refresh(&self, sys: &mut System) {
        sys.refresh_cpu();
        sys.refresh_memory();
        let avg_cpu = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / sys.cpus().len().max(1) as f32;
        self.cpu_usage_percent.set(avg_cpu as f64);
        self.memory_used_bytes.set(sys.used_memory() as i64);
    }

    /// Spawns a background task that refreshes host stats every second.
    /// Intended to be called once at process startup.
    pub fn spawn_polling(self: Arc<Self>) {
        tracing::info!("starting host stats polling");
        tokio::spawn(async move {
            let mut sys = System::new();
            loop {
                self.refresh(&mut sys);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_named_series() {
        let metrics = Metrics::new();
        metrics.set_free_blocks(4096);
        let text = metrics.render();
        for name in [
            "tokens_generated_total",
            "tokens_accepted_total",
            "tokens_rejected_total",
            "rounds_total",
            "requests_total",
            "active_sequences",
            "free_blocks",
            "current_k_mean",
            "time_to_first_token_seconds",
            "tokens_per_second",
            "round_latency_seconds",
        ] {
            assert!(text.contains(name), "missing series {name} in rendered output");
        }
    }

    #[test]
    fn done_event_increments_requests_total_with_status_label() {
        let metrics = Metrics::new();
        metrics.request_admitted();
        metrics.observe_event(&GenerationEvent::Done { index: 1, is_final: true, reason: StopReason::MaxTokens }, None);
        let text = metrics.render();
        assert!(text.contains("requests_total{status=\"max_tokens\"} 1"));
    }

    #[test]
    fn token_event_increments_generated_counter() {
        let metrics = Metrics::new();
        metrics.observe_event(
            &GenerationEvent::Token { index: 1, is_final: false, text: "a".into(), logical_index: 0, accepted: true },
            Some(Duration::from_millis(12)),
        );
        let text = metrics.render();
        assert!(text.contains("tokens_generated_total 1"));
    }
}
