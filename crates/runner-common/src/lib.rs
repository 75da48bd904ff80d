pub type Result<T> = core::result::Result<T, RunnerError>;

/// Error kinds as enumerated in the core's error handling design.
///
/// `Internal` is a fatal assertion failure — callers must not recover from
/// it locally; it is meant to propagate to the process driver and trigger a
/// logged abort. Every other variant is request-scoped and recoverable.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RunnerError {
    #[error("input error: {0}")]
    Input(String),
    #[error("overloaded: admission queue full")]
    Overloaded,
    #[error("out of blocks: KV cache pool exhausted")]
    OutOfBlocks,
    #[error("model fault: {0}")]
    ModelFault(String),
    #[error("deadline exceeded")]
    Deadline,
    #[error("client gone")]
    ClientGone,
    #[error("internal invariant violation: {0}")]
    Internal(String),
    #[error("not implemented")]
    NotImplemented,
    #[error("{0}")]
    Message(String),
}

impl RunnerError {
    /// Stable lowercase tag used in `GenerationEvent::Error{kind}` and in
    /// the `requests_total{status}` metric label.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            RunnerError::Input(_) => "input",
            RunnerError::Overloaded => "overloaded",
            RunnerError::OutOfBlocks => "out_of_blocks",
            RunnerError::ModelFault(_) => "model_fault",
            RunnerError::Deadline => "deadline",
            RunnerError::ClientGone => "client_gone",
            RunnerError::Internal(_) => "internal",
            RunnerError::NotImplemented => "not_implemented",
            RunnerError::Message(_) => "message",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RunnerError::Internal(_))
    }
}

pub mod config {
    use serde::Deserialize;
    use std::env;
    use std::path::PathBuf;

    /// Engine-wide tunables. Defaults match the values documented in the
    /// core design; every one of them is overridable so the open question
    /// around the exact EWMA decay / accept-reject thresholds is resolved
    /// as "configurable, with a documented default" rather than guessed.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct RunnerConfig {
        pub model_dir: PathBuf,
        pub context_size: Option<usize>,
        pub gpu_layers: Option<usize>,
        pub scheduler_tick_ms: Option<u64>,
        pub max_batch_tokens: Option<usize>,

        /// KV cache block size, in logical positions per block (§3/§4.1).
        pub block_size: usize,
        /// Total number of fixed-size KV blocks in the pool.
        pub n_blocks: usize,

        /// Default initial speculation depth K when a request omits it.
        pub speculation_depth_default: usize,
        pub k_min: usize,
        pub k_max: usize,
        /// EWMA decay applied to the rolling acceptance rate each round.
        pub ewma_alpha: f32,
        /// Acceptance rate at/above which K is grown.
        pub accept_high_watermark: f32,
        /// Acceptance rate at/below which K is shrunk.
        pub accept_low_watermark: f32,
        /// Draft confidence below which next-round K is capped.
        pub low_confidence_threshold: f32,
        pub low_confidence_k_cap: usize,

        pub max_prompt_len: usize,
        pub max_tokens_limit: usize,
        pub max_stop_strings: usize,

        /// Bound on pending (not-yet-Decoding) requests before admission
        /// fails fast with `Overloaded`.
        pub admission_queue_bound: usize,

        pub prefill_deadline_ms: u64,
        pub decode_deadline_ms: u64,

        /// Max number of not-yet-consumed stream events buffered before the
        /// pipeline suspends at the backpressure point (§5, S4).
        pub stream_backpressure_buffer: usize,
    }

    impl Default for RunnerConfig {
        fn default() -> Self {
            Self {
                model_dir: PathBuf::from("models"),
                context_size: Some(2048),
                gpu_layers: None,
                scheduler_tick_ms: Some(2),
                max_batch_tokens: Some(1024),

                block_size: 16,
                n_blocks: 4096,

                speculation_depth_default: 4,
                k_min: 1,
                k_max: 8,
                ewma_alpha: 0.1,
                accept_high_watermark: 0.85,
                accept_low_watermark: 0.4,
                low_confidence_threshold: 0.3,
                low_confidence_k_cap: 2,

                max_prompt_len: 32_768,
                max_tokens_limit: 2048,
                max_stop_strings: 4,

                admission_queue_bound: 256,

                prefill_deadline_ms: 30_000,
                decode_deadline_ms: 120_000,

                stream_backpressure_buffer: 64,
            }
        }
    }

    impl RunnerConfig {
        /// Load from `RUNNER_CONFIG` (YAML file) if set, else from
        /// individual `RUNNER_*` env overrides atop the defaults above.
        ///
        /// Malformed config is surfaced to the caller rather than silently
        /// discarded — the CLI driver maps a load failure to exit code 64
        /// ("bad config").
        pub fn load() -> super::Result<Self> {
            if let Ok(path) = env::var("RUNNER_CONFIG") {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| super::RunnerError::Input(format!("reading {path}: {e}")))?;
                let cfg: RunnerConfig = serde_yaml::from_str(&text)
                    .map_err(|e| super::RunnerError::Input(format!("parsing {path}: {e}")))?;
                return Ok(cfg);
            }
            let mut cfg = Self::default();
            if let Ok(dir) = env::var("RUNNER_MODEL_DIR") {
                cfg.model_dir = PathBuf::from(dir);
            }
            if let Some(v) = env::var("RUNNER_CONTEXT_SIZE").ok().and_then(|v| v.parse().ok()) {
                cfg.context_size = Some(v);
            }
            if let Some(v) = env::var("RUNNER_GPU_LAYERS").ok().and_then(|v| v.parse().ok()) {
                cfg.gpu_layers = Some(v);
            }
            if let Some(v) = env::var("RUNNER_TICK_MS").ok().and_then(|v| v.parse().ok()) {
                cfg.scheduler_tick_ms = Some(v);
            }
            if let Some(v) = env::var("RUNNER_MAX_BATCH_TOKENS").ok().and_then(|v| v.parse().ok()) {
                cfg.max_batch_tokens = Some(v);
            }
            if let Some(v) = env::var("RUNNER_BLOCK_SIZE").ok().and_then(|v| v.parse().ok()) {
                cfg.block_size = v;
            }
            if let Some(v) = env::var("RUNNER_N_BLOCKS").ok().and_then(|v| v.parse().ok()) {
                cfg.n_blocks = v;
            }
            if let Some(v) = env::var("RUNNER_ADMISSION_QUEUE_BOUND").ok().and_then(|v| v.parse().ok()) {
                cfg.admission_queue_bound = v;
            }
            cfg.validate()?;
            Ok(cfg)
        }

        pub fn validate(&self) -> super::Result<()> {
            if self.block_size == 0 {
                return Err(super::RunnerError::Input("block_size must be > 0".into()));
            }
            if self.n_blocks == 0 {
                return Err(super::RunnerError::Input("n_blocks must be > 0".into()));
            }
            if self.k_min == 0 || self.k_min > self.k_max {
                return Err(super::RunnerError::Input("k_min must be in [1, k_max]".into()));
            }
            if !(0.0..=1.0).contains(&self.ewma_alpha) {
                return Err(super::RunnerError::Input("ewma_alpha must be in [0, 1]".into()));
            }
            Ok(())
        }
    }
}
