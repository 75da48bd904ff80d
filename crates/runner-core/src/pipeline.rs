//! Generation Pipeline (C7): the state machine that turns one admitted
//! request into a lazy sequence of [`GenerationEvent`]s —
//! `Admitted -> Prefilling -> Decoding -> Stopping -> Terminal`, per the
//! core design's table. Everything here is transport-agnostic: the
//! pipeline only ever produces events onto a channel; `runner-api` is the
//! one place that frames them onto the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use runner_backend::{DecodeState, ModelRuntime, SeqId};
use runner_common::config::RunnerConfig;
use runner_common::{Result, RunnerError};

use crate::adaptive::{AdaptiveConfig, AdaptiveController};
use crate::events::{GenerationEvent, StopReason};
use crate::kv::PagedKvCache;
use crate::sampler::SamplingConfig;
use crate::speculative::{self, Backlogs};

/// The validated, internal request shape `runner-api` maps a
/// `GenerationRequest` down to before submitting it to C7. Everything
/// here is assumed already within the bounds the HTTP layer validated
/// (§6) — the pipeline trusts its caller and does not re-validate.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub sampling: SamplingConfig,
    /// Initial K. 0 permanently disables speculation for this request
    /// (every round runs the target-only autoregressive path).
    pub speculation_depth: usize,
    pub use_speculative: bool,
    pub adaptive: bool,
    pub stop_strings: Vec<String>,
}

/// Per-sequence mutable state, owned exclusively by the task running
/// [`run_pipeline`] for the lifetime of one request (§3's
/// `SequenceState`). The paged cache's own block table is the
/// authoritative record of allocated blocks; this struct only tracks
/// what the pipeline itself needs between rounds.
struct SequenceState {
    seq: SeqId,
    generated: Vec<u32>,
    logical_len: usize,
    decode_state: DecodeState,
    backlogs: Backlogs,
    adaptive: Option<AdaptiveController>,
    k: usize,
}

/// A newly admitted request: the event stream the caller consumes, and
/// the cancellation handle it flips when the client goes away.
pub struct Submission {
    pub events: ReceiverStream<GenerationEvent>,
    pub cancel: CancellationToken,
    pub seq: SeqId,
}

/// Owns the shared engine-wide resources every request's pipeline task
/// draws on: the model runtime, the paged KV cache, the bounded admission
/// queue, and the single decode slot (§5 — only one sequence is ever
/// actively decoding at a time).
pub struct Engine {
    runtime: Arc<dyn ModelRuntime>,
    cache: Arc<PagedKvCache>,
    config: Arc<RunnerConfig>,
    next_seq: AtomicU64,
    admission: Arc<Semaphore>,
    decode_lock: Arc<AsyncMutex<()>>,
}

impl Engine {
    pub fn new(runtime: Arc<dyn ModelRuntime>, cache: Arc<PagedKvCache>, config: Arc<RunnerConfig>) -> Self {
        let admission = Arc::new(Semaphore::new(config.admission_queue_bound));
        Self { runtime, cache, config, next_seq: AtomicU64::new(1), admission, decode_lock: Arc::new(AsyncMutex::new(())) }
    }

    pub fn free_blocks(&self) -> usize {
        self.cache.free_blocks()
    }

    /// Admits a request and spawns its pipeline task. Fails fast with
    /// `Overloaded` rather than queuing indefinitely once
    /// `admission_queue_bound` pending/active requests are already ahead
    /// of it.
    pub fn submit(&self, prompt: String, gen_cfg: GenerationConfig, seed: Option<u64>) -> Result<Submission> {
        let permit = self.admission.clone().try_acquire_owned().map_err(|_| RunnerError::Overloaded)?;
        let seq = SeqId(self.next_seq.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.stream_backpressure_buffer);

        let runtime = self.runtime.clone();
        let cache = self.cache.clone();
        let config = self.config.clone();
        let decode_lock = self.decode_lock.clone();
        let cancel_task = cancel.clone();

        tokio::spawn(async move {
            let _permit = permit;
            run_pipeline(runtime, cache, config, decode_lock, seq, prompt, gen_cfg, seed, cancel_task, tx).await;
        });

        Ok(Submission { events: ReceiverStream::new(rx), cancel, seq })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    runtime: Arc<dyn ModelRuntime>,
    cache: Arc<PagedKvCache>,
    config: Arc<RunnerConfig>,
    decode_lock: Arc<AsyncMutex<()>>,
    seq: SeqId,
    prompt: String,
    gen_cfg: GenerationConfig,
    seed: Option<u64>,
    cancel: CancellationToken,
    tx: mpsc::Sender<GenerationEvent>,
) {
    let mut index = 0u32;
    macro_rules! emit {
        ($ev:expr) => {
            if tx.send($ev).await.is_err() {
                cancel.cancel();
            }
        };
    }

    // --- Admitted: encode prompt, allocate blocks for it. ---
    let tokens = match runtime.encode(&prompt) {
        Ok(t) if !t.is_empty() => t,
        Ok(_) => {
            index += 1;
            emit!(GenerationEvent::Error {
                index,
                is_final: true,
                kind: RunnerError::Input("empty prompt".into()).kind_tag().to_string(),
                message: "prompt encoded to zero tokens".into(),
            });
            return;
        }
        Err(e) => {
            index += 1;
            emit!(GenerationEvent::Error { index, is_final: true, kind: e.kind_tag().to_string(), message: e.to_string() });
            return;
        }
    };

    if let Err(e) = runtime.register_sequence(seq) {
        index += 1;
        emit!(GenerationEvent::Error { index, is_final: true, kind: e.kind_tag().to_string(), message: e.to_string() });
        return;
    }
    if let Err(e) = cache.append_positions(seq, tokens.len()) {
        let _ = runtime.release_sequence(seq);
        index += 1;
        emit!(GenerationEvent::Error { index, is_final: true, kind: e.kind_tag().to_string(), message: e.to_string() });
        return;
    }

    // --- Prefilling: one target forward pass over the whole prompt. ---
    let prefill_deadline = Duration::from_millis(config.prefill_deadline_ms);
    let prefill_start = Instant::now();
    let prefill_seed = match runtime.prefill_target(seq, &tokens) {
        Ok(logits) => logits,
        Err(e) => {
            cleanup(&runtime, &cache, seq);
            index += 1;
            emit!(GenerationEvent::Error { index, is_final: true, kind: e.kind_tag().to_string(), message: e.to_string() });
            return;
        }
    };
    if prefill_start.elapsed() > prefill_deadline {
        cleanup(&runtime, &cache, seq);
        index += 1;
        emit!(GenerationEvent::Done { index, is_final: true, reason: StopReason::Deadline });
        return;
    }

    let initial_k = if gen_cfg.use_speculative { gen_cfg.speculation_depth } else { 0 };
    let adaptive = if gen_cfg.adaptive && initial_k > 0 {
        Some(AdaptiveController::new(initial_k, AdaptiveConfig::from(&*config)))
    } else {
        None
    };
    let mut state = SequenceState {
        seq,
        generated: Vec::new(),
        logical_len: tokens.len(),
        decode_state: DecodeState::default(),
        backlogs: Backlogs::after_prefill(prefill_seed),
        adaptive,
        k: initial_k,
    };

    // --- Decoding: only one sequence decodes at a time, process-wide. ---
    let _decode_guard = decode_lock.lock().await;
    let decode_deadline_at = Instant::now() + Duration::from_millis(config.decode_deadline_ms);
    let mut decoded_suffix = String::new();
    let mut stop_reason: Option<StopReason> = None;
    let mut rng: StdRng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    'decode: loop {
        if cancel.is_cancelled() {
            stop_reason = Some(StopReason::Cancelled);
            break;
        }
        if Instant::now() >= decode_deadline_at {
            stop_reason = Some(StopReason::Deadline);
            break;
        }
        if state.generated.len() >= gen_cfg.max_tokens {
            stop_reason = Some(StopReason::MaxTokens);
            break;
        }

        let round_start = Instant::now();
        let outcome = match speculate_step_checked(&*runtime, &cache, &mut state, &gen_cfg.sampling, &mut rng) {
            Ok(o) => o,
            Err(RunnerError::OutOfBlocks) => {
                index += 1;
                emit!(GenerationEvent::Error {
                    index,
                    is_final: true,
                    kind: RunnerError::OutOfBlocks.kind_tag().to_string(),
                    message: "KV cache pool exhausted".into(),
                });
                cleanup(&runtime, &cache, seq);
                return;
            }
            Err(e) => {
                index += 1;
                emit!(GenerationEvent::Error { index, is_final: true, kind: e.kind_tag().to_string(), message: e.to_string() });
                cleanup(&runtime, &cache, seq);
                return;
            }
        };

        if outcome.fell_back {
            tracing::warn!(seq = seq.0, "draft model fault; fell back to a target-only step");
        }
        for (tok_idx, &tok) in outcome.emitted.iter().enumerate() {
            state.generated.push(tok);
            state.logical_len += 1;
            let piece = match runtime.decode_incremental(&mut state.decode_state, tok) {
                Ok(p) => p,
                Err(e) => {
                    index += 1;
                    emit!(GenerationEvent::Error { index, is_final: true, kind: e.kind_tag().to_string(), message: e.to_string() });
                    cleanup(&runtime, &cache, seq);
                    return;
                }
            };
            decoded_suffix.push_str(&piece);

            index += 1;
            emit!(GenerationEvent::Token {
                index,
                is_final: false,
                text: piece,
                logical_index: state.generated.len() - 1,
                // Only the verified draft prefix counts as accepted; the
                // bonus/corrected token past it (or the lone token of a
                // K==0 autoregressive step) was never a draft proposal.
                accepted: tok_idx < outcome.accepted_prefix_len,
            });

            if tok == runtime.eos_token_id() {
                stop_reason = Some(StopReason::EosSampled);
                break;
            }
            if gen_cfg.stop_strings.iter().any(|s| !s.is_empty() && decoded_suffix.ends_with(s.as_str())) {
                stop_reason = Some(StopReason::StopString);
                break;
            }
            if state.generated.len() >= gen_cfg.max_tokens {
                stop_reason = Some(StopReason::MaxTokens);
                break;
            }
        }

        let round_elapsed = round_start.elapsed();
        let tokens_per_second = if round_elapsed.as_secs_f32() > 0.0 {
            outcome.emitted.len() as f32 / round_elapsed.as_secs_f32()
        } else {
            0.0
        };

        index += 1;
        emit!(GenerationEvent::Metrics {
            index,
            is_final: false,
            acceptance_rate: outcome.acceptance_rate,
            tokens_per_second,
            current_k: state.k,
        });

        if let Some(ctrl) = state.adaptive.as_mut() {
            if state.k > 0 {
                state.k = ctrl.observe(outcome.acceptance_rate, outcome.max_draft_confidence);
            }
        }

        if stop_reason.is_some() {
            break 'decode;
        }

        tokio::task::yield_now().await;
    }

    // --- Stopping / Terminal: reclaim blocks, emit Done, close stream. ---
    cleanup(&runtime, &cache, seq);
    index += 1;
    emit!(GenerationEvent::Done { index, is_final: true, reason: stop_reason.unwrap_or(StopReason::MaxTokens) });
}

/// Thin wrapper around [`speculative::speculate_step`] that reads/writes
/// the bits of `SequenceState` it needs, keeping the decode loop above
/// free of `&mut state.foo` noise.
fn speculate_step_checked<R: ModelRuntime + ?Sized>(
    runtime: &R,
    cache: &PagedKvCache,
    state: &mut SequenceState,
    sampling: &SamplingConfig,
    rng: &mut StdRng,
) -> Result<speculative::RoundOutcome> {
    let l_before = state.logical_len;
    let k = state.k;
    speculative::speculate_step(runtime, cache, state.seq, l_before, k, sampling, rng, &mut state.backlogs)
}

fn cleanup(runtime: &Arc<dyn ModelRuntime>, cache: &Arc<PagedKvCache>, seq: SeqId) {
    cache.destroy(seq);
    let _ = runtime.release_sequence(seq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_backend::mock::MatchedMockRuntime;
    use tokio_stream::StreamExt as _;

    fn test_config() -> Arc<RunnerConfig> {
        let mut cfg = RunnerConfig::default();
        cfg.n_blocks = 256;
        cfg.block_size = 16;
        cfg.admission_queue_bound = 4;
        cfg.decode_deadline_ms = 5_000;
        cfg.prefill_deadline_ms = 5_000;
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn greedy_generation_terminates_with_max_tokens() {
        let runtime: Arc<dyn ModelRuntime> = Arc::new(MatchedMockRuntime::new(41));
        let cache = Arc::new(PagedKvCache::new(16, 256));
        let engine = Engine::new(runtime, cache, test_config());

        let gen_cfg = GenerationConfig {
            max_tokens: 5,
            sampling: SamplingConfig { temperature: 0.0, ..Default::default() },
            speculation_depth: 4,
            use_speculative: true,
            adaptive: true,
            stop_strings: vec![],
        };
        let mut submission = engine.submit("hello world".into(), gen_cfg, Some(1)).unwrap();

        let mut tokens_seen = 0;
        let mut saw_done = false;
        while let Some(ev) = submission.events.next().await {
            match ev {
                GenerationEvent::Token { .. } => tokens_seen += 1,
                GenerationEvent::Done { reason, .. } => {
                    saw_done = true;
                    assert_eq!(reason, StopReason::MaxTokens);
                }
                GenerationEvent::Error { kind, message, .. } => panic!("unexpected error: {kind} {message}"),
                GenerationEvent::Metrics { .. } => {}
            }
        }
        assert!(saw_done);
        assert!(tokens_seen <= 5 && tokens_seen > 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream_without_an_error_event() {
        let runtime: Arc<dyn ModelRuntime> = Arc::new(MatchedMockRuntime::new(41));
        let cache = Arc::new(PagedKvCache::new(16, 256));
        let engine = Engine::new(runtime, cache, test_config());

        let gen_cfg = GenerationConfig {
            max_tokens: 2048,
            sampling: SamplingConfig { temperature: 0.0, ..Default::default() },
            speculation_depth: 4,
            use_speculative: true,
            adaptive: true,
            stop_strings: vec![],
        };
        let mut submission = engine.submit("cancel me".into(), gen_cfg, Some(7)).unwrap();
        submission.cancel.cancel();

        let mut saw_error = false;
        let mut reason = None;
        while let Some(ev) = submission.events.next().await {
            if let GenerationEvent::Error { .. } = ev {
                saw_error = true;
            }
            if let GenerationEvent::Done { reason: r, .. } = ev {
                reason = Some(r);
            }
        }
        assert!(!saw_error);
        assert_eq!(reason, Some(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn overloaded_admission_queue_rejects_fast() {
        let runtime: Arc<dyn ModelRuntime> = Arc::new(MatchedMockRuntime::new(41));
        let cache = Arc::new(PagedKvCache::new(16, 256));
        let mut cfg = RunnerConfig::default();
        cfg.admission_queue_bound = 0;
        let engine = Engine::new(runtime, cache, Arc::new(cfg));

        let gen_cfg = GenerationConfig {
            max_tokens: 5,
            sampling: SamplingConfig::default(),
            speculation_depth: 4,
            use_speculative: true,
            adaptive: true,
            stop_strings: vec![],
        };
        let err = engine.submit("won't fit".into(), gen_cfg, None).unwrap_err();
        assert_eq!(err, RunnerError::Overloaded);
    }
}
