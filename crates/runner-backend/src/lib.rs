//! The Model Runtime Adapter: the capability boundary between the engine
//! and whatever actually computes logits. The engine never assumes a
//! particular tensor framework — it only calls through this trait.

use runner_common::Result;

/// Identifies one sequence's private KV-cache view inside a runtime.
/// Cheap, `Copy`, stable for the lifetime of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeqId(pub u64);

#[derive(Debug, Clone, Default)]
pub struct LoadParams {
    pub n_ctx: usize,
    pub n_gpu_layers: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ModelHandle;

/// Opaque per-sequence state a runtime may need to decode multi-byte
/// token pieces incrementally without re-decoding the whole history.
#[derive(Debug, Clone, Default)]
pub struct DecodeState {
    pub pending_bytes: Vec<u8>,
}

/// The capability boundary described in the core design: draft/target
/// forward passes, KV rollback, and tokenizer hooks. Implementors own the
/// neural computation; the engine only schedules around it.
pub trait ModelRuntime: Send + Sync {
    fn vocab_size(&self) -> usize;
    fn eos_token_id(&self) -> u32;

    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn decode_incremental(&self, state: &mut DecodeState, id: u32) -> Result<String>;

    /// Register a new sequence before any forward pass references it.
    fn register_sequence(&self, seq: SeqId) -> Result<()>;
    /// Release all per-sequence runtime state (distinct from KV blocks,
    /// which the core's own allocator owns).
    fn release_sequence(&self, seq: SeqId) -> Result<()>;

    /// One target forward pass over the whole prompt. Returns the logits
    /// for the position immediately after the prompt (used to seed
    /// `speculation_depth == 0` autoregressive decoding).
    fn prefill_target(&self, seq: SeqId, prompt_tokens: &[u32]) -> Result<Vec<f32>>;

    /// Appends `new_tokens` to the draft model's KV cache and returns one
    /// logits vector per appended position (length == new_tokens.len()).
    fn forward_draft(&self, seq: SeqId, new_tokens: &[u32]) -> Result<Vec<Vec<f32>>>;

    /// Appends `new_tokens` (K candidates) to the target model's KV cache
    /// and returns K+1 logits vectors: one verifying each candidate plus
    /// one for the position after the last accepted token.
    fn forward_target(&self, seq: SeqId, new_tokens: &[u32]) -> Result<Vec<Vec<f32>>>;

    fn rollback_draft(&self, seq: SeqId, to_length: usize) -> Result<()>;
    fn rollback_target(&self, seq: SeqId, to_length: usize) -> Result<()>;
}

#[cfg(feature = "mock")]
pub mod mock {
    //! A deterministic stub runtime. This is not a toy: it is the
    //! reference implementation the correctness tests in the core crate
    //! are written against (bit-exact speculative/autoregressive
    //! equivalence requires a runtime with no actual randomness in its
    //! logits).
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Produces logits deterministically from a sequence's token history.
    /// The "biased" token gets a large additive logit boost, so greedy
    /// sampling always reproduces the same token stream for the same
    /// history — the property S1 and the bit-exact equivalence test need.
    #[derive(Clone, Copy)]
    pub struct DeterministicLogits {
        pub vocab_size: usize,
        pub bias_strength: f32,
    }

    impl DeterministicLogits {
        fn biased_token(&self, history: &[u32]) -> u32 {
            let mut h: u64 = 1469598103934665603;
            for &t in history {
                h ^= t as u64;
                h = h.wrapping_mul(1099511628211);
            }
            (h % self.vocab_size as u64) as u32
        }

        fn logits_for(&self, history: &[u32]) -> Vec<f32> {
            let biased = self.biased_token(history);
            let mut v = vec![0.0_f32; self.vocab_size];
            v[biased as usize] = self.bias_strength;
            v
        }
    }

    struct SeqState {
        draft_history: Vec<u32>,
        target_history: Vec<u32>,
    }

    /// A mock runtime where the draft model always agrees with the target
    /// model's argmax (acceptance rate 1.0) — used to prove speculative
    /// decoding is bit-exact with pure autoregressive decoding.
    pub struct MatchedMockRuntime {
        vocab_size: usize,
        eos: u32,
        logits: DeterministicLogits,
        sequences: Mutex<HashMap<u64, SeqState>>,
    }

    impl MatchedMockRuntime {
        pub fn new(vocab_size: usize) -> Self {
            Self {
                vocab_size,
                eos: (vocab_size - 1) as u32,
                logits: DeterministicLogits { vocab_size, bias_strength: 40.0 },
                sequences: Mutex::new(HashMap::new()),
            }
        }
    }

    impl ModelRuntime for MatchedMockRuntime {
        fn vocab_size(&self) -> usize {
            self.vocab_size
        }
        fn eos_token_id(&self) -> u32 {
            self.eos
        }
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(|b| (b as u32) % self.vocab_size as u32).collect())
        }
        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|i| char::from_u32(33 + (i % 90)).unwrap_or('?')).collect())
        }
        fn decode_incremental(&self, _state: &mut DecodeState, id: u32) -> Result<String> {
            self.decode(&[id])
        }
        fn register_sequence(&self, seq: SeqId) -> Result<()> {
            self.sequences.lock().unwrap().insert(
                seq.0,
                SeqState { draft_history: Vec::new(), target_history: Vec::new() },
            );
            Ok(())
        }
        fn release_sequence(&self, seq: SeqId) -> Result<()> {
            self.sequences.lock().unwrap().remove(&seq.0);
            Ok(())
        }
        fn prefill_target(&self, seq: SeqId, prompt_tokens: &[u32]) -> Result<Vec<f32>> {
            let mut g = self.sequences.lock().unwrap();
            let st = g.get_mut(&seq.0).expect("sequence not registered");
            st.target_history.extend_from_slice(prompt_tokens);
            st.draft_history.extend_from_slice(prompt_tokens);
            Ok(self.logits.logits_for(&st.target_history))
        }
        fn forward_draft(&self, seq: SeqId, new_tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
            let mut g = self.sequences.lock().unwrap();
            let st = g.get_mut(&seq.0).expect("sequence not registered");
            let mut out = Vec::with_capacity(new_tokens.len());
            for &t in new_tokens {
                st.draft_history.push(t);
                out.push(self.logits.logits_for(&st.draft_history));
            }
            Ok(out)
        }
        fn forward_target(&self, seq: SeqId, new_tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
            let mut g = self.sequences.lock().unwrap();
            let st = g.get_mut(&seq.0).expect("sequence not registered");
            let mut out = Vec::with_capacity(new_tokens.len() + 1);
            for &t in new_tokens {
                out.push(self.logits.logits_for(&st.target_history));
                st.target_history.push(t);
            }
            out.push(self.logits.logits_for(&st.target_history));
            Ok(out)
        }
        fn rollback_draft(&self, seq: SeqId, to_length: usize) -> Result<()> {
            let mut g = self.sequences.lock().unwrap();
            let st = g.get_mut(&seq.0).expect("sequence not registered");
            st.draft_history.truncate(to_length);
            Ok(())
        }
        fn rollback_target(&self, seq: SeqId, to_length: usize) -> Result<()> {
            let mut g = self.sequences.lock().unwrap();
            let st = g.get_mut(&seq.0).expect("sequence not registered");
            st.target_history.truncate(to_length);
            Ok(())
        }
    }

    /// A mock runtime whose draft model deliberately diverges from the
    /// target at a reproducible rate — used to exercise the
    /// rejection-sampling arbiter's corrected-distribution path and the
    /// adaptive controller's K-shrink behavior.
    pub struct MismatchedMockRuntime {
        inner: MatchedMockRuntime,
        draft_logits: DeterministicLogits,
    }

    impl MismatchedMockRuntime {
        pub fn new(vocab_size: usize) -> Self {
            Self {
                inner: MatchedMockRuntime::new(vocab_size),
                draft_logits: DeterministicLogits { vocab_size, bias_strength: 40.0 },
            }
        }
    }

    impl ModelRuntime for MismatchedMockRuntime {
        fn vocab_size(&self) -> usize {
            self.inner.vocab_size()
        }
        fn eos_token_id(&self) -> u32 {
            self.inner.eos_token_id()
        }
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            self.inner.encode(text)
        }
        fn decode(&self, ids: &[u32]) -> Result<String> {
            self.inner.decode(ids)
        }
        fn decode_incremental(&self, state: &mut DecodeState, id: u32) -> Result<String> {
            self.inner.decode_incremental(state, id)
        }
        fn register_sequence(&self, seq: SeqId) -> Result<()> {
            self.inner.register_sequence(seq)
        }
        fn release_sequence(&self, seq: SeqId) -> Result<()> {
            self.inner.release_sequence(seq)
        }
        fn prefill_target(&self, seq: SeqId, prompt_tokens: &[u32]) -> Result<Vec<f32>> {
            self.inner.prefill_target(seq, prompt_tokens)
        }
        fn forward_draft(&self, seq: SeqId, new_tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
            // Reuse the matched runtime's bookkeeping but shift the biased
            // token by one, so verification disagrees with the target's
            // argmax a reproducible fraction of the time.
            let mut g = self.inner.sequences.lock().unwrap();
            let st = g.get_mut(&seq.0).expect("sequence not registered");
            let mut out = Vec::with_capacity(new_tokens.len());
            for &t in new_tokens {
                st.draft_history.push(t);
                let mut logits = self.draft_logits.logits_for(&st.draft_history);
                if let Some(i) = logits.iter().position(|&v| v == self.draft_logits.bias_strength) {
                    logits[i] = 0.0;
                    let shifted = (i + 1) % logits.len();
                    logits[shifted] = self.draft_logits.bias_strength;
                }
                out.push(logits);
            }
            Ok(out)
        }
        fn forward_target(&self, seq: SeqId, new_tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
            self.inner.forward_target(seq, new_tokens)
        }
        fn rollback_draft(&self, seq: SeqId, to_length: usize) -> Result<()> {
            self.inner.rollback_draft(seq, to_length)
        }
        fn rollback_target(&self, seq: SeqId, to_length: usize) -> Result<()> {
            self.inner.rollback_target(seq, to_length)
        }
    }
}
