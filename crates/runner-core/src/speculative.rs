//! Speculative Decoder (C5): one round of draft-propose / target-verify /
//! arbitrate / commit, as specified step by step in the core design. This
//! is the module the whole engine exists to run — everything else in this
//! crate exists to keep its invariants (cache accounting, distributional
//! equivalence) intact.
//!
//! A subtlety the spec states as an invariant but doesn't spell out
//! mechanically: the bonus token committed at the end of a round has been
//! *verified* but never actually run through either model's forward pass,
//! so neither the draft nor the target runtime KV cache has seen it yet.
//! [`Backlogs`] tracks exactly those not-yet-forwarded tokens per cache so
//! the next round can catch each model up before doing its own work —
//! this is what keeps `runtime.forward_*`'s internal history in lockstep
//! with the logical sequence the paged cache accounts for.

use rand::Rng;
use runner_backend::{ModelRuntime, SeqId};
use runner_common::{Result, RunnerError};

use crate::kv::PagedKvCache;
use crate::sampler::{self, Acceptance, SamplingConfig};

/// Transient per-round output, consumed by the adaptive controller and by
/// C9 telemetry; nothing here outlives the round that produced it.
pub struct RoundOutcome {
    /// Tokens committed this round: the accepted draft prefix plus the
    /// bonus token (and, for `K == 0`, the single autoregressive token).
    pub emitted: Vec<u32>,
    /// Count of draft tokens accepted before the first rejection (0 when
    /// `K == 0`, since no drafting happened).
    pub accepted_prefix_len: usize,
    /// Fraction of the K proposed draft tokens that were accepted this
    /// round. 0.0 when K == 0 — the adaptive controller's EWMA then just
    /// holds rather than reading a false rejection.
    pub acceptance_rate: f32,
    /// Max of the per-step draft probabilities `q_i`, used by the
    /// adaptive controller's low-confidence cap. `1.0` when K == 0.
    pub max_draft_confidence: f32,
    /// Set when a `ModelFault` during the draft phase forced a fallback
    /// to a target-only step (§4.5 edge case); surfaced as a metrics
    /// warning by the caller, not an error.
    pub fell_back: bool,
    /// True if the last emitted token is EOS.
    pub hit_eos: bool,
}

/// Tokens committed to the logical sequence that a given runtime cache
/// (draft, target) has not yet seen via a forward call. Owned per
/// sequence by the pipeline, alongside the rest of `SequenceState`.
#[derive(Default)]
pub struct Backlogs {
    draft: Vec<u32>,
    target: Vec<u32>,
    /// Both grounding runtimes (the deterministic mock and the llama.cpp
    /// adapter) treat `prefill_target` as priming the draft model's cache
    /// over the prompt too, not just the target's — so right after
    /// prefill both caches are already caught up and neither backlog
    /// needs draining. The one thing `prefill_target`'s single forward
    /// pass can't give us for free is a *draft*-seeded distribution for
    /// the very first draft token; we reuse its returned logits for that,
    /// since at that position the two caches hold identical history.
    initial_draft_seed: Option<Vec<f32>>,
}

impl Backlogs {
    pub fn after_prefill(prefill_seed: Vec<f32>) -> Self {
        Self { draft: Vec::new(), target: Vec::new(), initial_draft_seed: Some(prefill_seed) }
    }
}

/// Runs one `speculate_step` (§4.5) against `runtime` for `seq`, whose
/// logical length before the round is `l_before`. `k == 0` degrades to a
/// single target-only autoregressive step, per the K==0 edge case. A
/// `ModelFault` from the draft phase abandons the round and falls back to
/// one target-only step instead of propagating the error.
#[allow(clippy::too_many_arguments)]
pub fn speculate_step<R: ModelRuntime + ?Sized>(
    runtime: &R,
    cache: &PagedKvCache,
    seq: SeqId,
    l_before: usize,
    k: usize,
    cfg: &SamplingConfig,
    rng: &mut impl Rng,
    backlogs: &mut Backlogs,
) -> Result<RoundOutcome> {
    if k == 0 {
        return autoregressive_step(runtime, cache, seq, l_before, cfg, rng, backlogs);
    }

    match speculate_round(runtime, cache, seq, l_before, k, cfg, rng, backlogs) {
        Ok(outcome) => Ok(outcome),
        Err(RunnerError::ModelFault(_)) => {
            let mut outcome = autoregressive_step(runtime, cache, seq, l_before, cfg, rng, backlogs)?;
            outcome.fell_back = true;
            Ok(outcome)
        }
        Err(e) => Err(e),
    }
}

/// Seeds the target distribution for the token about to be sampled:
/// drains any backlog into the target cache first (one batched forward
/// call), or — if nothing is pending — asks for the current tail logits
/// via the zero-new-tokens case of `forward_target`'s K+1 contract, which
/// is non-destructive (K=0 => exactly one logits vector, nothing new
/// appended).
fn seed_target<R: ModelRuntime + ?Sized>(runtime: &R, seq: SeqId, backlog: &mut Vec<u32>) -> Result<Vec<f32>> {
    if backlog.is_empty() {
        let out = runtime.forward_target(seq, &[])?;
        return out
            .into_iter()
            .next()
            .ok_or_else(|| RunnerError::Internal("forward_target returned no logits for an empty batch".into()));
    }
    let out = runtime.forward_target(seq, backlog)?;
    backlog.clear();
    out.into_iter()
        .last()
        .ok_or_else(|| RunnerError::Internal("forward_target returned no logits while draining backlog".into()))
}

/// Same idea for the draft model, but `forward_draft` has no
/// zero-new-tokens contract (it only ever returns exactly as many logits
/// as tokens given). The one round where the backlog is legitimately
/// empty with nothing to drain is the very first one, where prefill's
/// returned logits are reused instead (see [`Backlogs`]); any other empty
/// backlog here is a programmer error.
fn seed_draft<R: ModelRuntime + ?Sized>(runtime: &R, seq: SeqId, backlogs: &mut Backlogs) -> Result<Vec<f32>> {
    if backlogs.draft.is_empty() {
        return backlogs
            .initial_draft_seed
            .take()
            .ok_or_else(|| RunnerError::Internal("draft backlog empty: nothing to prime the draft cache with".into()));
    }
    let out = runtime.forward_draft(seq, &backlogs.draft)?;
    backlogs.draft.clear();
    out.into_iter()
        .last()
        .ok_or_else(|| RunnerError::Internal("forward_draft returned no logits while draining backlog".into()))
}

/// One target-only decode step, used both for `K == 0` requests and as
/// the draft-fault fallback. The draft distribution and target
/// distribution are sampled from the identical history (no separate
/// draft model involved), so acceptance is guaranteed by construction —
/// this degenerates to a plain target sample, matching pure
/// autoregressive decoding exactly. The committed token is never fed to
/// the draft cache, so it is pushed onto the draft backlog for whichever
/// future round resumes drafting.
fn autoregressive_step<R: ModelRuntime + ?Sized>(
    runtime: &R,
    cache: &PagedKvCache,
    seq: SeqId,
    l_before: usize,
    cfg: &SamplingConfig,
    rng: &mut impl Rng,
    backlogs: &mut Backlogs,
) -> Result<RoundOutcome> {
    let seed_logits = seed_target(runtime, seq, &mut backlogs.target)?;
    let (candidate, cand_dist) = sampler::sample(&seed_logits, cfg, rng);

    cache.append_positions(seq, 1)?;
    let target_logits = runtime.forward_target(seq, &[candidate])?;
    if target_logits.len() != 2 {
        return Err(RunnerError::Internal(format!(
            "forward_target must return K+1 logits, got {} for K=1",
            target_logits.len()
        )));
    }
    let target_dist_at_candidate = sampler::distribution(&target_logits[0], cfg);
    let u: f32 = rng.gen();
    let committed = match sampler::arbitrate(candidate, &cand_dist, &target_dist_at_candidate, u, rng) {
        Acceptance::Accept => candidate,
        Acceptance::Reject { bonus } => bonus,
    };

    let new_len = l_before + 1;
    runtime.rollback_target(seq, new_len)?;
    cache.truncate_to(seq, new_len)?;
    backlogs.draft.push(committed);

    let hit_eos = committed == runtime.eos_token_id();
    Ok(RoundOutcome {
        emitted: vec![committed],
        accepted_prefix_len: 0,
        acceptance_rate: 0.0,
        max_draft_confidence: 1.0,
        fell_back: false,
        hit_eos,
    })
}

/// Runs the full speculative round (§4.5 steps 1-5) for `k >= 1`.
fn speculate_round<R: ModelRuntime + ?Sized>(
    runtime: &R,
    cache: &PagedKvCache,
    seq: SeqId,
    l_before: usize,
    k: usize,
    cfg: &SamplingConfig,
    rng: &mut impl Rng,
    backlogs: &mut Backlogs,
) -> Result<RoundOutcome> {
    // --- Draft phase: K sequential single-token forward_draft calls,
    // each sampled immediately since the next step conditions on it. The
    // first call also drains whatever draft backlog is pending. ---
    let mut draft_tokens = Vec::with_capacity(k);
    let mut draft_dists = Vec::with_capacity(k);
    let mut next_seed = seed_draft(runtime, seq, backlogs)?;
    for i in 0..k {
        let (tok, dist) = sampler::sample(&next_seed, cfg, rng);
        draft_tokens.push(tok);
        draft_dists.push(dist);
        // Every proposed token is forwarded through the draft model, not
        // just the first k-1: the draft runtime's KV cache must hold all
        // k positions so `rollback_draft`'s boundary below lands on the
        // cache's actual length instead of undershooting it.
        let logits_batch = runtime.forward_draft(seq, &draft_tokens[i..i + 1])?;
        if i + 1 < k {
            next_seed = logits_batch
                .into_iter()
                .last()
                .ok_or_else(|| RunnerError::Internal("forward_draft returned empty logits batch".into()))?;
        }
    }

    // --- Verify phase: drain any target backlog, then one batched
    // forward_target call over all K draft candidates. ---
    let _ = seed_target(runtime, seq, &mut backlogs.target)?;
    cache.append_positions(seq, k)?;
    let target_logits = runtime.forward_target(seq, &draft_tokens)?;
    if target_logits.len() != k + 1 {
        return Err(RunnerError::Internal(format!(
            "forward_target must return K+1={} logits, got {}",
            k + 1,
            target_logits.len()
        )));
    }

    // --- Arbitrate: accept/reject in order, stop at first rejection. ---
    let mut emitted = Vec::with_capacity(k + 1);
    let mut accepted_prefix_len = 0usize;
    let mut max_draft_confidence: f32 = 0.0;
    let mut committed_bonus: Option<u32> = None;
    let mut hit_eos = false;

    for i in 0..k {
        max_draft_confidence = max_draft_confidence.max(draft_dists[i].max_prob());

        let target_dist_i = sampler::distribution(&target_logits[i], cfg);
        let u: f32 = rng.gen();
        match sampler::arbitrate(draft_tokens[i], &draft_dists[i], &target_dist_i, u, rng) {
            Acceptance::Accept => {
                emitted.push(draft_tokens[i]);
                accepted_prefix_len += 1;
                if draft_tokens[i] == runtime.eos_token_id() {
                    hit_eos = true;
                    break;
                }
            }
            Acceptance::Reject { bonus } => {
                committed_bonus = Some(bonus);
                break;
            }
        }
    }

    if !hit_eos && committed_bonus.is_none() && accepted_prefix_len == k {
        // All accepted: sample the bonus token from the (K+1)-th target
        // logits, per §4.5 step 3.
        let final_dist = sampler::distribution(&target_logits[k], cfg);
        committed_bonus = Some(final_dist.draw(rng));
    }

    if let Some(bonus) = committed_bonus {
        if bonus == runtime.eos_token_id() {
            hit_eos = true;
        }
        emitted.push(bonus);
        // Verified but never forwarded through either model.
        backlogs.draft.push(bonus);
        backlogs.target.push(bonus);
    }

    let new_len = l_before + emitted.len();
    let draft_forwarded_to = l_before + accepted_prefix_len;
    runtime.rollback_target(seq, draft_forwarded_to)?;
    runtime.rollback_draft(seq, draft_forwarded_to)?;
    cache.truncate_to(seq, new_len)?;

    let acceptance_rate = accepted_prefix_len as f32 / k as f32;

    Ok(RoundOutcome {
        emitted,
        accepted_prefix_len,
        acceptance_rate,
        max_draft_confidence,
        fell_back: false,
        hit_eos,
    })
}
