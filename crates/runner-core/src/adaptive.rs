//! Adaptive Controller (C6): an EWMA over recent acceptance rate that
//! grows or shrinks the next round's speculation depth K. Pure state, no
//! I/O — reset fresh for every request so S2 can assert its behavior
//! deterministically without touching a runtime.

use runner_common::config::RunnerConfig;

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub k_min: usize,
    pub k_max: usize,
    pub ewma_alpha: f32,
    pub accept_high_watermark: f32,
    pub accept_low_watermark: f32,
    pub low_confidence_threshold: f32,
    pub low_confidence_k_cap: usize,
}

impl From<&RunnerConfig> for AdaptiveConfig {
    fn from(cfg: &RunnerConfig) -> Self {
        Self {
            k_min: cfg.k_min,
            k_max: cfg.k_max,
            ewma_alpha: cfg.ewma_alpha,
            accept_high_watermark: cfg.accept_high_watermark,
            accept_low_watermark: cfg.accept_low_watermark,
            low_confidence_threshold: cfg.low_confidence_threshold,
            low_confidence_k_cap: cfg.low_confidence_k_cap,
        }
    }
}

/// Tracks the EWMA acceptance rate for one sequence and derives the next
/// round's K. §4.6 literally: grow at >= high watermark, shrink at <= low
/// watermark, otherwise hold; additionally cap K at `low_confidence_k_cap`
/// whenever the round's max draft confidence dropped below the threshold.
pub struct AdaptiveController {
    cfg: AdaptiveConfig,
    k: usize,
    ewma_acceptance: Option<f32>,
}

impl AdaptiveController {
    pub fn new(initial_k: usize, cfg: AdaptiveConfig) -> Self {
        let k = initial_k.clamp(cfg.k_min, cfg.k_max);
        Self { cfg, k, ewma_acceptance: None }
    }

    pub fn current_k(&self) -> usize {
        self.k
    }

    pub fn ewma_acceptance(&self) -> f32 {
        self.ewma_acceptance.unwrap_or(0.0)
    }

    /// Folds one round's observed acceptance rate and peak draft
    /// confidence into the EWMA, then returns the K to use for the next
    /// round. Call once per completed speculative round.
    pub fn observe(&mut self, acceptance_rate: f32, max_draft_confidence: f32) -> usize {
        let alpha = self.cfg.ewma_alpha;
        let updated = match self.ewma_acceptance {
            Some(prev) => alpha * acceptance_rate + (1.0 - alpha) * prev,
            None => acceptance_rate,
        };
        self.ewma_acceptance = Some(updated);

        let mut next_k = self.k;
        if updated >= self.cfg.accept_high_watermark {
            next_k = (next_k + 1).min(self.cfg.k_max);
        } else if updated <= self.cfg.accept_low_watermark {
            next_k = next_k.saturating_sub(1).max(self.cfg.k_min);
        }

        if max_draft_confidence < self.cfg.low_confidence_threshold {
            next_k = next_k.min(self.cfg.low_confidence_k_cap).max(self.cfg.k_min);
        }

        self.k = next_k;
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AdaptiveConfig {
        AdaptiveConfig {
            k_min: 1,
            k_max: 8,
            ewma_alpha: 0.1,
            accept_high_watermark: 0.85,
            accept_low_watermark: 0.4,
            low_confidence_threshold: 0.3,
            low_confidence_k_cap: 2,
        }
    }

    #[test]
    fn high_acceptance_grows_k() {
        let mut ctrl = AdaptiveController::new(4, cfg());
        for _ in 0..30 {
            ctrl.observe(1.0, 0.9);
        }
        assert_eq!(ctrl.current_k(), 8, "sustained full acceptance should saturate at k_max");
    }

    #[test]
    fn low_acceptance_shrinks_k_by_at_least_two_over_twenty_rounds() {
        let mut ctrl = AdaptiveController::new(4, cfg());
        let initial = ctrl.current_k();
        for _ in 0..20 {
            ctrl.observe(0.1, 0.9);
        }
        assert!(initial - ctrl.current_k() >= 2, "k={}", ctrl.current_k());
        assert_eq!(ctrl.current_k(), 1);
    }

    #[test]
    fn mid_acceptance_holds_k_steady() {
        let mut ctrl = AdaptiveController::new(4, cfg());
        for _ in 0..10 {
            ctrl.observe(0.6, 0.9);
        }
        assert_eq!(ctrl.current_k(), 4);
    }

    #[test]
    fn low_confidence_caps_k_even_after_growth() {
        let mut ctrl = AdaptiveController::new(4, cfg());
        for _ in 0..10 {
            ctrl.observe(1.0, 0.9);
        }
        assert!(ctrl.current_k() > 2);
        let next = ctrl.observe(1.0, 0.1);
        assert_eq!(next, 2, "low draft confidence must cap next K at low_confidence_k_cap");
    }

    #[test]
    fn k_never_leaves_configured_bounds() {
        let mut ctrl = AdaptiveController::new(1, cfg());
        for _ in 0..5 {
            ctrl.observe(0.0, 0.9);
        }
        assert!(ctrl.current_k() >= cfg().k_min);
    }
}
