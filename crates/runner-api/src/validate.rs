//! Request validation (C10, external-interfaces table): maps the wire
//! shape of a generation request to a validated `GenerationConfig`,
//! rejecting anything out of bounds with `RunnerError::Input` before it
//! ever reaches the engine.

use serde::Deserialize;

use runner_common::config::RunnerConfig;
use runner_common::RunnerError;
use runner_core::{GenerationConfig, SamplingConfig};

fn default_max_tokens() -> usize {
    100
}

fn default_temperature() -> f32 {
    0.7
}

fn default_speculation_depth() -> usize {
    4
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    #[serde(default = "default_speculation_depth")]
    pub speculation_depth: usize,
    #[serde(default = "default_true")]
    pub use_speculative: bool,
    #[serde(default = "default_true")]
    pub adaptive: bool,
    #[serde(default)]
    pub stop: Vec<String>,
    pub seed: Option<u64>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_k: None,
            top_p: None,
            speculation_depth: default_speculation_depth(),
            use_speculative: true,
            adaptive: true,
            stop: Vec::new(),
            seed: None,
        }
    }
}

impl GenerationRequest {
    /// Validates every field against `cfg`'s bounds and maps the request
    /// down to the internal shape the pipeline consumes. Prompt is kept
    /// separate from `GenerationConfig` since the engine treats it as
    /// the thing to encode, not a generation parameter.
    pub fn into_generation_config(self, cfg: &RunnerConfig) -> Result<(String, GenerationConfig), RunnerError> {
        if self.prompt.is_empty() {
            return Err(RunnerError::Input("prompt must not be empty".into()));
        }
        if self.prompt.len() > cfg.max_prompt_len {
            return Err(RunnerError::Input(format!(
                "prompt length {} exceeds max_prompt_len {}",
                self.prompt.len(),
                cfg.max_prompt_len
            )));
        }
        if self.max_tokens == 0 || self.max_tokens > cfg.max_tokens_limit {
            return Err(RunnerError::Input(format!(
                "max_tokens must be in [1, {}], got {}",
                cfg.max_tokens_limit, self.max_tokens
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RunnerError::Input(format!("temperature must be in [0, 2], got {}", self.temperature)));
        }
        if let Some(k) = self.top_k {
            if k == 0 {
                return Err(RunnerError::Input("top_k must be >= 1 when set".into()));
            }
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(RunnerError::Input(format!("top_p must be in (0, 1], got {p}")));
            }
        }
        if self.speculation_depth > 8 {
            return Err(RunnerError::Input(format!("speculation_depth must be in [0, 8], got {}", self.speculation_depth)));
        }
        if self.stop.len() > cfg.max_stop_strings {
            return Err(RunnerError::Input(format!(
                "stop accepts at most {} strings, got {}",
                cfg.max_stop_strings,
                self.stop.len()
            )));
        }

        let gen_cfg = GenerationConfig {
            max_tokens: self.max_tokens,
            sampling: SamplingConfig { temperature: self.temperature, top_k: self.top_k, top_p: self.top_p, seed: self.seed },
            speculation_depth: self.speculation_depth,
            use_speculative: self.use_speculative,
            adaptive: self.adaptive,
            stop_strings: self.stop,
        };
        Ok((self.prompt, gen_cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> GenerationRequest {
        GenerationRequest { prompt: "hello".into(), ..Default::default() }
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let cfg = RunnerConfig::default();
        let r = GenerationRequest { prompt: String::new(), ..Default::default() };
        assert!(r.into_generation_config(&cfg).is_err());
    }

    #[test]
    fn max_tokens_over_limit_is_rejected() {
        let cfg = RunnerConfig::default();
        let r = GenerationRequest { max_tokens: cfg.max_tokens_limit + 1, ..req() };
        assert!(r.into_generation_config(&cfg).is_err());
    }

    #[test]
    fn temperature_out_of_range_is_rejected() {
        let cfg = RunnerConfig::default();
        let r = GenerationRequest { temperature: 3.0, ..req() };
        assert!(r.into_generation_config(&cfg).is_err());
    }

    #[test]
    fn top_p_of_zero_is_rejected() {
        let cfg = RunnerConfig::default();
        let r = GenerationRequest { top_p: Some(0.0), ..req() };
        assert!(r.into_generation_config(&cfg).is_err());
    }

    #[test]
    fn too_many_stop_strings_is_rejected() {
        let cfg = RunnerConfig::default();
        let r = GenerationRequest { stop: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()], ..req() };
        assert!(r.into_generation_config(&cfg).is_err());
    }

    #[test]
    fn valid_request_maps_fields_through() {
        let cfg = RunnerConfig::default();
        let r = GenerationRequest { max_tokens: 50, temperature: 0.0, top_k: Some(40), seed: Some(7), ..req() };
        let (prompt, gen_cfg) = r.into_generation_config(&cfg).unwrap();
        assert_eq!(prompt, "hello");
        assert_eq!(gen_cfg.max_tokens, 50);
        assert_eq!(gen_cfg.sampling.top_k, Some(40));
        assert_eq!(gen_cfg.sampling.seed, Some(7));
    }
}
