//! `GenerationEvent`: the tagged union the pipeline emits, consumed by
//! whatever transport adapter the API crate wires up (§4.8's
//! transport-agnostic contract — the core only produces a lazy sequence of
//! these, it never frames a wire format itself).

use serde::Serialize;

/// Why a sequence stopped (§4.7's Stopping state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxTokens,
    EosSampled,
    StopString,
    Deadline,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Token {
        index: u32,
        is_final: bool,
        text: String,
        logical_index: usize,
        accepted: bool,
    },
    Metrics {
        index: u32,
        is_final: bool,
        acceptance_rate: f32,
        tokens_per_second: f32,
        current_k: usize,
    },
    Done {
        index: u32,
        is_final: bool,
        reason: StopReason,
    },
    Error {
        index: u32,
        is_final: bool,
        kind: String,
        message: String,
    },
}

impl GenerationEvent {
    pub fn is_final(&self) -> bool {
        match self {
            GenerationEvent::Token { is_final, .. } => *is_final,
            GenerationEvent::Metrics { is_final, .. } => *is_final,
            GenerationEvent::Done { is_final, .. } => *is_final,
            GenerationEvent::Error { is_final, .. } => *is_final,
        }
    }
}
