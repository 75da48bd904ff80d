//! The inference engine: paged KV cache (C4), sampler and rejection
//! arbiter (C2), speculative decoder (C5), adaptive controller (C6), and
//! the generation pipeline (C7) that ties them into a request's lifecycle.

pub mod adaptive;
pub mod events;
pub mod kv;
pub mod pipeline;
pub mod sampler;
pub mod speculative;

pub use adaptive::{AdaptiveConfig, AdaptiveController};
pub use events::{GenerationEvent, StopReason};
pub use kv::{BlockId, PagedKvCache};
pub use pipeline::{Engine, GenerationConfig, Submission};
pub use sampler::{Distribution, SamplingConfig};
pub use speculative::{Backlogs, RoundOutcome};
