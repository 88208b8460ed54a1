//! Inbound processing pipeline: conversation resolution, spam gating,
//! engagement scoring, the review gate, and the processor that drives
//! each record through them.

pub mod attrs;
pub mod ev;
pub mod normalizer;
pub mod processor;
pub mod review;
pub mod spam;

pub use attrs::AttributeExtractor;
pub use ev::{EvScore, EvScorer};
pub use normalizer::{resolve_conversation, ResolvedConversation};
pub use processor::{EmailProcessor, ProcessOutcome};
pub use review::{ReviewGate, ReviewVerdict};
pub use spam::SpamGate;
