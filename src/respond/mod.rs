//! Automated response generation: scenario selection, account-voiced
//! prompts, and the strategist/writer orchestration.

pub mod orchestrator;
pub mod prompts;
pub mod scenario;

pub use orchestrator::ResponseOrchestrator;
pub use scenario::Scenario;
