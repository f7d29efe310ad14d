pub mod call;
pub mod crossref;
pub mod extraction;
pub mod improvement;
pub mod orchestrator;
pub mod prompt;
pub mod verdict;

pub use call::{cached_generate, CallFailure, CallOutcome, CallPolicy};
pub use extraction::{link_codes, parse_extraction, CodeLinkage, ExtractedChart};
pub use improvement::{ChartImprovement, InputRequest};
pub use orchestrator::{EvaluationOrchestrator, OrchestratorSettings, UnitReport};
