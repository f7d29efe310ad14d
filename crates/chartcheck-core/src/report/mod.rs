pub mod console;
pub mod summary;

pub use summary::{Counts, RunSummary};
