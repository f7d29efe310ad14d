pub mod cache;
pub mod config;
pub mod document;
pub mod engine;
pub mod errors;
pub mod model;
pub mod pricing;
pub mod providers;
pub mod recovery;
pub mod report;
pub mod retrieval;
pub mod targets;
pub mod usage;
