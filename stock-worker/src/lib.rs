pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod evaluator;
pub mod mqtt;
pub mod notifier;
pub mod parser;
pub mod reconciler;
pub mod store;
pub mod types;
