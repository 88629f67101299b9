pub mod cli;
pub mod ingest;
pub mod lock;
pub mod notifier;
