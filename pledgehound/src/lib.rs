// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

#[path = "commands.rs"]
pub mod commands;

// Re-export the helpers the binary and tests lean on
pub use handlers::{
    ContactsConfig, PipelineConfig, PipelineSummary, expand_path, filter_recent, log_directive,
    resolve_proxy_url, run_pipeline,
};
