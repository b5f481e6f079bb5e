// Credential records, encrypted storage and refresh history
pub mod credentials;

// Template rendering, response extraction and the refresh engine
pub mod refresher;

// Periodic refresh loop
pub mod scheduler;

// Admin HTTP API
pub mod api;

// HTTP Basic credential parsing
pub mod auth;

// Configuration loading
pub mod config;

// Tracing setup
pub mod logging;

pub use credentials::{CredentialRecord, CredentialStore, RefreshStatus};
pub use refresher::{RefreshEngine, RefreshError};
pub use scheduler::Scheduler;
