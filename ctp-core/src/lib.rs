//! Core runtime pieces shared by every crate in the workspace.
//!
//! Provides the error catalog and the HTTP-facing [`ApiError`] type, the
//! environment-backed [`AppConfig`] loader, the request-scoped actor
//! context used to stamp audit columns, and the paging types used by all
//! list endpoints.

pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod page;

pub use catalog::{ErrorCategory, ErrorDefinition, ErrorSeverity};
pub use config::{AppConfig, ConfigError};
pub use context::{current_actor, RequestContext};
pub use error::{ApiError, FieldError};
pub use page::{PageParams, TOTAL_COUNT_HEADER};

/// Initialise the global tracing subscriber from `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
