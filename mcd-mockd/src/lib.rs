//! In-process memcached node speaking the binary protocol and Greenstack,
//! used by the client integration tests.

pub mod error;
mod greenstack;
mod mcbp;
mod server;
pub mod store;

pub use error::MockError;
pub use server::{server_config_from_der, MockConfig, MockServer};

/// Installs a `tracing` subscriber honouring `RUST_LOG`; repeated calls are
/// no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
