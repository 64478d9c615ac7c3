//! Subscriber setup for binaries embedding the driver library.

use tracing_subscriber::EnvFilter;

pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install a global `fmt` subscriber writing to stderr.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(json: bool) -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    }
}
