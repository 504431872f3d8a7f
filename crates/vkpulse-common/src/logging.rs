use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging with environment filter.
/// Set VKPULSE_LOG=debug (or trace, info, warn, error) for verbosity control.
///
/// The layer runs inside an arbitrary application's process, so output goes
/// to stderr and installation must tolerate a subscriber the host already
/// set up. Calling this more than once is a no-op.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("VKPULSE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();
}
