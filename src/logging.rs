//! Ambient logging setup for embedders that want a sensible default
//! subscriber rather than configuring `tracing_subscriber` themselves.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber reading `RUST_LOG`, defaulting to `debug` for
/// this crate and `warn` for the chatty `mdns_sd` backend. Safe to call more
/// than once; later calls are no-ops (the global subscriber can only be set
/// once per process).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info")
            .add_directive("warpdeck_core=debug".parse().expect("valid directive"))
            .add_directive("mdns_sd=warn".parse().expect("valid directive"))
    });

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
