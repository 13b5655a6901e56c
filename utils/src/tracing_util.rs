//! Helpers related to tracing, used by main entrypoints

/// Initialize tracing from `RUST_LOG` (or `SANDPAK_LOG` when set), writing
/// to stderr. Call once, early in main.
pub fn initialize_tracing() {
    let filter = std::env::var("SANDPAK_LOG")
        .ok()
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::from_default_env());
    // No timestamps; log consumers such as journald already add them.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
