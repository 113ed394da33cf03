/// Initialize structured JSON logging.
///
/// The default level is `info`, or `debug` when debug mode is on; both can
/// be overridden through `MURMUR_LOG`. Native whisper.cpp log lines arrive
/// through the same `tracing` pipeline (the engine installs the trampoline),
/// so the filter governs them too: debug-level native chatter is suppressed
/// unless debug mode is enabled.
#[cfg(feature = "logging")]
pub fn init(debug: bool) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default_level = if debug {
        tracing::level_filters::LevelFilter::DEBUG
    } else {
        tracing::level_filters::LevelFilter::INFO
    };

    let filter = EnvFilter::builder()
        .with_env_var("MURMUR_LOG")
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .try_init();
}

/// Initialize logging when the `logging` feature is not enabled.
///
/// Kept as a no-op so library consumers can call `murmur::init_logging`
/// without pulling in `tracing-subscriber`.
#[cfg(not(feature = "logging"))]
pub fn init(_debug: bool) {}
