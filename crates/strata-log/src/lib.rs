//! Tracing setup for binaries and tools embedding the terrain pipeline.
//!
//! The library crates only emit through `tracing`/`log` macros; this crate
//! wires the subscriber side: a console layer with uptime timestamps and an
//! `EnvFilter` that keeps wgpu's own chatter down.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Filter precedence: `RUST_LOG` if set, then `filter_override`, then the
/// default of `info` with wgpu/naga capped at `warn`. Call once at startup;
/// a second call panics in the `tracing` runtime, so tools that may be
/// embedded twice should install their own subscriber instead.
///
/// # Examples
///
/// ```no_run
/// strata_log::init_logging(None);
/// strata_log::init_logging(Some("debug,strata_mesh=trace"));
/// ```
pub fn init_logging(filter_override: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match filter_override {
        Some(filter) => EnvFilter::new(filter),
        None => default_env_filter(),
    });

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true) // meshing workers are named
        .with_level(true)
        .with_timer(fmt::time::uptime());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .init();
}

/// The default filter: `info` everywhere, `wgpu` and `naga` at `warn`.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info,wgpu=warn,naga=warn")
}
