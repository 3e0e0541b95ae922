//! Log subscriber setup for nodes and binaries.

#[cfg(feature = "trace")]
pub use tracer::init_tracer;

#[cfg(feature = "trace")]
mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    /// Installs the global subscriber.
    ///
    /// `RUST_LOG` directives refine the default level. `NF_LOG_TO_STDERR`
    /// writes to stderr instead of stdout and `NF_DISABLE_LOGS` turns output
    /// off. Calling this more than once keeps the first subscriber.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy()
            .add_directive("hyper=warn".parse()?)
            .add_directive("tower=warn".parse()?);

        if std::env::var("NF_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let to_stderr = std::env::var("NF_LOG_TO_STDERR").is_ok();
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_thread_names(true)
            .with_file(with_location)
            .with_line_number(with_location);
        let fmt_layer = if to_stderr {
            fmt_layer.with_writer(std::io::stderr).boxed()
        } else {
            fmt_layer.boxed()
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            tracing::debug!("global subscriber already installed");
        }
        Ok(())
    }

}
