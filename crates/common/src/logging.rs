use tracing_subscriber::{fmt, EnvFilter};

/// Installs the stderr subscriber once. `RUST_LOG` overrides the default
/// directives; without it the chatty http and db crates are capped at warn.
pub fn init_logging(default_level: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{default_level},hyper=warn,reqwest=warn,sqlx=warn"
        ))
    });

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
