//! Console + optional file logging, filtered by `RUST_LOG`.

use tracing_subscriber::{fmt, layer::SubscriberExt};

/// Start logging to console, and to `path` when given. Returns an
/// error if a global subscriber is already installed.
pub fn initiate_logging<P: AsRef<std::path::Path>>(
    path: Option<P>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let file_layer = if let Some(path) = &path {
        let file = std::fs::File::create(path)?;
        let file_writer = std::sync::Mutex::new(file);
        Some(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let with_ansi = !cfg!(windows);
    let console_layer = fmt::layer()
        .with_ansi(with_ansi)
        .with_file(true)
        .with_line_number(true);

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(tracing_subscriber::filter::EnvFilter::from_default_env());
    tracing::subscriber::set_global_default(collector)?;

    if let Some(path) = &path {
        tracing::debug!("logging to file \"{}\"", path.as_ref().display());
    }
    Ok(())
}
