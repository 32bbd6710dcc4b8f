use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt,
    prelude::*,
};

pub fn stderr_level(verbosity: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::WARN;
    }
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Installs the global subscriber: a compact stderr layer (overridable via
/// `RUST_LOG`) and, when requested, a plain-text file layer at DEBUG.
pub fn setup_logging(verbosity: u8, quiet: bool, log_file: Option<&Path>) -> Result<()> {
    let stderr_filter = EnvFilter::builder()
        .with_default_directive(stderr_level(verbosity, quiet).into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(stderr_filter);

    let registry = tracing_subscriber::registry().with(stderr_layer);

    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_target(true)
            .with_filter(LevelFilter::DEBUG);
        registry.with(file_layer).try_init()?;
    } else {
        registry.try_init()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_level_and_quiet_caps_it() {
        assert_eq!(stderr_level(0, false), LevelFilter::INFO);
        assert_eq!(stderr_level(1, false), LevelFilter::DEBUG);
        assert_eq!(stderr_level(5, false), LevelFilter::TRACE);
        assert_eq!(stderr_level(3, true), LevelFilter::WARN);
    }
}
