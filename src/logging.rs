//! Tracing subscriber setup for the `dix` binary.
//!
//! Filter priority, highest first:
//!
//! 1. `DOCINDEX_LOG` (directives such as `docindex=debug,warn`)
//! 2. `RUST_LOG`
//! 3. `--verbose` → debug, `--quiet` → error
//! 4. `warn`
//!
//! Output goes to stderr so command output on stdout stays clean.

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DOCINDEX_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// Verbose wins when both flags are given.
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    pub fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::WARN,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(verbosity: Verbosity) {
    let filter = build_env_filter(verbosity, std::env::var(LOG_ENV).ok());
    let use_ansi = atty::is(atty::Stream::Stderr);

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_target(verbosity == Verbosity::Verbose);

    let result = if verbosity == Verbosity::Verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.with_timer(fmt::time::uptime()))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.without_time().compact())
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn build_env_filter(verbosity: Verbosity, project_directives: Option<String>) -> EnvFilter {
    if let Some(filter) = project_directives.and_then(|d| EnvFilter::try_new(d).ok()) {
        return filter;
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let level = verbosity.default_level();
    if verbosity == Verbosity::Verbose {
        EnvFilter::new(format!("warn,docindex={},dix={}", level, level))
    } else {
        EnvFilter::new(level.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_from_flags() {
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
        assert_eq!(Verbosity::Quiet.default_level(), Level::ERROR);
    }

    #[test]
    fn test_project_directives_take_priority() {
        let filter = build_env_filter(Verbosity::Quiet, Some("docindex=trace".to_string()));
        assert!(filter.to_string().contains("docindex=trace"));
    }
}
