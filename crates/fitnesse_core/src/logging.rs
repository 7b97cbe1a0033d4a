use anyhow::{Context, Result, anyhow};
use tracing::{error, trace};
use tracing_subscriber::EnvFilter;

const NORMAL_PROFILE: &str = include_str!("profiles/logging.filter");
const VERBOSE_PROFILE: &str = include_str!("profiles/verbose-logging.filter");

/// Whether something outside the launcher already owns logging for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingState {
    Unconfigured,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogProfile {
    Normal,
    Verbose,
}

impl LogProfile {
    pub fn for_verbosity(verbose: bool) -> Self {
        if verbose { Self::Verbose } else { Self::Normal }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "logging",
            Self::Verbose => "verbose-logging",
        }
    }

    /// Filter directives of the embedded profile, comments and blank lines removed.
    pub fn directives(self) -> String {
        let source = match self {
            Self::Normal => NORMAL_PROFILE,
            Self::Verbose => VERBOSE_PROFILE,
        };
        source
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingOutcome {
    Deferred,
    Applied(LogProfile),
    Failed(LogProfile),
}

pub fn configure_logging(verbose: bool, state: LoggingState) -> LoggingOutcome {
    configure_logging_with(verbose, state, install_profile)
}

/// Select and apply a profile unless logging is owned externally. Apply
/// failures are reported and otherwise ignored.
pub fn configure_logging_with<F>(verbose: bool, state: LoggingState, apply: F) -> LoggingOutcome
where
    F: FnOnce(LogProfile) -> Result<()>,
{
    if state == LoggingState::External {
        return LoggingOutcome::Deferred;
    }

    let profile = LogProfile::for_verbosity(verbose);
    match apply(profile) {
        Ok(()) => {
            trace!(profile = profile.as_str(), "configured logging");
            LoggingOutcome::Applied(profile)
        }
        Err(err) => {
            error!("Log configuration failed: {err:#}");
            LoggingOutcome::Failed(profile)
        }
    }
}

pub fn install_profile(profile: LogProfile) -> Result<()> {
    let filter = EnvFilter::try_new(profile.directives())
        .with_context(|| format!("invalid {} profile", profile.as_str()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install {} profile: {err}", profile.as_str()))
}
