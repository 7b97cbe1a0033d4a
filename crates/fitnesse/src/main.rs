use std::env;
use std::ffi::OsString;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use fitnesse_core::arguments::{LaunchArguments, parse_command_line, usage};
use fitnesse_core::bootstrap::{Launched, launch_fitnesse};
use fitnesse_core::launcher::LaunchOutcome;
use fitnesse_core::logging::LoggingState;
use fitnesse_core::plugins::PluginCatalog;
use tracing_subscriber::EnvFilter;

const LOG_CONFIG_ENV: &str = "FITNESSE_LOG_CONFIG";
const USAGE_EXIT: u8 = 1;
const MAX_FAILURE_EXIT: u8 = 254;
const FATAL_EXIT: u8 = 255;

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let arguments = match parse_arguments(env::args_os().skip(1)) {
        Ok(arguments) => arguments,
        Err(code) => return ExitCode::from(code),
    };
    let logging = logging_state(
        tracing::dispatcher::has_been_set(),
        env::var(LOG_CONFIG_ENV).ok().as_deref(),
        install_filter,
    );
    ExitCode::from(run(&arguments, logging))
}

/// Usage problems print the usage text and map to the usage exit code.
fn parse_arguments<I>(args: I) -> Result<LaunchArguments, u8>
where
    I: IntoIterator<Item = OsString>,
{
    parse_command_line(args).map_err(|err| {
        eprintln!("{err}");
        eprintln!("{}", usage());
        USAGE_EXIT
    })
}

fn run(arguments: &LaunchArguments, logging: LoggingState) -> u8 {
    let finished =
        launch_fitnesse(arguments, logging, &PluginCatalog::default()).and_then(finish);
    match finished {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:?}");
            FATAL_EXIT
        }
    }
}

fn finish(launched: Launched) -> Result<u8> {
    match exit_status(launched.outcome) {
        Some(code) => Ok(code),
        None => {
            launched.server.wait()?;
            Ok(0)
        }
    }
}

/// `None` while the service keeps running.
fn exit_status(outcome: LaunchOutcome) -> Option<u8> {
    match outcome {
        LaunchOutcome::NoFurtherAction => Some(0),
        LaunchOutcome::ServiceRunning => None,
        LaunchOutcome::Exit(failures) => Some(
            u8::try_from(failures.clamp(0, i32::from(MAX_FAILURE_EXIT)))
                .unwrap_or(MAX_FAILURE_EXIT),
        ),
    }
}

/// Logging belongs to someone else when a subscriber already exists or the
/// environment carries a usable filter. A bad filter falls back to the built-in profiles.
fn logging_state<F>(subscriber_set: bool, directives: Option<&str>, install: F) -> LoggingState
where
    F: FnOnce(EnvFilter) -> Result<()>,
{
    if subscriber_set {
        return LoggingState::External;
    }
    let Some(directives) = directives else {
        return LoggingState::Unconfigured;
    };
    let installed = EnvFilter::try_new(directives)
        .with_context(|| format!("invalid {LOG_CONFIG_ENV} value `{directives}`"))
        .and_then(install);
    match installed {
        Ok(()) => LoggingState::External,
        Err(err) => {
            eprintln!("warning: {err:#}; using the built-in logging profile");
            LoggingState::Unconfigured
        }
    }
}

fn install_filter(filter: EnvFilter) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install {LOG_CONFIG_ENV} filter: {err}"))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;

    use anyhow::bail;
    use tempfile::tempdir;

    use super::*;

    fn args(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[test]
    fn usage_error_exits_with_one() {
        assert_eq!(parse_arguments(args(&["-x"])).err(), Some(USAGE_EXIT));
        assert_eq!(parse_arguments(args(&["-p"])).err(), Some(USAGE_EXIT));
        assert!(parse_arguments(args(&["-i", "-o"])).is_ok());
    }

    #[test]
    fn failure_count_is_the_exit_code_up_to_254() {
        assert_eq!(exit_status(LaunchOutcome::Exit(0)), Some(0));
        assert_eq!(exit_status(LaunchOutcome::Exit(3)), Some(3));
        assert_eq!(exit_status(LaunchOutcome::Exit(254)), Some(254));
        assert_eq!(exit_status(LaunchOutcome::Exit(255)), Some(254));
        assert_eq!(exit_status(LaunchOutcome::Exit(i32::MAX)), Some(254));
        assert_eq!(exit_status(LaunchOutcome::NoFurtherAction), Some(0));
        assert_eq!(exit_status(LaunchOutcome::ServiceRunning), None);
    }

    #[test]
    fn install_only_run_exits_cleanly() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().to_str().expect("utf8");
        let arguments = parse_arguments(args(&["-i", "-o", "-d", dir])).expect("parse");
        assert_eq!(run(&arguments, LoggingState::External), 0);
    }

    #[test]
    fn fatal_bootstrap_error_exits_with_255() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("FitNesseRoot"), "file in the way").expect("write");
        let dir = temp.path().to_str().expect("utf8");
        let arguments = parse_arguments(args(&["-i", "-o", "-d", dir])).expect("parse");
        assert_eq!(run(&arguments, LoggingState::External), FATAL_EXIT);
    }

    #[test]
    fn existing_subscriber_means_external_logging() {
        let state = logging_state(true, Some("info"), |_| bail!("must not install"));
        assert_eq!(state, LoggingState::External);
    }

    #[test]
    fn valid_log_config_is_installed_here() {
        let installs = Cell::new(0);
        let state = logging_state(false, Some("info,fitnesse_core=debug"), |_| {
            installs.set(installs.get() + 1);
            Ok(())
        });
        assert_eq!(state, LoggingState::External);
        assert_eq!(installs.get(), 1);
    }

    #[test]
    fn malformed_log_config_falls_back_to_builtin_profiles() {
        let installs = Cell::new(0);
        let state = logging_state(false, Some("not[valid"), |_| {
            installs.set(installs.get() + 1);
            Ok(())
        });
        assert_eq!(state, LoggingState::Unconfigured);
        assert_eq!(installs.get(), 0);
    }

    #[test]
    fn failed_install_falls_back_to_builtin_profiles() {
        let state = logging_state(false, Some("info"), |_| bail!("subscriber already set"));
        assert_eq!(state, LoggingState::Unconfigured);
    }

    #[test]
    fn missing_log_config_leaves_logging_to_the_launcher() {
        let state = logging_state(false, None, |_| bail!("must not install"));
        assert_eq!(state, LoggingState::Unconfigured);
    }
}
