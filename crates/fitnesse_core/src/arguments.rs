use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::Parser;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_PATH: &str = ".";
pub const DEFAULT_ROOT: &str = "FitNesseRoot";
pub const DEFAULT_CONFIG_FILE: &str = "plugins.toml";
pub const DEFAULT_VERSION_DAYS: u32 = 14;

const PROGRAM_NAME: &str = "fitnesse";

#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("invalid command line: {0}")]
    Invalid(String),
}

/// Option grammar: `[-v][-p port][-d dir][-r root][-l logDir][-f config][-e days][-o][-i][-a userpass][-c command][-b output]`.
#[derive(Debug, Parser)]
#[command(
    name = PROGRAM_NAME,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct CommandLine {
    #[arg(short = 'v')]
    verbose: bool,
    #[arg(short = 'p', value_name = "port")]
    port: Option<u16>,
    #[arg(short = 'd', value_name = "dir")]
    root_path: Option<PathBuf>,
    #[arg(short = 'r', value_name = "root")]
    root_directory: Option<String>,
    #[arg(short = 'l', value_name = "logDir")]
    log_directory: Option<PathBuf>,
    #[arg(short = 'f', value_name = "config")]
    config_file: Option<PathBuf>,
    #[arg(short = 'e', value_name = "days")]
    days: Option<u32>,
    #[arg(short = 'o')]
    omit_updates: bool,
    #[arg(short = 'i')]
    install_only: bool,
    #[arg(short = 'a', value_name = "userpass")]
    userpass: Option<String>,
    #[arg(short = 'c', value_name = "command")]
    command: Option<String>,
    #[arg(short = 'b', value_name = "output")]
    output: Option<PathBuf>,
}

/// Launch request parsed from the process command line.
///
/// Fields that were not supplied stay `None`; the named defaults above are
/// applied by the consumers so that a configuration file can still fill the gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArguments {
    verbose: bool,
    port: Option<u16>,
    root_path: Option<PathBuf>,
    root_directory: Option<String>,
    log_directory: Option<PathBuf>,
    config_file: PathBuf,
    days_till_versions_expire: Option<u32>,
    userpass: Option<String>,
    command: Option<String>,
    output: Option<PathBuf>,
    omit_updates: bool,
    install_only: bool,
}

impl Default for LaunchArguments {
    fn default() -> Self {
        Self {
            verbose: false,
            port: None,
            root_path: None,
            root_directory: None,
            log_directory: None,
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            days_till_versions_expire: None,
            userpass: None,
            command: None,
            output: None,
            omit_updates: false,
            install_only: false,
        }
    }
}

impl From<CommandLine> for LaunchArguments {
    fn from(line: CommandLine) -> Self {
        Self {
            verbose: line.verbose,
            port: line.port,
            root_path: line.root_path,
            root_directory: line.root_directory,
            log_directory: line.log_directory,
            config_file: line
                .config_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
            days_till_versions_expire: line.days,
            userpass: line.userpass,
            command: line.command,
            output: line.output,
            omit_updates: line.omit_updates,
            install_only: line.install_only,
        }
    }
}

impl LaunchArguments {
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn root_path(&self) -> Option<&Path> {
        self.root_path.as_deref()
    }

    pub fn root_directory(&self) -> Option<&str> {
        self.root_directory.as_deref()
    }

    pub fn log_directory(&self) -> Option<&Path> {
        self.log_directory.as_deref()
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn days_till_versions_expire(&self) -> Option<u32> {
        self.days_till_versions_expire
    }

    pub fn userpass(&self) -> Option<&str> {
        self.userpass.as_deref()
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    pub fn omit_updates(&self) -> bool {
        self.omit_updates
    }

    pub fn install_only(&self) -> bool {
        self.install_only
    }
}

/// Parse the process arguments (without the program name) in one pass.
pub fn parse_command_line<I, T>(args: I) -> Result<LaunchArguments, ArgumentError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let argv = std::iter::once(OsString::from(PROGRAM_NAME)).chain(args.into_iter().map(Into::into));
    CommandLine::try_parse_from(argv)
        .map(LaunchArguments::from)
        .map_err(|err| ArgumentError::Invalid(first_line(&err.to_string())))
}

pub fn usage() -> String {
    [
        format!("Usage: {PROGRAM_NAME} [-vpdrlfeoiacb]"),
        format!("\t-p <port number> {{{DEFAULT_PORT}}}"),
        format!("\t-d <working directory> {{{DEFAULT_PATH}}}"),
        format!("\t-r <page root directory> {{{DEFAULT_ROOT}}}"),
        "\t-l <log directory> {no logging}".to_string(),
        format!("\t-f <config file> {{{DEFAULT_CONFIG_FILE}}}"),
        format!("\t-e <days> {{{DEFAULT_VERSION_DAYS}}} Number of days before page versions expire"),
        "\t-o omit updates".to_string(),
        "\t-a {user:pwd | user-file-name} enable authentication.".to_string(),
        "\t-i Install only, then quit.".to_string(),
        "\t-c <command> execute single command.".to_string(),
        "\t-b <filename> redirect command output.".to_string(),
        "\t-v {off} Verbose logging".to_string(),
    ]
    .join("\n")
}

fn first_line(message: &str) -> String {
    message
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or(message)
        .trim_start_matches("error: ")
        .to_string()
}
