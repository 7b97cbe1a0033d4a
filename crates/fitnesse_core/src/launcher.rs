use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::arguments::LaunchArguments;

/// Result of one command; `failures` becomes the process exit code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub failures: u32,
}

pub trait Service {
    /// `Ok(false)` when the service could not begin serving (for example a busy port).
    fn start(&mut self) -> Result<bool>;
    fn execute_single_command(
        &mut self,
        command: &str,
        output: &mut dyn Write,
    ) -> Result<CommandOutcome>;
    fn stop(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Install-only run: nothing was started.
    NoFurtherAction,
    /// The service is serving requests until the process is terminated.
    ServiceRunning,
    Exit(i32),
}

pub fn launch<S: Service + ?Sized>(
    arguments: &LaunchArguments,
    service: &mut S,
) -> Result<LaunchOutcome> {
    if arguments.install_only() {
        info!("Install only, not starting");
        return Ok(LaunchOutcome::NoFurtherAction);
    }
    if !service.start()? {
        bail!("service failed to start");
    }
    match arguments.command() {
        Some(command) => execute_single_command(command, arguments.output(), service),
        None => Ok(LaunchOutcome::ServiceRunning),
    }
}

fn execute_single_command<S: Service + ?Sized>(
    command: &str,
    output: Option<&Path>,
    service: &mut S,
) -> Result<LaunchOutcome> {
    info!("Executing command: {command}");

    let mut sink = match OutputSink::open(output) {
        Ok(sink) => sink,
        Err(err) => {
            service.stop()?;
            return Err(err);
        }
    };

    let executed = service.execute_single_command(command, &mut sink);
    let stopped = service.stop();
    let closed = sink.close();

    let outcome = executed?;
    stopped?;
    closed?;

    let code = i32::try_from(outcome.failures).unwrap_or(i32::MAX);
    Ok(LaunchOutcome::Exit(code))
}

/// Where single-command output goes. Standard output is flushed but never closed.
enum OutputSink {
    File { path: PathBuf, writer: BufWriter<File> },
    Stdout(io::Stdout),
}

impl OutputSink {
    fn open(output: Option<&Path>) -> Result<Self> {
        match output {
            Some(path) => {
                info!("-----Command Output redirected to {}-----", path.display());
                let file = File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                Ok(Self::File {
                    path: path.to_path_buf(),
                    writer: BufWriter::new(file),
                })
            }
            None => {
                info!("-----Command Output-----");
                Ok(Self::Stdout(io::stdout()))
            }
        }
    }

    fn close(self) -> Result<()> {
        match self {
            Self::File { path, writer } => {
                let file = writer
                    .into_inner()
                    .map_err(|err| err.into_error())
                    .with_context(|| format!("failed to flush {}", path.display()))?;
                file.sync_all()
                    .with_context(|| format!("failed to sync {}", path.display()))?;
                Ok(())
            }
            Self::Stdout(mut stdout) => {
                stdout.flush().context("failed to flush standard output")?;
                info!("-----Command Complete-----");
                Ok(())
            }
        }
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::File { writer, .. } => writer.write(buf),
            Self::Stdout(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File { writer, .. } => writer.flush(),
            Self::Stdout(stdout) => stdout.flush(),
        }
    }
}
