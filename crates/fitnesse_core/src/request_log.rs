use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

const LOG_FILE_NAME: &str = "fitnesse-requests.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub peer: Option<SocketAddr>,
    pub request_line: String,
    pub user: Option<String>,
    pub status: u16,
    pub bytes: usize,
}

/// Appends one line per served request to `<dir>/fitnesse-requests.log`.
#[derive(Debug)]
pub struct RequestLogger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RequestLogger {
    pub fn open(directory: &Path) -> Result<Self> {
        fs::create_dir_all(directory)
            .with_context(|| format!("failed to create {}", directory.display()))?;
        Ok(Self {
            path: directory.join(LOG_FILE_NAME),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, record: &RequestRecord) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        writeln!(
            file,
            "{} - {} [{}] \"{}\" {} {}",
            record
                .peer
                .map(|peer| peer.ip().to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.user.as_deref().unwrap_or("-"),
            stamp,
            record.request_line,
            record.status,
            record.bytes
        )
        .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

impl fmt::Display for RequestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestLogger({})", self.path.display())
    }
}

pub fn make_request_logger(directory: Option<&Path>) -> Result<Option<RequestLogger>> {
    directory.map(RequestLogger::open).transpose()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn no_directory_means_no_logger() {
        assert!(make_request_logger(None).expect("logger").is_none());
    }

    #[test]
    fn records_are_appended() {
        let temp = tempdir().expect("tempdir");
        let logger = make_request_logger(Some(&temp.path().join("logs")))
            .expect("logger")
            .expect("some logger");
        for status in [200, 404] {
            logger
                .log(&RequestRecord {
                    peer: Some("127.0.0.1:4000".parse().expect("addr")),
                    request_line: "GET /FrontPage HTTP/1.1".to_string(),
                    user: None,
                    status,
                    bytes: 12,
                })
                .expect("log");
        }

        let content = fs::read_to_string(logger.path()).expect("read log");
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("127.0.0.1 - - ["));
        assert!(lines[1].ends_with("\"GET /FrontPage HTTP/1.1\" 404 12"));
    }
}
