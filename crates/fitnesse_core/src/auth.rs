use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::{self, MergedConfiguration};

pub trait Authenticator: fmt::Debug + fmt::Display + Send + Sync {
    fn is_authenticated(&self, user: Option<&str>, password: Option<&str>) -> bool;

    /// Whether requests must carry credentials at all.
    fn requires_credentials(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromiscuousAuthenticator;

impl Authenticator for PromiscuousAuthenticator {
    fn is_authenticated(&self, _user: Option<&str>, _password: Option<&str>) -> bool {
        true
    }

    fn requires_credentials(&self) -> bool {
        false
    }
}

impl fmt::Display for PromiscuousAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PromiscuousAuthenticator")
    }
}

#[derive(Debug, Clone)]
pub struct OneUserAuthenticator {
    user: String,
    password: String,
}

impl OneUserAuthenticator {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

impl Authenticator for OneUserAuthenticator {
    fn is_authenticated(&self, user: Option<&str>, password: Option<&str>) -> bool {
        user == Some(self.user.as_str()) && password == Some(self.password.as_str())
    }
}

impl fmt::Display for OneUserAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OneUserAuthenticator({})", self.user)
    }
}

/// Password file of `user:sha256hex` lines.
#[derive(Debug, Clone)]
pub struct MultiUserAuthenticator {
    source: PathBuf,
    users: BTreeMap<String, String>,
}

impl MultiUserAuthenticator {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read password file {}", path.display()))?;
        let mut users = BTreeMap::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((user, digest)) if !user.trim().is_empty() => {
                    users.insert(user.trim().to_string(), digest.trim().to_ascii_lowercase());
                }
                _ => warn!(
                    path = %path.display(),
                    line = index + 1,
                    "skipping malformed password entry"
                ),
            }
        }
        Ok(Self {
            source: path.to_path_buf(),
            users,
        })
    }

}

impl Authenticator for MultiUserAuthenticator {
    fn is_authenticated(&self, user: Option<&str>, password: Option<&str>) -> bool {
        let (Some(user), Some(password)) = (user, password) else {
            return false;
        };
        self.users
            .get(user)
            .is_some_and(|digest| *digest == hash_password(password))
    }
}

impl fmt::Display for MultiUserAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MultiUserAuthenticator({}, {} users)",
            self.source.display(),
            self.users.len()
        )
    }
}

pub fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// `-a user:pwd` wins, then `-a <file>`, then the `Authenticator` key, then everyone is let in.
pub fn make_authenticator(
    userpass: Option<&str>,
    config: &MergedConfiguration,
) -> Result<Box<dyn Authenticator>> {
    if let Some(userpass) = userpass {
        if let Some((user, password)) = userpass.split_once(':') {
            if user.is_empty() {
                bail!("authentication requires a user name in `user:pwd`");
            }
            return Ok(Box::new(OneUserAuthenticator::new(user, password)));
        }
        return Ok(Box::new(MultiUserAuthenticator::load(Path::new(userpass))?));
    }

    match config.get(config::AUTHENTICATOR).map(str::trim) {
        None | Some("") | Some("promiscuous") => Ok(Box::new(PromiscuousAuthenticator)),
        Some(value) => match value.split_once(':') {
            Some((user, password)) if !user.is_empty() => {
                Ok(Box::new(OneUserAuthenticator::new(user, password)))
            }
            _ => Ok(Box::new(MultiUserAuthenticator::load(Path::new(value))?)),
        },
    }
}
