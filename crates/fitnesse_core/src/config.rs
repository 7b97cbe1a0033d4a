use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

use toml::Value;
use tracing::{debug, info, warn};

use crate::arguments::LaunchArguments;

pub const WIKI_PAGE_FACTORY: &str = "WikiPageFactory";
pub const VERSIONS_CONTROLLER: &str = "VersionsController";
pub const VERSIONS_CONTROLLER_DAYS: &str = "VersionsController.days";
pub const RECENT_CHANGES: &str = "RecentChanges";
pub const AUTHENTICATOR: &str = "Authenticator";
pub const THEME: &str = "Theme";
pub const PORT: &str = "Port";
pub const ROOT_PATH: &str = "RootPath";
pub const ROOT_DIRECTORY: &str = "FitNesseRoot";
pub const LOG_DIRECTORY: &str = "LogDirectory";
pub const PLUGINS: &str = "Plugins";
pub const RESPONDERS: &str = "Responders";
pub const SYMBOL_TYPES: &str = "SymbolTypes";
pub const CONTENT_FILTER: &str = "ContentFilter";
pub const SLIM_TABLES: &str = "SlimTables";
pub const CUSTOM_COMPARATORS: &str = "CustomComparators";

/// Flat key/value view over the configuration file with command-line values overlaid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedConfiguration {
    values: BTreeMap<String, String>,
}

impl MergedConfiguration {
    pub fn from_file_values(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Typed lookup; an unparsable value is reported and treated as absent.
    pub fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, value = raw, "ignoring unparsable configuration value");
                None
            }
        }
    }

    /// Comma-separated list, blanks dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Comma-separated `name:id` pairs. Entries without a colon are reported and skipped.
    pub fn pairs(&self, key: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for item in self.list(key) {
            match item.split_once(':') {
                Some((name, id)) if !name.trim().is_empty() && !id.trim().is_empty() => {
                    pairs.push((name.trim().to_string(), id.trim().to_string()));
                }
                _ => warn!(key, entry = %item, "expected `name:id` entry"),
            }
        }
        pairs
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Load the optional configuration file. Never fails: a missing file yields an
/// empty mapping and a malformed one yields whatever could be read.
pub fn load_config_file(path: &Path) -> BTreeMap<String, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let shown = fs::canonicalize(dir)
                .map(|dir| dir.join(path.file_name().unwrap_or_default()))
                .unwrap_or_else(|_| path.to_path_buf());
            info!("No configuration file found ({})", shown.display());
            return BTreeMap::new();
        }
        Err(err) => {
            warn!("Error reading configuration: {err}");
            return BTreeMap::new();
        }
    };

    let table = match content.parse::<toml::Table>() {
        Ok(table) => table,
        Err(err) => {
            warn!("Error reading configuration: {}", err.message());
            return BTreeMap::new();
        }
    };

    let mut values = BTreeMap::new();
    flatten_table("", &table, &mut values);
    debug!(path = %path.display(), keys = values.len(), "loaded configuration file");
    values
}

/// Overlay the command-line values that have a configuration counterpart.
/// Only explicitly supplied options are written, so file values survive otherwise.
pub fn merge_configuration(
    file_values: BTreeMap<String, String>,
    arguments: &LaunchArguments,
) -> MergedConfiguration {
    let mut merged = MergedConfiguration::from_file_values(file_values);
    if let Some(days) = arguments.days_till_versions_expire() {
        merged.set(VERSIONS_CONTROLLER_DAYS, days.to_string());
    }
    if let Some(port) = arguments.port() {
        merged.set(PORT, port.to_string());
    }
    if let Some(root_path) = arguments.root_path() {
        merged.set(ROOT_PATH, root_path.to_string_lossy());
    }
    if let Some(root_directory) = arguments.root_directory() {
        merged.set(ROOT_DIRECTORY, root_directory);
    }
    if let Some(log_directory) = arguments.log_directory() {
        merged.set(LOG_DIRECTORY, log_directory.to_string_lossy());
    }
    merged
}

fn flatten_table(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Table(nested) => flatten_table(&full_key, nested, out),
            Value::Array(items) => match join_scalars(items) {
                Some(joined) => {
                    out.insert(full_key, joined);
                }
                None => warn!(key = %full_key, "skipping configuration array with nested values"),
            },
            scalar => {
                if let Some(text) = scalar_to_string(scalar) {
                    out.insert(full_key, text);
                }
            }
        }
    }
}

fn join_scalars(items: &[Value]) -> Option<String> {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(scalar_to_string(item)?);
    }
    Some(parts.join(","))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Integer(number) => Some(number.to_string()),
        Value::Float(number) => Some(number.to_string()),
        Value::Boolean(flag) => Some(flag.to_string()),
        Value::Datetime(stamp) => Some(stamp.to_string()),
        Value::Array(_) | Value::Table(_) => None,
    }
}
