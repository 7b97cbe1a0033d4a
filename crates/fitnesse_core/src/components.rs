use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{self, MergedConfiguration};

pub const DEFAULT_PAGE_FACTORY: &str = "fs";
pub const DEFAULT_VERSIONS_CONTROLLER: &str = "zip";
pub const DEFAULT_RECENT_CHANGES: &str = "page";
pub const DEFAULT_THEME: &str = "bootstrap";

const RECENT_CHANGES_PAGE: &str = "RecentChanges";
const RECENT_CHANGES_LEDGER: &str = "changes.json";
const MAX_RECENT_CHANGES: usize = 100;

/// Materialized root of the page tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPage {
    root_path: PathBuf,
    name: String,
    directory: PathBuf,
}

impl RootPage {
    pub fn new(root_path: &Path, name: &str) -> Self {
        Self {
            root_path: root_path.to_path_buf(),
            name: name.to_string(),
            directory: root_path.join(name),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Directory of a dotted page path such as `FrontPage.SubPage`. `None` when
    /// a segment is not a plain name, so lookups never leave the root.
    pub fn page_directory(&self, page: &str) -> Option<PathBuf> {
        let mut directory = self.directory.clone();
        for segment in page.split('.') {
            if !is_page_segment(segment) {
                return None;
            }
            directory.push(segment);
        }
        Some(directory)
    }
}

fn is_page_segment(segment: &str) -> bool {
    if segment.is_empty() || segment.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl fmt::Display for RootPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.name, self.directory.display())
    }
}

pub trait WikiPageFactory: fmt::Debug + Send + Sync {
    fn make_root_page(&self, root_path: &Path, root_directory: &str) -> Result<RootPage>;
    fn theme(&self) -> &str;
}

pub trait VersionsController: fmt::Debug + Send + Sync {
    fn set_history_depth(&mut self, days: u32);
    fn history_depth(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentChange {
    pub page: String,
    pub changed_at_unix: u64,
}

pub trait RecentChanges: fmt::Debug + Send + Sync {
    fn record(&self, root: &RootPage, page: &str) -> Result<()>;
    fn recent(&self, root: &RootPage) -> Result<Vec<RecentChange>>;
}

#[derive(Debug, Clone)]
pub struct FileSystemPageFactory {
    theme: String,
}

impl FileSystemPageFactory {
    pub fn from_config(config: &MergedConfiguration) -> Self {
        Self {
            theme: config
                .get(config::THEME)
                .unwrap_or(DEFAULT_THEME)
                .to_string(),
        }
    }
}

impl WikiPageFactory for FileSystemPageFactory {
    fn make_root_page(&self, root_path: &Path, root_directory: &str) -> Result<RootPage> {
        if root_directory.trim().is_empty() || root_directory.contains(['/', '\\']) {
            bail!("invalid root page directory name `{root_directory}`");
        }
        let root = RootPage::new(root_path, root_directory);
        let directory = root.directory();
        if directory.exists() && !directory.is_dir() {
            bail!("root page path is not a directory: {}", directory.display());
        }
        fs::create_dir_all(directory)
            .with_context(|| format!("failed to create {}", directory.display()))?;
        fs::read_dir(directory)
            .with_context(|| format!("failed to read {}", directory.display()))?;
        Ok(root)
    }

    fn theme(&self) -> &str {
        &self.theme
    }
}

#[derive(Debug, Clone, Default)]
pub struct ZipFileVersionsController {
    history_depth: u32,
}

impl VersionsController for ZipFileVersionsController {
    fn set_history_depth(&mut self, days: u32) {
        self.history_depth = days;
    }

    fn history_depth(&self) -> u32 {
        self.history_depth
    }
}

/// Keeps no history; the depth is recorded only for reporting.
#[derive(Debug, Clone, Default)]
pub struct NullVersionsController {
    history_depth: u32,
}

impl VersionsController for NullVersionsController {
    fn set_history_depth(&mut self, days: u32) {
        self.history_depth = days;
    }

    fn history_depth(&self) -> u32 {
        self.history_depth
    }
}

/// Tracks recent changes in a JSON ledger kept on the `RecentChanges` page.
#[derive(Debug, Default)]
pub struct RecentChangesWikiPage {
    lock: Mutex<()>,
}

impl RecentChangesWikiPage {
    fn ledger_path(root: &RootPage) -> PathBuf {
        root.directory()
            .join(RECENT_CHANGES_PAGE)
            .join(RECENT_CHANGES_LEDGER)
    }

    fn read_ledger(path: &Path) -> Result<Vec<RecentChange>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }
}

impl RecentChanges for RecentChangesWikiPage {
    fn record(&self, root: &RootPage, page: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let path = Self::ledger_path(root);
        let mut changes = Self::read_ledger(&path)?;
        changes.retain(|change| change.page != page);
        changes.insert(
            0,
            RecentChange {
                page: page.to_string(),
                changed_at_unix: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .context("system clock error")?
                    .as_secs(),
            },
        );
        changes.truncate(MAX_RECENT_CHANGES);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let rendered =
            serde_json::to_string_pretty(&changes).context("failed to serialize recent changes")?;
        fs::write(&path, rendered).with_context(|| format!("failed to write {}", path.display()))
    }

    fn recent(&self, root: &RootPage) -> Result<Vec<RecentChange>> {
        Self::read_ledger(&Self::ledger_path(root))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NullRecentChanges;

impl RecentChanges for NullRecentChanges {
    fn record(&self, _root: &RootPage, _page: &str) -> Result<()> {
        Ok(())
    }

    fn recent(&self, _root: &RootPage) -> Result<Vec<RecentChange>> {
        Ok(Vec::new())
    }
}

pub type PageFactoryConstructor = fn(&MergedConfiguration) -> Result<Box<dyn WikiPageFactory>>;
pub type VersionsControllerConstructor =
    fn(&MergedConfiguration) -> Result<Box<dyn VersionsController>>;
pub type RecentChangesConstructor = fn(&MergedConfiguration) -> Result<Box<dyn RecentChanges>>;

/// Constructors for every pluggable role, keyed by the id a configuration file may select.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    page_factories: BTreeMap<String, PageFactoryConstructor>,
    versions_controllers: BTreeMap<String, VersionsControllerConstructor>,
    recent_changes: BTreeMap<String, RecentChangesConstructor>,
}

impl ComponentRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register_page_factory(DEFAULT_PAGE_FACTORY, |config| {
            Ok(Box::new(FileSystemPageFactory::from_config(config)))
        });
        registry.register_versions_controller(DEFAULT_VERSIONS_CONTROLLER, |_| {
            Ok(Box::new(ZipFileVersionsController::default()))
        });
        registry.register_versions_controller("none", |_| {
            Ok(Box::new(NullVersionsController::default()))
        });
        registry.register_recent_changes(DEFAULT_RECENT_CHANGES, |_| {
            Ok(Box::new(RecentChangesWikiPage::default()))
        });
        registry.register_recent_changes("none", |_| Ok(Box::new(NullRecentChanges)));
        registry
    }

    pub fn register_page_factory(&mut self, id: &str, constructor: PageFactoryConstructor) {
        self.page_factories.insert(id.to_string(), constructor);
    }

    pub fn register_versions_controller(
        &mut self,
        id: &str,
        constructor: VersionsControllerConstructor,
    ) {
        self.versions_controllers.insert(id.to_string(), constructor);
    }

    pub fn register_recent_changes(&mut self, id: &str, constructor: RecentChangesConstructor) {
        self.recent_changes.insert(id.to_string(), constructor);
    }

    pub fn page_factory(&self, config: &MergedConfiguration) -> Box<dyn WikiPageFactory> {
        resolve(
            config::WIKI_PAGE_FACTORY,
            config,
            &self.page_factories,
            |config| Box::new(FileSystemPageFactory::from_config(config)),
        )
    }

    pub fn versions_controller(&self, config: &MergedConfiguration) -> Box<dyn VersionsController> {
        resolve(
            config::VERSIONS_CONTROLLER,
            config,
            &self.versions_controllers,
            |_| Box::new(ZipFileVersionsController::default()),
        )
    }

    pub fn recent_changes(&self, config: &MergedConfiguration) -> Box<dyn RecentChanges> {
        resolve(
            config::RECENT_CHANGES,
            config,
            &self.recent_changes,
            |_| Box::new(RecentChangesWikiPage::default()),
        )
    }
}

fn resolve<T: ?Sized>(
    role: &str,
    config: &MergedConfiguration,
    constructors: &BTreeMap<String, fn(&MergedConfiguration) -> Result<Box<T>>>,
    fallback: fn(&MergedConfiguration) -> Box<T>,
) -> Box<T> {
    let Some(id) = config.get(role).map(str::trim) else {
        return fallback(config);
    };
    let Some(constructor) = constructors.get(id) else {
        warn!(role, id, "unknown component id, using default");
        return fallback(config);
    };
    match constructor(config) {
        Ok(component) => {
            debug!(role, id, "resolved component");
            component
        }
        Err(err) => {
            warn!(role, id, "component construction failed, using default: {err:#}");
            fallback(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn absent_keys_resolve_to_defaults() {
        let registry = ComponentRegistry::with_defaults();
        let config = MergedConfiguration::default();
        assert_eq!(registry.page_factory(&config).theme(), DEFAULT_THEME);
        assert!(format!("{:?}", registry.versions_controller(&config)).contains("ZipFile"));
        assert!(format!("{:?}", registry.recent_changes(&config)).contains("RecentChangesWikiPage"));
    }

    #[test]
    fn configured_id_selects_registered_component() {
        let registry = ComponentRegistry::with_defaults();
        let mut config = MergedConfiguration::default();
        config.set(config::VERSIONS_CONTROLLER, "none");
        config.set(config::RECENT_CHANGES, "none");
        assert!(format!("{:?}", registry.versions_controller(&config)).contains("Null"));
        assert!(format!("{:?}", registry.recent_changes(&config)).contains("Null"));
    }

    #[test]
    fn unknown_id_falls_back_to_default() {
        let registry = ComponentRegistry::with_defaults();
        let mut config = MergedConfiguration::default();
        config.set(config::VERSIONS_CONTROLLER, "git");
        assert!(format!("{:?}", registry.versions_controller(&config)).contains("ZipFile"));
    }

    #[test]
    fn failing_constructor_falls_back_to_default() {
        let mut registry = ComponentRegistry::with_defaults();
        registry.register_page_factory("broken", |_| bail!("no such backend"));
        let mut config = MergedConfiguration::default();
        config.set(config::WIKI_PAGE_FACTORY, "broken");
        config.set(config::THEME, "fitnesse_straight");
        assert_eq!(registry.page_factory(&config).theme(), "fitnesse_straight");
    }

    #[test]
    fn root_page_is_created_when_missing() {
        let temp = tempdir().expect("tempdir");
        let factory = FileSystemPageFactory::from_config(&MergedConfiguration::default());
        let root = factory
            .make_root_page(temp.path(), "FitNesseRoot")
            .expect("root page");
        assert!(root.directory().is_dir());
        assert_eq!(root.name(), "FitNesseRoot");
        assert_eq!(
            root.page_directory("FrontPage.SubPage"),
            Some(temp.path().join("FitNesseRoot/FrontPage/SubPage"))
        );
    }

    #[test]
    fn page_names_cannot_leave_the_root() {
        let temp = tempdir().expect("tempdir");
        let root = RootPage::new(temp.path(), "FitNesseRoot");
        let outside = temp.path().join("outside");
        let escape = format!("x.{}", outside.display());

        for page in [
            escape.as_str(),
            "x./etc",
            "/etc",
            "FrontPage..SubPage",
            "FrontPage.",
            "Sub/Page",
            "Sub\\Page",
            "",
        ] {
            assert_eq!(root.page_directory(page), None, "page `{page}`");
        }
        let nested = root.page_directory("FrontPage.SubPage").expect("valid page");
        assert!(nested.starts_with(root.directory()));
    }

    #[test]
    fn root_page_over_a_file_is_rejected() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("FitNesseRoot"), "not a dir").expect("write file");
        let factory = FileSystemPageFactory::from_config(&MergedConfiguration::default());
        let err = factory
            .make_root_page(temp.path(), "FitNesseRoot")
            .expect_err("must fail");
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn recent_changes_keeps_latest_first_without_duplicates() {
        let temp = tempdir().expect("tempdir");
        let root = RootPage::new(temp.path(), "FitNesseRoot");
        let tracker = RecentChangesWikiPage::default();
        tracker.record(&root, "FrontPage").expect("record");
        tracker.record(&root, "SuitePage").expect("record");
        tracker.record(&root, "FrontPage").expect("record");

        let pages: Vec<_> = tracker
            .recent(&root)
            .expect("recent")
            .into_iter()
            .map(|change| change.page)
            .collect();
        assert_eq!(pages, vec!["FrontPage", "SuitePage"]);
    }
}
