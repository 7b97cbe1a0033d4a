use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::components::{ComponentRegistry, RootPage};
use crate::config::{self, MergedConfiguration};
use crate::responders::{ResponderRegistry, default_responders};

#[derive(Debug, Error)]
pub enum PluginError {
    /// A referenced id is not registered; the step continues without it.
    #[error("unknown {kind} `{id}`")]
    Unknown { kind: &'static str, id: String },
    /// A contribution could not be built; registries would be left inconsistent.
    #[error("failed to construct {kind} `{id}`: {reason}")]
    Construction {
        kind: &'static str,
        id: String,
        reason: String,
    },
}

/// Name-keyed registry shared by every contribution kind.
#[derive(Clone)]
pub struct NamedRegistry<T> {
    entries: BTreeMap<String, T>,
}

impl<T> Default for NamedRegistry<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Clone> NamedRegistry<T> {
    pub fn register(&mut self, name: &str, entry: T) {
        self.entries.insert(name.to_string(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Register `name` as another name for the existing entry `target`.
    pub fn alias(&mut self, name: &str, target: &str, kind: &'static str) -> Result<(), PluginError> {
        let entry = self.get(target).cloned().ok_or_else(|| PluginError::Unknown {
            kind,
            id: target.to_string(),
        })?;
        self.register(name, entry);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> fmt::Debug for NamedRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// Literal markup token recognized by the wiki parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolType {
    pub name: String,
    pub token: String,
}

pub type SymbolRegistry = NamedRegistry<SymbolType>;

pub fn wiki_parsing_symbols() -> SymbolRegistry {
    let mut registry = SymbolRegistry::default();
    for (name, token) in [
        ("Bold", "'''"),
        ("Italic", "''"),
        ("Strike", "--"),
        ("Table", "|"),
        ("Define", "!define"),
        ("Include", "!include"),
        ("Contents", "!contents"),
        ("Path", "!path"),
    ] {
        registry.register(
            name,
            SymbolType {
                name: name.to_string(),
                token: token.to_string(),
            },
        );
    }
    registry
}

pub trait ContentFilter: Send + Sync {
    fn is_content_acceptable(&self, content: &str, page: &str) -> bool;
}

#[derive(Default)]
pub struct ContentFilterRegistry {
    available: NamedRegistry<Arc<dyn ContentFilter>>,
    active: Option<(String, Arc<dyn ContentFilter>)>,
}

impl ContentFilterRegistry {
    pub fn register(&mut self, id: &str, filter: Arc<dyn ContentFilter>) {
        self.available.register(id, filter);
    }

    pub fn activate(&mut self, id: &str) -> Result<(), PluginError> {
        let filter = self.available.get(id).cloned().ok_or_else(|| PluginError::Unknown {
            kind: "content filter",
            id: id.to_string(),
        })?;
        self.active = Some((id.to_string(), filter));
        Ok(())
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_ref().map(|(id, _)| id.as_str())
    }

    /// Without an active filter all content is accepted.
    pub fn accepts(&self, content: &str, page: &str) -> bool {
        self.active
            .as_ref()
            .is_none_or(|(_, filter)| filter.is_content_acceptable(content, page))
    }
}

impl fmt::Debug for ContentFilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentFilterRegistry")
            .field("available", &self.available)
            .field("active", &self.active())
            .finish()
    }
}

/// Table-name prefix to the fixture binding kind that executes it.
pub type SlimTableRegistry = NamedRegistry<String>;

pub fn default_slim_tables() -> SlimTableRegistry {
    let mut registry = SlimTableRegistry::default();
    for kind in [
        "decision", "dt", "ddt", "query", "subset", "ordered", "script", "table", "scenario",
        "import", "library", "define alias", "define table type", "comment",
    ] {
        let binding = match kind {
            "dt" | "ddt" => "decision",
            other => other,
        };
        registry.register(kind, binding.to_string());
    }
    registry
}

pub trait Comparator: Send + Sync {
    fn matches(&self, actual: &str, expected: &str) -> bool;
}

pub type ComparatorRegistry = NamedRegistry<Arc<dyn Comparator>>;

struct EqualsComparator;

impl Comparator for EqualsComparator {
    fn matches(&self, actual: &str, expected: &str) -> bool {
        actual == expected
    }
}

struct IgnoreCaseComparator;

impl Comparator for IgnoreCaseComparator {
    fn matches(&self, actual: &str, expected: &str) -> bool {
        actual.eq_ignore_ascii_case(expected)
    }
}

struct ContainsComparator;

impl Comparator for ContainsComparator {
    fn matches(&self, actual: &str, expected: &str) -> bool {
        actual.contains(expected)
    }
}

pub fn default_comparators() -> ComparatorRegistry {
    let mut registry = ComparatorRegistry::default();
    registry.register("equals", Arc::new(EqualsComparator));
    registry.register("ignoreCase", Arc::new(IgnoreCaseComparator));
    registry.register("contains", Arc::new(ContainsComparator));
    registry
}

/// Everything plugins contribute to, owned by the runtime context.
#[derive(Debug)]
pub struct PluginRegistries {
    pub responders: ResponderRegistry,
    pub symbols: SymbolRegistry,
    pub content_filters: ContentFilterRegistry,
    pub slim_tables: SlimTableRegistry,
    pub comparators: ComparatorRegistry,
}

impl Default for PluginRegistries {
    fn default() -> Self {
        Self {
            responders: default_responders(),
            symbols: wiki_parsing_symbols(),
            content_filters: ContentFilterRegistry::default(),
            slim_tables: default_slim_tables(),
            comparators: default_comparators(),
        }
    }
}

/// Compiled-in extension. Every hook defaults to contributing nothing.
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    fn register_components(&self, _registry: &mut ComponentRegistry) -> Result<(), PluginError> {
        Ok(())
    }

    fn register_responders(&self, _responders: &mut ResponderRegistry) -> Result<(), PluginError> {
        Ok(())
    }

    fn register_symbol_types(&self, _symbols: &mut SymbolRegistry) -> Result<(), PluginError> {
        Ok(())
    }

    fn register_content_filters(
        &self,
        _filters: &mut ContentFilterRegistry,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    fn register_slim_tables(&self, _tables: &mut SlimTableRegistry) -> Result<(), PluginError> {
        Ok(())
    }

    fn register_comparators(
        &self,
        _comparators: &mut ComparatorRegistry,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Plugins linked into this binary; the `Plugins` key selects which are enabled.
#[derive(Default, Clone)]
pub struct PluginCatalog {
    available: Vec<Arc<dyn Plugin>>,
}

impl PluginCatalog {
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.available.push(plugin);
    }

    pub fn discover(&self, config: &MergedConfiguration) -> LoadedPlugins {
        let mut plugins = Vec::new();
        for id in config.list(config::PLUGINS) {
            match self.available.iter().find(|plugin| plugin.id() == id) {
                Some(plugin) => {
                    debug!(plugin = %id, "enabled plugin");
                    plugins.push(Arc::clone(plugin));
                }
                None => warn!(plugin = %id, "plugin is not available in this build"),
            }
        }
        LoadedPlugins { plugins }
    }
}

#[derive(Default, Clone)]
pub struct LoadedPlugins {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl LoadedPlugins {
    pub fn ids(&self) -> Vec<&str> {
        self.plugins.iter().map(|plugin| plugin.id()).collect()
    }

    /// Runs before component resolution so plugin-provided ids can be selected.
    pub fn register_components(&self, registry: &mut ComponentRegistry) -> Result<()> {
        for plugin in &self.plugins {
            surface("components", plugin.register_components(registry))?;
        }
        Ok(())
    }
}

pub struct PluginLoader<'a> {
    plugins: &'a LoadedPlugins,
    config: &'a MergedConfiguration,
}

impl<'a> PluginLoader<'a> {
    pub fn new(plugins: &'a LoadedPlugins, config: &'a MergedConfiguration) -> Self {
        Self { plugins, config }
    }

    /// Fixed order: plugins, responders, symbol types, content filter, slim tables, comparators.
    pub fn load_all(&self, registries: &mut PluginRegistries) -> Result<()> {
        self.load_plugins(&mut registries.responders, &mut registries.symbols)?;
        self.load_responders(&mut registries.responders)?;
        self.load_symbol_types(&mut registries.symbols)?;
        self.load_content_filter(&mut registries.content_filters)?;
        self.load_slim_tables(&mut registries.slim_tables)?;
        self.load_custom_comparators(&mut registries.comparators)?;
        Ok(())
    }

    pub fn load_plugins(
        &self,
        responders: &mut ResponderRegistry,
        symbols: &mut SymbolRegistry,
    ) -> Result<()> {
        for plugin in &self.plugins.plugins {
            surface("plugins", plugin.register_responders(responders))?;
            surface("plugins", plugin.register_symbol_types(symbols))?;
        }
        Ok(())
    }

    pub fn load_responders(&self, responders: &mut ResponderRegistry) -> Result<()> {
        for (name, target) in self.config.pairs(config::RESPONDERS) {
            surface("responders", responders.alias(&name, &target, "responder"))?;
        }
        debug!(count = responders.len(), "responders loaded");
        Ok(())
    }

    pub fn load_symbol_types(&self, symbols: &mut SymbolRegistry) -> Result<()> {
        for (name, token) in self.config.pairs(config::SYMBOL_TYPES) {
            symbols.register(
                &name,
                SymbolType {
                    name: name.clone(),
                    token,
                },
            );
        }
        debug!(count = symbols.len(), "symbol types loaded");
        Ok(())
    }

    pub fn load_content_filter(&self, filters: &mut ContentFilterRegistry) -> Result<()> {
        for plugin in &self.plugins.plugins {
            surface("content filter", plugin.register_content_filters(filters))?;
        }
        if let Some(id) = self.config.get(config::CONTENT_FILTER).map(str::trim)
            && !id.is_empty()
        {
            surface("content filter", filters.activate(id))?;
        }
        Ok(())
    }

    pub fn load_slim_tables(&self, tables: &mut SlimTableRegistry) -> Result<()> {
        for plugin in &self.plugins.plugins {
            surface("slim tables", plugin.register_slim_tables(tables))?;
        }
        for (name, target) in self.config.pairs(config::SLIM_TABLES) {
            surface("slim tables", tables.alias(&name, &target, "slim table"))?;
        }
        Ok(())
    }

    pub fn load_custom_comparators(&self, comparators: &mut ComparatorRegistry) -> Result<()> {
        for plugin in &self.plugins.plugins {
            surface("comparators", plugin.register_comparators(comparators))?;
        }
        for (name, target) in self.config.pairs(config::CUSTOM_COMPARATORS) {
            surface("comparators", comparators.alias(&name, &target, "comparator"))?;
        }
        Ok(())
    }
}

fn surface(step: &'static str, result: Result<(), PluginError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err @ PluginError::Unknown { .. }) => {
            warn!(step, "{err}");
            Ok(())
        }
        Err(err @ PluginError::Construction { .. }) => {
            Err(anyhow::Error::new(err).context(format!("plugin loading failed ({step})")))
        }
    }
}

/// Checks pages carrying an import marker before a command runs against them.
#[derive(Debug)]
pub struct PageImportListener;

const IMPORT_MARKER: &str = "import.url";

impl PageImportListener {
    pub fn before_command(&self, root: &RootPage, page: &str) {
        if let Some(source) = self.import_source(root, page) {
            info!(page, source = %source, "page content is imported; refresh is left to the import tooling");
        }
    }

    /// Remote source recorded for a page imported from another wiki.
    fn import_source(&self, root: &RootPage, page: &str) -> Option<String> {
        let marker = root.page_directory(page)?.join(IMPORT_MARKER);
        let source = std::fs::read_to_string(marker).ok()?;
        Some(source.trim().to_string())
    }
}

static IMPORT_LISTENER: OnceLock<PageImportListener> = OnceLock::new();

/// Installs the process-wide import listener. Returns `false` when it was already installed.
pub fn register_import_listener() -> bool {
    let mut installed = false;
    IMPORT_LISTENER.get_or_init(|| {
        installed = true;
        PageImportListener
    });
    installed
}

pub fn import_listener() -> Option<&'static PageImportListener> {
    IMPORT_LISTENER.get()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result as AnyResult;
    use tempfile::tempdir;

    use super::*;
    use crate::context::RuntimeContext;
    use crate::responders::{Request, Responder, Response};

    struct PingResponder;

    impl Responder for PingResponder {
        fn respond(&self, _context: &RuntimeContext, _request: &Request) -> AnyResult<Response> {
            Ok(Response::text("pong"))
        }
    }

    struct NoSpam;

    impl ContentFilter for NoSpam {
        fn is_content_acceptable(&self, content: &str, _page: &str) -> bool {
            !content.contains("buy now")
        }
    }

    struct AuditPlugin;

    impl Plugin for AuditPlugin {
        fn id(&self) -> &str {
            "audit"
        }

        fn register_responders(&self, responders: &mut ResponderRegistry) -> Result<(), PluginError> {
            responders.register("ping", Arc::new(PingResponder));
            Ok(())
        }

        fn register_content_filters(
            &self,
            filters: &mut ContentFilterRegistry,
        ) -> Result<(), PluginError> {
            filters.register("nospam", Arc::new(NoSpam));
            Ok(())
        }
    }

    struct BrokenPlugin;

    impl Plugin for BrokenPlugin {
        fn id(&self) -> &str {
            "broken"
        }

        fn register_symbol_types(&self, _symbols: &mut SymbolRegistry) -> Result<(), PluginError> {
            Err(PluginError::Construction {
                kind: "symbol type",
                id: "Chart".to_string(),
                reason: "missing renderer".to_string(),
            })
        }
    }

    fn catalog() -> PluginCatalog {
        let mut catalog = PluginCatalog::default();
        catalog.register(Arc::new(AuditPlugin));
        catalog.register(Arc::new(BrokenPlugin));
        catalog
    }

    #[test]
    fn only_configured_plugins_are_enabled() {
        let mut config = MergedConfiguration::default();
        config.set(config::PLUGINS, "audit, missing");
        let loaded = catalog().discover(&config);
        assert_eq!(loaded.ids(), vec!["audit"]);
    }

    #[test]
    fn plugin_and_config_contributions_are_loaded() {
        let mut config = MergedConfiguration::default();
        config.set(config::PLUGINS, "audit");
        config.set(config::RESPONDERS, "health:ping");
        config.set(config::SYMBOL_TYPES, "Note:!note");
        config.set(config::CONTENT_FILTER, "nospam");
        config.set(config::SLIM_TABLES, "dtt:decision");
        config.set(config::CUSTOM_COMPARATORS, "ci:ignoreCase");
        let loaded = catalog().discover(&config);

        let mut registries = PluginRegistries::default();
        PluginLoader::new(&loaded, &config)
            .load_all(&mut registries)
            .expect("load plugins");

        assert!(registries.responders.contains("ping"));
        assert!(registries.responders.contains("health"));
        assert_eq!(
            registries.symbols.get("Note").map(|symbol| symbol.token.as_str()),
            Some("!note")
        );
        assert_eq!(registries.content_filters.active(), Some("nospam"));
        assert!(!registries.content_filters.accepts("buy now!", "FrontPage"));
        assert_eq!(registries.slim_tables.get("dtt").map(String::as_str), Some("decision"));
        let ci = registries.comparators.get("ci").expect("comparator");
        assert!(ci.matches("YES", "yes"));
    }

    #[test]
    fn unknown_references_are_skipped() {
        let mut config = MergedConfiguration::default();
        config.set(config::RESPONDERS, "health:nothing");
        config.set(config::CONTENT_FILTER, "nospam");
        config.set(config::CUSTOM_COMPARATORS, "fuzzy:levenshtein");
        let loaded = catalog().discover(&config);

        let mut registries = PluginRegistries::default();
        PluginLoader::new(&loaded, &config)
            .load_all(&mut registries)
            .expect("load plugins");
        assert!(!registries.responders.contains("health"));
        assert_eq!(registries.content_filters.active(), None);
        assert!(registries.content_filters.accepts("buy now!", "FrontPage"));
        assert!(!registries.comparators.contains("fuzzy"));
    }

    #[test]
    fn construction_failure_is_fatal() {
        let mut config = MergedConfiguration::default();
        config.set(config::PLUGINS, "broken");
        let loaded = catalog().discover(&config);
        let mut registries = PluginRegistries::default();
        let err = PluginLoader::new(&loaded, &config)
            .load_all(&mut registries)
            .expect_err("must fail");
        assert!(format!("{err:#}").contains("missing renderer"));
    }

    #[test]
    fn import_listener_is_installed_once() {
        register_import_listener();
        assert!(!register_import_listener());
        assert!(import_listener().is_some());
    }

    #[test]
    fn import_listener_reports_marked_pages() {
        let temp = tempdir().expect("tempdir");
        let root = RootPage::new(temp.path(), "FitNesseRoot");
        let page_dir = root.directory().join("ImportedPage");
        fs::create_dir_all(&page_dir).expect("page dir");
        fs::write(page_dir.join(IMPORT_MARKER), "http://remote/ImportedPage\n").expect("marker");
        let outside = temp.path().join("elsewhere");
        fs::create_dir_all(&outside).expect("outside dir");
        fs::write(outside.join(IMPORT_MARKER), "http://remote/Elsewhere\n").expect("marker");

        let listener = PageImportListener;
        assert_eq!(
            listener.import_source(&root, "ImportedPage").as_deref(),
            Some("http://remote/ImportedPage")
        );
        assert_eq!(listener.import_source(&root, "FrontPage"), None);
        let escape = format!("x.{}", outside.display());
        assert_eq!(listener.import_source(&root, &escape), None);
        listener.before_command(&root, "ImportedPage");
    }
}
