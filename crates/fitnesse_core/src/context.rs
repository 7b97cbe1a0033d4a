use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::arguments::{DEFAULT_PATH, DEFAULT_PORT, DEFAULT_ROOT, DEFAULT_VERSION_DAYS, LaunchArguments};
use crate::auth::{Authenticator, make_authenticator};
use crate::components::{
    ComponentRegistry, RecentChanges, RootPage, VersionsController, WikiPageFactory,
};
use crate::config::{self, MergedConfiguration};
use crate::plugins::PluginRegistries;
use crate::request_log::{RequestLogger, make_request_logger};

/// Fully wired object graph the service and single commands run against.
pub struct RuntimeContext {
    root: RootPage,
    versions_controller: Box<dyn VersionsController>,
    recent_changes: Box<dyn RecentChanges>,
    logger: Option<RequestLogger>,
    authenticator: Box<dyn Authenticator>,
    page_factory: Box<dyn WikiPageFactory>,
    port: u16,
    registries: PluginRegistries,
}

impl RuntimeContext {
    pub fn root(&self) -> &RootPage {
        &self.root
    }

    pub fn versions_controller(&self) -> &dyn VersionsController {
        self.versions_controller.as_ref()
    }

    pub fn recent_changes(&self) -> &dyn RecentChanges {
        self.recent_changes.as_ref()
    }

    pub fn logger(&self) -> Option<&RequestLogger> {
        self.logger.as_ref()
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn page_factory(&self) -> &dyn WikiPageFactory {
        self.page_factory.as_ref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registries(&self) -> &PluginRegistries {
        &self.registries
    }

    pub(crate) fn registries_mut(&mut self) -> &mut PluginRegistries {
        &mut self.registries
    }

    pub fn log_summary(&self) {
        info!("root page: {}", self.root);
        info!(
            "logger: {}",
            self.logger
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string())
        );
        info!("authenticator: {}", self.authenticator);
        info!("page factory: {:?}", self.page_factory);
        info!("page theme: {}", self.page_factory.theme());
        debug!(
            responders = ?self.registries.responders.names().collect::<Vec<_>>(),
            "registered responders"
        );
        info!("Starting FitNesse on port: {}", self.port);
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("root", &self.root)
            .field("versions_controller", &self.versions_controller)
            .field("recent_changes", &self.recent_changes)
            .field("logger", &self.logger)
            .field("authenticator", &self.authenticator)
            .field("page_factory", &self.page_factory)
            .field("port", &self.port)
            .field("registries", &self.registries)
            .finish()
    }
}

/// Resolve every role and materialize the root page. Root failures abort the bootstrap.
pub fn build_context(
    arguments: &LaunchArguments,
    config: &MergedConfiguration,
    registry: &ComponentRegistry,
) -> Result<RuntimeContext> {
    let page_factory = registry.page_factory(config);

    let port = config.parsed::<u16>(config::PORT).unwrap_or(DEFAULT_PORT);
    let root_path = arguments
        .root_path()
        .map(Path::to_path_buf)
        .or_else(|| config.get(config::ROOT_PATH).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PATH));
    let root_directory = config.get(config::ROOT_DIRECTORY).unwrap_or(DEFAULT_ROOT);

    let mut versions_controller = registry.versions_controller(config);
    versions_controller.set_history_depth(
        config
            .parsed::<u32>(config::VERSIONS_CONTROLLER_DAYS)
            .unwrap_or(DEFAULT_VERSION_DAYS),
    );
    let recent_changes = registry.recent_changes(config);

    let root = page_factory
        .make_root_page(&root_path, root_directory)
        .with_context(|| {
            format!(
                "failed to materialize root page {root_directory} under {}",
                root_path.display()
            )
        })?;

    let log_directory = arguments
        .log_directory()
        .or_else(|| config.get(config::LOG_DIRECTORY).map(Path::new));
    let logger = make_request_logger(log_directory).context("failed to open request log")?;
    let authenticator = make_authenticator(arguments.userpass(), config)
        .context("failed to set up authentication")?;

    Ok(RuntimeContext {
        root,
        versions_controller,
        recent_changes,
        logger,
        authenticator,
        page_factory,
        port,
        registries: PluginRegistries::default(),
    })
}
