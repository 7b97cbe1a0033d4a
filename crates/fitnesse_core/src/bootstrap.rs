use anyhow::Result;
use tracing::info;

use crate::arguments::LaunchArguments;
use crate::components::ComponentRegistry;
use crate::config::{load_config_file, merge_configuration};
use crate::context::{RuntimeContext, build_context};
use crate::launcher::{LaunchOutcome, launch};
use crate::logging::{LoggingState, configure_logging};
use crate::plugins::{PluginCatalog, PluginLoader, register_import_listener};
use crate::server::WikiServer;
use crate::update::update;

/// What the launch produced. The server is returned so service mode can block on it.
pub struct Launched {
    pub outcome: LaunchOutcome,
    pub server: WikiServer,
}

/// Logging, context, plugins, updates, then launch. Each phase finishes before the next.
pub fn launch_fitnesse(
    arguments: &LaunchArguments,
    logging: LoggingState,
    catalog: &PluginCatalog,
) -> Result<Launched> {
    configure_logging(arguments.verbose(), logging);

    let context = load_context(arguments, catalog)?;

    info!("Checking for updates");
    let updated = update(arguments, &context)?;
    if updated {
        info!("Updates applied");
    }

    let mut server = WikiServer::new(context);
    let outcome = launch(arguments, &mut server)?;
    Ok(Launched { outcome, server })
}

pub fn load_context(arguments: &LaunchArguments, catalog: &PluginCatalog) -> Result<RuntimeContext> {
    info!("Loading configuration");
    let config = merge_configuration(load_config_file(arguments.config_file()), arguments);

    let plugins = catalog.discover(&config);
    info!(plugins = ?plugins.ids(), "Enabled plugins");
    let mut registry = ComponentRegistry::with_defaults();
    plugins.register_components(&mut registry)?;

    info!("Building context");
    let mut context = build_context(arguments, &config, &registry)?;

    info!("Loading plugins");
    PluginLoader::new(&plugins, &config).load_all(context.registries_mut())?;
    register_import_listener();

    context.log_summary();
    Ok(context)
}
