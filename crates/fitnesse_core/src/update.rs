use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::arguments::LaunchArguments;
use crate::context::RuntimeContext;
use crate::responders::FRONT_PAGE;

const LEDGER_FILE: &str = "updates.db";

const DEFAULT_ROOT_CONTENT: &str = "!contents -R2 -g -p -f -h\n";
const DEFAULT_FRONT_PAGE_CONTENT: &str = "!1 Welcome to !-FitNesse-!\n\n!contents -R1 -g\n";

struct Update {
    version: u32,
    name: &'static str,
    apply: fn(&RuntimeContext) -> Result<()>,
}

const UPDATES: &[Update] = &[
    Update {
        version: 1,
        name: "files_layout",
        apply: create_files_layout,
    },
    Update {
        version: 2,
        name: "root_content",
        apply: create_root_content,
    },
    Update {
        version: 3,
        name: "front_page",
        apply: create_front_page,
    },
    Update {
        version: 4,
        name: "recent_changes_page",
        apply: create_recent_changes_page,
    },
];

#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub applied: Vec<AppliedUpdate>,
    pub current_version: u32,
}

impl UpdateReport {
    pub fn any_applied(&self) -> bool {
        !self.applied.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AppliedUpdate {
    pub version: u32,
    pub name: String,
}

/// Run pending updates unless `-o` was given. Returns whether anything changed.
pub fn update(arguments: &LaunchArguments, context: &RuntimeContext) -> Result<bool> {
    if arguments.omit_updates() {
        info!("Skipping updates");
        return Ok(false);
    }
    let report = run_updates(context)?;
    for applied in &report.applied {
        info!("Applied update v{:03}_{}", applied.version, applied.name);
    }
    debug!(version = report.current_version, "update ledger is current");
    Ok(report.any_applied())
}

pub fn run_updates(context: &RuntimeContext) -> Result<UpdateReport> {
    let connection = open_ledger(&ledger_path(context))?;
    ensure_ledger_table(&connection)?;

    let current = current_version(&connection)?;
    let mut applied = Vec::new();

    for update in UPDATES {
        if update.version <= current {
            continue;
        }
        apply_update(&connection, context, update).with_context(|| {
            format!("failed to apply update v{:03}_{}", update.version, update.name)
        })?;
        applied.push(AppliedUpdate {
            version: update.version,
            name: update.name.to_string(),
        });
    }

    Ok(UpdateReport {
        applied,
        current_version: current_version(&connection)?,
    })
}

fn ledger_path(context: &RuntimeContext) -> PathBuf {
    context.root().directory().join(LEDGER_FILE)
}

fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM applied_updates",
            [],
            |row| row.get(0),
        )
        .context("failed to read current update version")?;
    u32::try_from(version).context("update version does not fit into u32")
}

fn ensure_ledger_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS applied_updates (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create applied_updates table")
}

fn apply_update(connection: &Connection, context: &RuntimeContext, update: &Update) -> Result<()> {
    connection
        .execute_batch("SAVEPOINT update_apply")
        .context("failed to create savepoint")?;

    let result = (|| -> Result<()> {
        (update.apply)(context)?;

        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .context("system clock error")?
            .as_secs();

        connection
            .execute(
                "INSERT INTO applied_updates (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![
                    i64::from(update.version),
                    update.name,
                    i64::try_from(now_unix).context("timestamp does not fit into i64")?,
                ],
            )
            .context("failed to record update")?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            connection
                .execute_batch("RELEASE SAVEPOINT update_apply")
                .context("failed to release savepoint")?;
            Ok(())
        }
        Err(err) => {
            let _ = connection.execute_batch("ROLLBACK TO SAVEPOINT update_apply");
            let _ = connection.execute_batch("RELEASE SAVEPOINT update_apply");
            Err(err)
        }
    }
}

fn open_ledger(path: &Path) -> Result<Connection> {
    Connection::open(path).with_context(|| format!("failed to open {}", path.display()))
}

fn create_files_layout(context: &RuntimeContext) -> Result<()> {
    let files = context.root().directory().join("files");
    let fitnesse_files = files.join("fitnesse");
    fs::create_dir_all(&fitnesse_files)
        .with_context(|| format!("failed to create {}", fitnesse_files.display()))
}

fn create_root_content(context: &RuntimeContext) -> Result<()> {
    write_if_missing(
        &context.root().directory().join("content.txt"),
        DEFAULT_ROOT_CONTENT,
    )?;
    Ok(())
}

fn create_front_page(context: &RuntimeContext) -> Result<()> {
    let path = context.root().directory().join(FRONT_PAGE).join("content.txt");
    if write_if_missing(&path, DEFAULT_FRONT_PAGE_CONTENT)? {
        context.recent_changes().record(context.root(), FRONT_PAGE)?;
    }
    Ok(())
}

fn create_recent_changes_page(context: &RuntimeContext) -> Result<()> {
    let dir = context.root().directory().join("RecentChanges");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    write_if_missing(&dir.join("content.txt"), "!contents\n")?;
    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}
