use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::context::RuntimeContext;
use crate::plugins::NamedRegistry;

pub const DEFAULT_RESPONDER: &str = "wiki";
pub const FRONT_PAGE: &str = "FrontPage";
const CONTENT_FILE: &str = "content.txt";

/// A wiki request such as `FrontPage.SubPage?names&format=text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub page: String,
    pub responder: Option<String>,
    pub params: BTreeMap<String, String>,
    pub user: Option<String>,
}

impl Request {
    pub fn parse(resource: &str) -> Self {
        let resource = resource.trim().trim_start_matches('/');
        let (page, query) = resource.split_once('?').unwrap_or((resource, ""));
        let page = if page.is_empty() { FRONT_PAGE } else { page };

        let mut responder = None;
        let mut params = BTreeMap::new();
        for item in query.split('&').filter(|item| !item.is_empty()) {
            let (key, value) = item.split_once('=').unwrap_or((item, ""));
            if responder.is_none() && value.is_empty() {
                responder = Some(key.to_string());
            } else {
                params.insert(key.to_string(), value.replace('+', " "));
            }
        }

        Self {
            page: page.to_string(),
            responder,
            params,
            user: None,
        }
    }

    pub fn responder_name(&self) -> &str {
        self.responder.as_deref().unwrap_or(DEFAULT_RESPONDER)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Failures reported by the responder; single commands exit with this count.
    pub failures: u32,
}

impl Response {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: body.into().into_bytes(),
            failures: 0,
        }
    }

    pub fn not_found(page: &str) -> Self {
        Self {
            status: 404,
            failures: 1,
            ..Self::text(format!("The requested resource: {page} was not found.\n"))
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: 401,
            failures: 1,
            ..Self::text("Authentication required.\n")
        }
    }
}

pub trait Responder: Send + Sync {
    fn respond(&self, context: &RuntimeContext, request: &Request) -> Result<Response>;
}

pub type ResponderRegistry = NamedRegistry<Arc<dyn Responder>>;

pub fn default_responders() -> ResponderRegistry {
    let mut registry = ResponderRegistry::default();
    registry.register(DEFAULT_RESPONDER, Arc::new(WikiPageResponder));
    registry.register("names", Arc::new(NamesResponder));
    registry.register("recentChanges", Arc::new(RecentChangesResponder));
    registry
}

/// Serves the stored page source.
pub struct WikiPageResponder;

impl Responder for WikiPageResponder {
    fn respond(&self, context: &RuntimeContext, request: &Request) -> Result<Response> {
        let Some(path) = context
            .root()
            .page_directory(&request.page)
            .map(|dir| dir.join(CONTENT_FILE))
            .filter(|path| path.is_file())
        else {
            return Ok(Response::not_found(&request.page));
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Response::text(content))
    }
}

/// Lists child page names, one per line; `Recursive` walks the whole subtree.
pub struct NamesResponder;

impl Responder for NamesResponder {
    fn respond(&self, context: &RuntimeContext, request: &Request) -> Result<Response> {
        let Some(base) = context
            .root()
            .page_directory(&request.page)
            .filter(|dir| dir.is_dir())
        else {
            return Ok(Response::not_found(&request.page));
        };
        let max_depth = if request.params.contains_key("Recursive") {
            usize::MAX
        } else {
            1
        };

        let mut names = Vec::new();
        for entry in WalkDir::new(&base)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
        {
            let entry =
                entry.with_context(|| format!("failed to walk {}", base.display()))?;
            if !entry.file_type().is_dir() || !entry.path().join(CONTENT_FILE).is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&base)
                .with_context(|| format!("unexpected path {}", entry.path().display()))?;
            let name = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join(".");
            names.push(name);
        }
        names.sort();

        let mut body = names.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        Ok(Response::text(body))
    }
}

pub struct RecentChangesResponder;

impl Responder for RecentChangesResponder {
    fn respond(&self, context: &RuntimeContext, _request: &Request) -> Result<Response> {
        let changes = context.recent_changes().recent(context.root())?;
        let body = changes
            .iter()
            .map(|change| format!("{}\t{}\n", change.page, change.changed_at_unix))
            .collect::<String>();
        Ok(Response::text(body))
    }
}
