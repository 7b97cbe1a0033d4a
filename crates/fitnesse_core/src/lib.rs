pub mod arguments;
pub mod auth;
pub mod bootstrap;
pub mod components;
pub mod config;
pub mod context;
pub mod launcher;
pub mod logging;
pub mod plugins;
pub mod request_log;
pub mod responders;
pub mod server;
pub mod update;
