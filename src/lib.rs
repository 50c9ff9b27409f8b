//! A small static file web server.
//!
//! Requests pass through a fixed pipeline: the path is decoded and canonicalized, aliases
//! are applied, access is checked, and the result is resolved against the document root.
//! [`dispatch`] runs that pipeline for a single request and [`Server`] drives it over TCP.

pub mod alias;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod log;
pub mod mime;
pub mod path;
pub mod request;
pub mod resolve;
pub mod response;
pub mod server;

pub use crate::config::{ServerConfig, ServerConfigBuilder};
pub use crate::dispatch::{dispatch, ConnectionContext, Disposition, Resolution};
pub use crate::error::RequestError;
pub use crate::log::{FnLogger, LogSink, Logger};
pub use crate::request::ParsedRequest;
pub use crate::resolve::{ListInfo, ResolvedResource};
pub use crate::server::{Server, ServerStats};
