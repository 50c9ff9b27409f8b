use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::alias::AliasMap;
use crate::auth::{AcceptRules, AuthGate, Credentials, IpAllowList, IpPattern};
use crate::log::Logger;
use crate::mime::MimeMap;
use crate::resolve::ResourceResolver;

pub const DEFAULT_INDEX_NAMES: &[&str] = &["index.html", "index.htm"];
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a server needs to answer requests.
///
/// Built once with [`ServerConfig::builder`] and shared read-only, as an
/// `Arc<ServerConfig>`, by every connection. To change settings, build a new one.
pub struct ServerConfig {
    /// Canonical absolute path of the directory being served.
    pub root: PathBuf,
    pub credentials: Credentials,
    pub accept_rules: AcceptRules,
    pub allow_list: IpAllowList,
    pub mime_map: MimeMap,
    pub default_pages: Vec<String>,
    pub aliases: AliasMap,
    /// Static entries for CGI-style request environments.
    pub environment: BTreeMap<String, String>,
    pub logger: Option<Arc<dyn Logger>>,
    pub verbosity: u8,
    pub listing: bool,
    pub server_id: bool,
    pub timeout: Option<Duration>,
    pub max_connections: Option<usize>,
}

impl ServerConfig {
    pub fn builder<P: AsRef<Path>>(root: P) -> ServerConfigBuilder {
        ServerConfigBuilder::new(root.as_ref())
    }

    pub fn auth_gate(&self) -> AuthGate<'_> {
        AuthGate {
            credentials: &self.credentials,
            accept_rules: &self.accept_rules,
            allow_list: &self.allow_list,
        }
    }

    pub fn resolver(&self) -> ResourceResolver<'_> {
        ResourceResolver {
            root: &self.root,
            default_pages: &self.default_pages,
            listing: self.listing,
        }
    }

    /// `Server:` response header line, empty if disabled.
    pub fn server_header(&self) -> String {
        if self.server_id {
            format!(
                "Server: {}/{}\r\n",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )
        } else {
            String::new()
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("root", &self.root)
            .field("accept_rules", &self.accept_rules)
            .field("allow_list", &self.allow_list)
            .field("default_pages", &self.default_pages)
            .field("aliases", &self.aliases)
            .field("environment", &self.environment)
            .field("logger", &self.logger.is_some())
            .field("verbosity", &self.verbosity)
            .field("listing", &self.listing)
            .field("server_id", &self.server_id)
            .field("timeout", &self.timeout)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Collects settings for a [`ServerConfig`].
pub struct ServerConfigBuilder {
    root: PathBuf,
    credentials: Credentials,
    accept_rules: AcceptRules,
    allow_list: IpAllowList,
    mime_map: MimeMap,
    default_pages: Option<Vec<String>>,
    aliases: AliasMap,
    environment: BTreeMap<String, String>,
    logger: Option<Arc<dyn Logger>>,
    verbosity: u8,
    listing: bool,
    server_id: bool,
    timeout: Option<Duration>,
    max_connections: Option<usize>,
}

impl ServerConfigBuilder {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            credentials: Credentials::default(),
            accept_rules: AcceptRules::default(),
            allow_list: IpAllowList::default(),
            mime_map: MimeMap::default(),
            default_pages: None,
            aliases: AliasMap::new(),
            environment: BTreeMap::new(),
            logger: None,
            verbosity: 0,
            listing: true,
            server_id: true,
            timeout: Some(DEFAULT_TIMEOUT),
            max_connections: None,
        }
    }

    pub fn credential(mut self, user: &str, secret: &str) -> Self {
        self.credentials.insert(user, secret);
        self
    }

    /// Add a `user:pass` credential.
    pub fn credential_pair(mut self, user_pass: &str) -> Result<Self> {
        self.credentials.insert_pair(user_pass)?;
        Ok(self)
    }

    pub fn accept<S: AsRef<str>>(mut self, prefix: &str, users: &[S]) -> Self {
        self.accept_rules.insert(prefix, users);
        self
    }

    pub fn allow_ip(mut self, pattern: IpPattern) -> Self {
        self.allow_list.push(pattern);
        self
    }

    pub fn mime_map(mut self, mime_map: MimeMap) -> Self {
        self.mime_map = mime_map;
        self
    }

    pub fn mime_map_mut(&mut self) -> &mut MimeMap {
        &mut self.mime_map
    }

    /// Add a default page. The first call replaces the built-in list.
    pub fn default_page(mut self, name: &str) -> Self {
        self.default_pages
            .get_or_insert_with(Vec::new)
            .push(name.to_string());
        self
    }

    pub fn alias(mut self, from: &str, to: &str) -> Self {
        self.aliases.insert(from, to);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a `KEY=VALUE` environment entry.
    pub fn env_pair(self, key_value: &str) -> Result<Self> {
        let (key, value) = key_value
            .split_once('=')
            .context("expected KEY=VALUE after --env")?;
        if key.is_empty() {
            return Err(anyhow!("empty variable name in `{}'", key_value));
        }
        Ok(self.env(key, value))
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn listing(mut self, listing: bool) -> Self {
        self.listing = listing;
        self
    }

    pub fn server_id(mut self, server_id: bool) -> Self {
        self.server_id = server_id;
        self
    }

    /// `None` disables timeouts.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_connections(mut self, max_connections: Option<usize>) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Resolve the root and freeze the configuration.
    ///
    /// Fails if the root does not exist or is not a directory.
    pub fn build(self) -> Result<ServerConfig> {
        let root = std::fs::canonicalize(&self.root)
            .with_context(|| format!("failed to resolve root {}", self.root.display()))?;
        if !root.is_dir() {
            return Err(anyhow!("root {} is not a directory", root.display()));
        }
        Ok(ServerConfig {
            root,
            credentials: self.credentials,
            accept_rules: self.accept_rules,
            allow_list: self.allow_list,
            mime_map: self.mime_map,
            default_pages: self.default_pages.unwrap_or_else(|| {
                DEFAULT_INDEX_NAMES.iter().map(|name| name.to_string()).collect()
            }),
            aliases: self.aliases,
            environment: self.environment,
            logger: self.logger,
            verbosity: self.verbosity,
            listing: self.listing,
            server_id: self.server_id,
            timeout: self.timeout,
            max_connections: self.max_connections,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn build_canonicalizes_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("www")).unwrap();
        let config = ServerConfig::builder(dir.path().join("www/../www/."))
            .build()
            .unwrap();
        assert_eq!(config.root, std::fs::canonicalize(dir.path().join("www")).unwrap());
        assert_eq!(config.default_pages, DEFAULT_INDEX_NAMES);
    }

    #[test]
    fn build_fails_for_missing_root() {
        let dir = tempdir().unwrap();
        assert!(ServerConfig::builder(dir.path().join("missing"))
            .build()
            .is_err());
    }

    #[test]
    fn build_fails_for_file_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "").unwrap();
        assert!(ServerConfig::builder(&file).build().is_err());
    }

    #[test]
    fn default_page_replaces_builtin_list() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::builder(dir.path())
            .default_page("home.html")
            .default_page("index.txt")
            .build()
            .unwrap();
        assert_eq!(config.default_pages, ["home.html", "index.txt"]);
    }

    #[test]
    fn env_pair_works() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::builder(dir.path())
            .env_pair("SITE=a=b")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.environment.get("SITE").map(String::as_str), Some("a=b"));
        assert!(ServerConfig::builder(dir.path()).env_pair("NOVALUE").is_err());
        assert!(ServerConfig::builder(dir.path()).env_pair("=x").is_err());
    }
}
