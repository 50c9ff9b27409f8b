use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::ServerConfig;
use crate::encoding::{url_decode, ClfDate, LogEncoded, UrlEncoded};
use crate::error::RequestError;
use crate::path::{normalize, strip_suffix, CanonicalPath};
use crate::request::ParsedRequest;
use crate::resolve::{ListInfo, ResolvedResource};

/// Per-connection state handed to the dispatcher and the logger.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Peer address in string form.
    pub address: String,
    pub config: Arc<ServerConfig>,
}

impl ConnectionContext {
    pub fn new(address: &str, config: Arc<ServerConfig>) -> Self {
        Self {
            address: address.to_string(),
            config,
        }
    }
}

/// What to send back for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    File {
        path: PathBuf,
        size: u64,
        modified: Option<SystemTime>,
        mimetype: String,
        env: BTreeMap<String, String>,
    },
    Listing {
        /// URL of the directory, with leading and trailing slash.
        url: String,
        entries: Vec<ListInfo>,
    },
    /// 301 to the given location.
    Redirect(String),
    Error(RequestError),
}

impl Disposition {
    pub fn status(&self) -> u16 {
        match self {
            Self::File { .. } | Self::Listing { .. } => 200,
            Self::Redirect(_) => 301,
            Self::Error(e) => e.status(),
        }
    }

    /// Whether a `WWW-Authenticate` challenge has to be sent.
    pub fn challenge(&self) -> bool {
        matches!(self, Self::Error(e) if e.challenge())
    }
}

/// Outcome of dispatching one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub disposition: Disposition,
    /// Authenticated user, if any.
    pub principal: Option<String>,
}

/// Run a request through admission, path resolution and lookup, then log it.
///
/// The logger is invoked exactly once, after resolution, whatever the outcome. The logged
/// status is the resolved disposition; a failure while the reply is written later is not
/// reflected in it.
pub fn dispatch(ctx: &ConnectionContext, request: &ParsedRequest) -> Resolution {
    let resolution = resolve_request(ctx, request);
    log_request(ctx, request, &resolution);
    resolution
}

/// Dispatch a request that could not be parsed.
pub fn dispatch_error(ctx: &ConnectionContext, error: RequestError) -> Resolution {
    let resolution = Resolution {
        disposition: Disposition::Error(error),
        principal: None,
    };
    let summary = format!(
        "{} - - {} \"-\" {} -",
        ctx.address,
        ClfDate(SystemTime::now()),
        error.status()
    );
    emit(ctx, &summary);
    resolution
}

fn resolve_request(ctx: &ConnectionContext, request: &ParsedRequest) -> Resolution {
    let config = &*ctx.config;
    let mut resolution = Resolution {
        disposition: Disposition::Error(RequestError::NotImplemented),
        principal: None,
    };
    if !matches!(request.method.as_str(), "GET" | "HEAD") {
        return resolution;
    }

    let gate = config.auth_gate();
    resolution.principal = match gate.admit(&ctx.address, request) {
        Ok(principal) => principal,
        Err(e) => {
            if config.verbosity >= 2 {
                eprintln!("{}: admission denied: {}", ctx.address, e);
            }
            resolution.disposition = Disposition::Error(e);
            return resolution;
        }
    };

    let requested = match request_path(&request.path) {
        Ok(requested) => requested,
        Err(e) => {
            resolution.disposition = Disposition::Error(e);
            return resolution;
        }
    };
    let target = config.aliases.resolve(&requested);

    if let Err(e) = gate.authorize(resolution.principal.as_deref(), &target) {
        if config.verbosity >= 2 {
            eprintln!("{}: /{} denied: {}", ctx.address, target, e);
        }
        resolution.disposition = Disposition::Error(e);
        return resolution;
    }

    let resolver = config.resolver();
    let resource = resolver.resolve(&target);
    if config.verbosity >= 1 {
        eprintln!("{}: {} -> {:?}", ctx.address, request.path, resource);
    }
    if let Some(real) = resource.path() {
        // Symlinks and default pages can reach a path the rules above never saw.
        let authorized = resolver
            .relative(real)
            .ok_or(RequestError::Forbidden)
            .and_then(|served| gate.authorize(resolution.principal.as_deref(), &served));
        if let Err(e) = authorized {
            if config.verbosity >= 2 {
                eprintln!("{}: {} denied: {}", ctx.address, real.display(), e);
            }
            resolution.disposition = Disposition::Error(e);
            return resolution;
        }
    }

    resolution.disposition = match resource {
        ResolvedResource::NotFound => Disposition::Error(RequestError::NotFound),
        ResolvedResource::Forbidden => Disposition::Error(RequestError::Forbidden),
        ResolvedResource::Directory { .. } if needs_slash(&requested) => {
            Disposition::Redirect(redirect_location(&requested, request))
        }
        ResolvedResource::Directory { entries, .. } => Disposition::Listing {
            url: requested.url(),
            entries,
        },
        ResolvedResource::File {
            default_page: true, ..
        } if needs_slash(&requested) => {
            Disposition::Redirect(redirect_location(&requested, request))
        }
        ResolvedResource::File {
            path,
            size,
            modified,
            ..
        } => {
            let mimetype = config
                .mime_map
                .content_type(&path.to_string_lossy())
                .to_string();
            let principal = resolution.principal.as_deref();
            let env = cgi_environment(ctx, request, principal, &requested, &path);
            Disposition::File {
                path,
                size,
                modified,
                mimetype,
                env,
            }
        }
    };
    resolution
}

/// Decode and canonicalize the request target.
fn request_path(raw: &str) -> Result<CanonicalPath, RequestError> {
    let decoded = url_decode(strip_suffix(raw));
    if decoded.contains('\0') {
        return Err(RequestError::TraversalRejected);
    }
    let path = normalize(&decoded);
    if path.is_escape_attempt() {
        return Err(RequestError::TraversalRejected);
    }
    Ok(path)
}

fn needs_slash(path: &CanonicalPath) -> bool {
    !path.is_root() && !path.has_trailing_slash()
}

/// The requested URL with a slash appended, keeping any query string.
///
/// Segments are re-encoded so the location is always safe to put in a header.
fn redirect_location(requested: &CanonicalPath, request: &ParsedRequest) -> String {
    let mut location = String::new();
    for segment in requested.segments() {
        location.push('/');
        location.push_str(&UrlEncoded(segment).to_string());
    }
    location.push('/');
    let query = request.query();
    if !query.is_empty() && !query.chars().any(|c| c.is_control()) {
        location.push('?');
        location.push_str(query);
    }
    location
}

/// CGI/1.1 style environment for a resolved file.
///
/// Static entries from the configuration come first; entries derived from the request
/// replace them.
pub fn cgi_environment(
    ctx: &ConnectionContext,
    request: &ParsedRequest,
    principal: Option<&str>,
    requested: &CanonicalPath,
    resolved: &std::path::Path,
) -> BTreeMap<String, String> {
    let config = &*ctx.config;
    let mut env = config.environment.clone();

    for (name, value) in request.headers() {
        if name.eq_ignore_ascii_case("Authorization") {
            continue;
        }
        let key: String = name
            .chars()
            .map(|c| match c {
                '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        let key = if matches!(key.as_str(), "CONTENT_TYPE" | "CONTENT_LENGTH") {
            key
        } else {
            format!("HTTP_{}", key)
        };
        env.insert(key, value.to_string());
    }

    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };
    set("GATEWAY_INTERFACE", "CGI/1.1".to_string());
    set(
        "SERVER_SOFTWARE",
        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    );
    set(
        "SERVER_PROTOCOL",
        request
            .protocol
            .clone()
            .unwrap_or_else(|| "HTTP/1.0".to_string()),
    );
    set("REQUEST_METHOD", request.method.clone());
    set("REQUEST_URI", request.path.clone());
    set("QUERY_STRING", request.query().to_string());
    set("SCRIPT_NAME", requested.url());
    set("SCRIPT_FILENAME", resolved.to_string_lossy().into_owned());
    set("DOCUMENT_ROOT", config.root.to_string_lossy().into_owned());
    set("REMOTE_ADDR", ctx.address.clone());
    if let Some(principal) = principal {
        set("AUTH_TYPE", "Basic".to_string());
        set("REMOTE_USER", principal.to_string());
    }
    env
}

fn log_request(ctx: &ConnectionContext, request: &ParsedRequest, resolution: &Resolution) {
    let size = match &resolution.disposition {
        Disposition::File { size, .. } => size.to_string(),
        _ => "-".to_string(),
    };
    let summary = format!(
        "{} - {} {} \"{} {} {}\" {} {} \"{}\" \"{}\"",
        ctx.address,
        LogEncoded(resolution.principal.as_deref().unwrap_or("-")),
        ClfDate(SystemTime::now()),
        LogEncoded(&request.method),
        LogEncoded(&request.path),
        LogEncoded(request.protocol.as_deref().unwrap_or("HTTP/0.9")),
        resolution.disposition.status(),
        size,
        LogEncoded(request.header("Referer").unwrap_or("")),
        LogEncoded(request.header("User-Agent").unwrap_or(""))
    );
    emit(ctx, &summary);
}

/// Hand a summary to the configured logger, ignoring failures.
fn emit(ctx: &ConnectionContext, summary: &str) {
    let logger = match &ctx.config.logger {
        Some(logger) => logger,
        None => return,
    };
    match catch_unwind(AssertUnwindSafe(|| logger.log(ctx, summary))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if ctx.config.verbosity >= 1 {
                eprintln!("warning: failed to write log message: {}", e);
            }
        }
        Err(_) => eprintln!("warning: logger panicked"),
    }
}
