use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::RequestError;
use crate::path::{canonicalize, CanonicalPath};
use crate::request::ParsedRequest;

/// Username to secret table for HTTP basic authentication.
#[derive(Debug, Clone, Default)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn insert(&mut self, user: &str, secret: &str) {
        self.0.insert(user.to_string(), secret.to_string());
    }

    /// Add a `user:pass` pair as given on the command line.
    pub fn insert_pair(&mut self, user_pass: &str) -> Result<()> {
        let (user, secret) = user_pass
            .split_once(':')
            .context("expected user:pass after --auth")?;
        self.insert(user, secret);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check an `Authorization` header value and return the authenticated user.
    pub fn authenticate(&self, authorization: &str) -> Option<&str> {
        let (scheme, encoded) = authorization.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, secret) = decoded.split_once(':')?;
        let (user, expected) = self.0.get_key_value(user)?;
        secrets_match(secret.as_bytes(), expected.as_bytes()).then(|| user.as_str())
    }
}

/// Compare without stopping at the first differing byte.
fn secrets_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Per-path-prefix lists of users allowed to access that prefix.
#[derive(Debug, Clone, Default)]
pub struct AcceptRules(Vec<(CanonicalPath, Vec<String>)>);

impl AcceptRules {
    /// Only `users` may access paths under `prefix`.
    pub fn insert<S: AsRef<str>>(&mut self, prefix: &str, users: &[S]) {
        let users = users.iter().map(|user| user.as_ref().to_string()).collect();
        self.0.push((canonicalize(prefix), users));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every rule matching `path` must list `principal`.
    pub fn authorize(
        &self,
        principal: Option<&str>,
        path: &CanonicalPath,
    ) -> Result<(), RequestError> {
        for (prefix, users) in &self.0 {
            if !path.starts_with(prefix) {
                continue;
            }
            match principal {
                None => return Err(RequestError::AuthRequired),
                Some(principal) if !users.iter().any(|user| user == principal) => {
                    return Err(RequestError::AuthForbidden)
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// One entry of the source address allow list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPattern {
    Any,
    Exact(IpAddr),
    Network(IpAddr, u8),
}

impl IpPattern {
    pub fn matches(&self, addr: IpAddr) -> bool {
        let addr = unmap(addr);
        match *self {
            Self::Any => true,
            Self::Exact(exact) => unmap(exact) == addr,
            Self::Network(network, prefix_len) => match (unmap(network), addr) {
                (IpAddr::V4(network), IpAddr::V4(addr)) => {
                    prefix_matches(&network.octets(), &addr.octets(), prefix_len)
                }
                (IpAddr::V6(network), IpAddr::V6(addr)) => {
                    prefix_matches(&network.octets(), &addr.octets(), prefix_len)
                }
                _ => false,
            },
        }
    }
}

impl FromStr for IpPattern {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "*" {
            return Ok(Self::Any);
        }
        let (addr, prefix_len) = match s.split_once('/') {
            Some((addr, prefix_len)) => (addr, Some(prefix_len)),
            None => (s, None),
        };
        let addr =
            IpAddr::from_str(addr).with_context(|| format!("ip pattern {} is invalid", s))?;
        let prefix_len = match prefix_len {
            None => return Ok(Self::Exact(addr)),
            Some(prefix_len) => prefix_len
                .parse::<u8>()
                .with_context(|| format!("prefix length in {} is invalid", s))?,
        };
        let max_len = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max_len {
            return Err(anyhow!("prefix length in {} is larger than {}", s, max_len));
        }
        Ok(Self::Network(addr, prefix_len))
    }
}

/// Treat IPv4-mapped IPv6 addresses as the IPv4 address they carry.
fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

fn prefix_matches(network: &[u8], addr: &[u8], prefix_len: u8) -> bool {
    let full_bytes = usize::from(prefix_len / 8);
    let rest_bits = prefix_len % 8;
    if network[..full_bytes] != addr[..full_bytes] {
        return false;
    }
    if rest_bits == 0 {
        return true;
    }
    let mask = 0xFFu8 << (8 - rest_bits);
    network[full_bytes] & mask == addr[full_bytes] & mask
}

/// Ordered source address allow list. Empty allows everyone.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList(Vec<IpPattern>);

impl IpAllowList {
    pub fn push(&mut self, pattern: IpPattern) {
        self.0.push(pattern);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `peer` is the textual peer address; a port suffix is accepted.
    pub fn allows(&self, peer: &str) -> bool {
        if self.0.is_empty() {
            return true;
        }
        match parse_peer(peer) {
            Some(addr) => self.0.iter().any(|pattern| pattern.matches(addr)),
            None => false,
        }
    }
}

fn parse_peer(peer: &str) -> Option<IpAddr> {
    IpAddr::from_str(peer)
        .ok()
        .or_else(|| peer.parse::<std::net::SocketAddr>().ok().map(|addr| addr.ip()))
}

/// Admission decisions for one server.
#[derive(Debug, Clone, Copy)]
pub struct AuthGate<'a> {
    pub credentials: &'a Credentials,
    pub accept_rules: &'a AcceptRules,
    pub allow_list: &'a IpAllowList,
}

impl<'a> AuthGate<'a> {
    /// Source address and global credential checks, in that order.
    ///
    /// Returns the authenticated user, if the request carried a valid credential.
    pub fn admit(
        &self,
        peer: &str,
        request: &ParsedRequest,
    ) -> Result<Option<String>, RequestError> {
        if !self.allow_list.allows(peer) {
            return Err(RequestError::AuthForbidden);
        }
        let principal = request
            .header("Authorization")
            .and_then(|authorization| self.credentials.authenticate(authorization))
            .map(str::to_string);
        if !self.credentials.is_empty() && principal.is_none() {
            return Err(RequestError::AuthRequired);
        }
        Ok(principal)
    }

    /// Per-path rules for the alias-resolved path.
    pub fn authorize(
        &self,
        principal: Option<&str>,
        path: &CanonicalPath,
    ) -> Result<(), RequestError> {
        self.accept_rules.authorize(principal, path)
    }

    /// All checks for a request whose path has already been resolved.
    pub fn check(
        &self,
        peer: &str,
        request: &ParsedRequest,
        path: &CanonicalPath,
    ) -> Result<Option<String>, RequestError> {
        let principal = self.admit(peer, request)?;
        self.authorize(principal.as_deref(), path)?;
        Ok(principal)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    // "myuser:mypass" and "myuser:wrongpass"
    const GOOD: &str = "Basic bXl1c2VyOm15cGFzcw==";
    const WRONG: &str = "Basic bXl1c2VyOndyb25ncGFzcw==";
    // "other:secret"
    const OTHER: &str = "Basic b3RoZXI6c2VjcmV0";

    struct Fixture {
        credentials: Credentials,
        accept_rules: AcceptRules,
        allow_list: IpAllowList,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                credentials: Credentials::default(),
                accept_rules: AcceptRules::default(),
                allow_list: IpAllowList::default(),
            }
        }
        fn gate(&self) -> AuthGate<'_> {
            AuthGate {
                credentials: &self.credentials,
                accept_rules: &self.accept_rules,
                allow_list: &self.allow_list,
            }
        }
        fn with_users(mut self) -> Self {
            self.credentials.insert("myuser", "mypass");
            self.credentials.insert("other", "secret");
            self
        }
    }

    fn request(authorization: Option<&str>) -> ParsedRequest {
        let request = ParsedRequest::new("GET", "/");
        match authorization {
            Some(authorization) => request.with_header("Authorization", authorization),
            None => request,
        }
    }

    #[test]
    fn open_server_admits_everyone() {
        let fixture = Fixture::new();
        let path = canonicalize("/any");
        assert_eq!(fixture.gate().check("10.1.2.3", &request(None), &path), Ok(None));
    }

    #[test_case(None, Err(RequestError::AuthRequired) ; "missing")]
    #[test_case(Some(WRONG), Err(RequestError::AuthRequired) ; "wrong secret")]
    #[test_case(Some("Bearer abc"), Err(RequestError::AuthRequired) ; "other scheme")]
    #[test_case(Some("Basic !!!"), Err(RequestError::AuthRequired) ; "bad base64")]
    #[test_case(Some(GOOD), Ok(Some("myuser".to_string())) ; "good")]
    #[test_case(Some("basic bXl1c2VyOm15cGFzcw=="), Ok(Some("myuser".to_string())) ; "lowercase")]
    fn global_credentials(
        authorization: Option<&str>,
        expected: Result<Option<String>, RequestError>,
    ) {
        let fixture = Fixture::new().with_users();
        assert_eq!(
            fixture.gate().admit("127.0.0.1", &request(authorization)),
            expected
        );
    }

    #[test]
    fn allow_list_beats_valid_credentials() {
        let mut fixture = Fixture::new().with_users();
        fixture.allow_list.push("192.168.0.0/16".parse().unwrap());
        let path = canonicalize("/");
        assert_eq!(
            fixture.gate().check("10.0.0.1", &request(Some(GOOD)), &path),
            Err(RequestError::AuthForbidden)
        );
        assert_eq!(
            fixture.gate().check("192.168.4.2", &request(Some(GOOD)), &path),
            Ok(Some("myuser".to_string()))
        );
    }

    #[test]
    fn accept_rule_narrows_access() {
        let mut fixture = Fixture::new().with_users();
        fixture.accept_rules.insert("/private", &["myuser"]);
        let private = canonicalize("/private/report.txt");
        let public = canonicalize("/privateer.txt");
        assert_eq!(
            fixture.gate().check("127.0.0.1", &request(Some(OTHER)), &private),
            Err(RequestError::AuthForbidden)
        );
        assert_eq!(
            fixture.gate().check("127.0.0.1", &request(Some(GOOD)), &private),
            Ok(Some("myuser".to_string()))
        );
        assert_eq!(
            fixture.gate().check("127.0.0.1", &request(Some(OTHER)), &public),
            Ok(Some("other".to_string()))
        );
    }

    #[test]
    fn all_matching_rules_apply() {
        let mut fixture = Fixture::new().with_users();
        fixture.accept_rules.insert("/a", &["myuser", "other"]);
        fixture.accept_rules.insert("/a/b", &["myuser"]);
        let path = canonicalize("/a/b/c");
        assert_eq!(
            fixture.gate().check("127.0.0.1", &request(Some(OTHER)), &path),
            Err(RequestError::AuthForbidden)
        );
    }

    #[test]
    fn accept_rule_without_credentials_challenges() {
        let mut fixture = Fixture::new();
        fixture.accept_rules.insert("/private", &["myuser"]);
        let path = canonicalize("/private/");
        assert_eq!(
            fixture.gate().check("127.0.0.1", &request(None), &path),
            Err(RequestError::AuthRequired)
        );
    }

    #[test_case("*", "203.0.113.9", true ; "any")]
    #[test_case("127.0.0.1", "127.0.0.1", true ; "exact")]
    #[test_case("127.0.0.1", "127.0.0.2", false ; "exact mismatch")]
    #[test_case("127.0.0.1", "::ffff:127.0.0.1", true ; "mapped peer")]
    #[test_case("127.0.0.1", "127.0.0.1:5555", true ; "peer with port")]
    #[test_case("10.0.0.0/8", "10.200.1.1", true ; "network")]
    #[test_case("10.0.0.0/8", "11.0.0.1", false ; "outside network")]
    #[test_case("192.168.1.128/25", "192.168.1.200", true ; "partial byte")]
    #[test_case("192.168.1.128/25", "192.168.1.100", false ; "partial byte mismatch")]
    #[test_case("0.0.0.0/0", "8.8.8.8", true ; "zero prefix")]
    #[test_case("fe80::/10", "fe80::1", true ; "ipv6 network")]
    #[test_case("fe80::/10", "10.0.0.1", false ; "family mismatch")]
    #[test_case("127.0.0.1", "not-an-address", false ; "garbage peer")]
    fn allow_list_matching(pattern: &str, peer: &str, allowed: bool) {
        let mut allow_list = IpAllowList::default();
        allow_list.push(pattern.parse().unwrap());
        assert_eq!(allow_list.allows(peer), allowed);
    }

    #[test_case("10.0.0.0/33" ; "prefix too long")]
    #[test_case("10.0.0/8" ; "short address")]
    #[test_case("localhost" ; "hostname")]
    fn invalid_patterns(pattern: &str) {
        assert!(pattern.parse::<IpPattern>().is_err());
    }

    #[test]
    fn empty_allow_list_allows_garbage() {
        assert!(IpAllowList::default().allows("not-an-address"));
    }

    #[test]
    fn insert_pair_requires_colon() {
        let mut credentials = Credentials::default();
        assert!(credentials.insert_pair("nocolon").is_err());
        credentials.insert_pair("user:pa:ss").unwrap();
        // "user:pa:ss"
        assert_eq!(credentials.authenticate("Basic dXNlcjpwYTpzcw=="), Some("user"));
    }
}
