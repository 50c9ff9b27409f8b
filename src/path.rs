use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A request path with every `.` and `..` resolved.
///
/// Segments never contain a separator and are never `.` or `..`, so joining them under a
/// root can only name the root or one of its descendants. The empty path is the root
/// itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalPath {
    segments: Vec<String>,
    trailing_slash: bool,
    escape_attempt: bool,
}

/// Strip everything from the first `?` or `#` onward.
pub fn strip_suffix(raw: &str) -> &str {
    match raw.find(|c: char| matches!(c, '?' | '#')) {
        Some(end) => &raw[..end],
        None => raw,
    }
}

/// Canonicalize a raw request path. See [`normalize`].
pub fn canonicalize(raw: &str) -> CanonicalPath {
    normalize(strip_suffix(raw))
}

/// Resolve `\`, `//`, `/./` and `/../` in a path that has no query or fragment.
///
/// A `..` with nothing before it is dropped instead of climbing above the root, and the
/// result remembers that it happened.
pub fn normalize(path: &str) -> CanonicalPath {
    let path = path.replace('\\', "/");
    let mut segments: Vec<String> = path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .map(str::to_string)
        .collect();

    let mut escape_attempt = false;
    while let Some(index) = segments.iter().position(|segment| segment == "..") {
        if index == 0 {
            segments.remove(0);
            escape_attempt = true;
        } else {
            segments.drain(index - 1..=index);
        }
    }

    let trailing_slash = path.ends_with('/') && !segments.is_empty();
    CanonicalPath {
        segments,
        trailing_slash,
        escape_attempt,
    }
}

impl CanonicalPath {
    /// Rebuild a canonical path from a filesystem path relative to the root.
    ///
    /// Returns `None` if `relative` has anything but plain components or is not UTF-8.
    pub fn from_relative(relative: &Path) -> Option<CanonicalPath> {
        let segments = relative
            .components()
            .map(|component| match component {
                Component::Normal(name) => name.to_str().map(str::to_string),
                _ => None,
            })
            .collect::<Option<Vec<String>>>()?;
        Some(CanonicalPath {
            segments,
            trailing_slash: false,
            escape_attempt: false,
        })
    }

    /// Slash-joined segments, without a leading slash.
    pub fn as_str(&self) -> String {
        self.to_string()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn has_trailing_slash(&self) -> bool {
        self.trailing_slash
    }

    /// True if a leading `..` had to be dropped while normalizing.
    pub fn is_escape_attempt(&self) -> bool {
        self.escape_attempt
    }

    /// Segment-wise prefix test: `doc` is a prefix of `doc/a` but not of `docs`.
    pub fn starts_with(&self, prefix: &CanonicalPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Replace the leading `prefix_len` segments with `target`'s segments.
    pub fn splice(&self, prefix_len: usize, target: &CanonicalPath) -> CanonicalPath {
        let segments: Vec<String> = target
            .segments
            .iter()
            .chain(&self.segments[prefix_len..])
            .cloned()
            .collect();
        CanonicalPath {
            trailing_slash: self.trailing_slash && !segments.is_empty(),
            segments,
            escape_attempt: self.escape_attempt,
        }
    }

    /// Filesystem path of this request under `root`.
    pub fn under(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(&self.segments);
        path
    }

    /// URL form with a leading slash, e.g. for redirects and listing titles.
    pub fn url(&self) -> String {
        format!("/{}", self)
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))?;
        if self.trailing_slash {
            write!(f, "/")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("", "" ; "empty")]
    #[test_case("/", "" ; "root")]
    #[test_case("a/b/../c", "a/c" ; "inner parent")]
    #[test_case("a/../../b", "b" ; "excess parent")]
    #[test_case("../../etc/passwd", "etc/passwd" ; "leading parents")]
    #[test_case("..", "" ; "only parent")]
    #[test_case("../..//../", "" ; "only parents with slashes")]
    #[test_case("/abc/", "abc/" ; "trailing slash")]
    #[test_case("/abc/.", "abc" ; "trailing dot")]
    #[test_case("/abc/./", "abc/" ; "dot slash")]
    #[test_case("/abc/..", "" ; "back to root")]
    #[test_case("/abc/../def/", "def/" ; "sibling")]
    #[test_case("/a/b/c/../../d/", "a/d/" ; "two up")]
    #[test_case("//a///b////c/////", "a/b/c/" ; "repeated slashes")]
    #[test_case("\\a\\b\\..\\c", "a/c" ; "backslashes")]
    #[test_case("/a/b?x=../../..", "a/b" ; "query")]
    #[test_case("/a/b#../c", "a/b" ; "fragment")]
    #[test_case("/.d", ".d" ; "dotfile")]
    #[test_case("/a/...", "a/..." ; "three dots")]
    fn canonicalize_works(raw: &str, expected: &str) {
        assert_eq!(canonicalize(raw).as_str(), expected);
    }

    #[test]
    fn leading_parent_is_recorded() {
        assert!(canonicalize("a/../../b").is_escape_attempt());
        assert!(canonicalize("/../../secret").is_escape_attempt());
        assert!(!canonicalize("a/b/../c").is_escape_attempt());
        assert!(!canonicalize("a/..").is_escape_attempt());
    }

    #[test]
    fn passwd_stays_under_root() {
        let root = Path::new("/srv/www");
        let path = canonicalize("../../etc/passwd").under(root);
        assert!(path.starts_with(root));
        assert_ne!(path, Path::new("/etc/passwd"));
    }

    /// Every sequence of up to five segments drawn from a small alphabet.
    fn interleavings() -> Vec<String> {
        let alphabet = ["..", ".", "a", "b", "", "c\\..", "x?.."];
        let mut paths = vec![String::new()];
        let mut all = Vec::new();
        for _ in 0..5 {
            let mut next = Vec::new();
            for path in &paths {
                for segment in &alphabet {
                    next.push(format!("{}/{}", path, segment));
                }
            }
            all.extend(next.iter().cloned());
            paths = next;
        }
        all
    }

    #[test]
    fn never_leaves_a_parent_segment() {
        let root = Path::new("/srv/www");
        for raw in interleavings() {
            let canonical = canonicalize(&raw);
            assert!(
                canonical.segments().iter().all(|s| s != ".." && s != "."),
                "{:?} -> {:?}",
                raw,
                canonical
            );
            assert!(canonical.under(root).starts_with(root), "{:?}", raw);
        }
    }

    #[test]
    fn is_idempotent() {
        for raw in interleavings() {
            let once = canonicalize(&raw).as_str();
            let twice = canonicalize(&once).as_str();
            assert_eq!(once, twice, "{:?}", raw);
        }
    }

    #[test]
    fn starts_with_respects_segment_boundaries() {
        let path = canonicalize("/docs/a");
        assert!(path.starts_with(&canonicalize("/docs")));
        assert!(path.starts_with(&canonicalize("/docs/")));
        assert!(path.starts_with(&canonicalize("/")));
        assert!(!path.starts_with(&canonicalize("/doc")));
    }

    #[test]
    fn splice_replaces_prefix() {
        let path = canonicalize("/static/css/site.css");
        let target = canonicalize("assets/v2");
        assert_eq!(path.splice(1, &target).as_str(), "assets/v2/css/site.css");
    }

    #[test]
    fn splice_keeps_trailing_slash() {
        let target = canonicalize("assets");
        assert_eq!(canonicalize("/static").splice(1, &target).as_str(), "assets");
        assert_eq!(canonicalize("/static/").splice(1, &target).as_str(), "assets/");
        assert_eq!(canonicalize("/static/").splice(1, &canonicalize("/")).as_str(), "");
    }

    #[test]
    fn from_relative_keeps_plain_components() {
        let path = CanonicalPath::from_relative(Path::new("private/x.txt")).unwrap();
        assert_eq!(path, canonicalize("/private/x.txt"));
        assert!(path.starts_with(&canonicalize("/private")));
        assert_eq!(CanonicalPath::from_relative(Path::new("")), Some(canonicalize("/")));
        assert_eq!(CanonicalPath::from_relative(Path::new("../x")), None);
        assert_eq!(CanonicalPath::from_relative(Path::new("/etc")), None);
    }
}
