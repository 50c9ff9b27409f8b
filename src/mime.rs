use std::collections::HashMap;
use std::fs::File;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/xml-dtd     dtd",
    "application/xslt+xml    xslt",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "text/css                css",
    "text/html               html htm",
    "text/javascript         js",
    "text/plain              txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/x-msvideo         avi",
    "video/mp4               mp4",
];

/// Extension to content type table. Extensions are stored lowercase.
#[derive(Debug, Clone)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    default_mimetype: String,
}

impl MimeMap {
    /// An empty map that answers every lookup with `default_mimetype`.
    pub fn empty(default_mimetype: &str) -> Self {
        Self {
            mimetypes: HashMap::new(),
            default_mimetype: default_mimetype.to_string(),
        }
    }

    /// Add extension map from a file.
    pub fn parse_extension_map_file(&mut self, filename: &Path) -> Result<()> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.display()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", filename.display()))?;
            self.add_mimetype_line(&line);
        }
        Ok(())
    }

    /// Add line from an extension map.
    pub fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c: char| c.is_ascii_whitespace())
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.insert(extension, mimetype);
        }
    }

    pub fn insert(&mut self, extension: &str, mimetype: &str) {
        self.mimetypes
            .insert(extension.to_ascii_lowercase(), mimetype.to_string());
    }

    pub fn set_default_mimetype(&mut self, mimetype: &str) {
        self.default_mimetype = mimetype.to_string();
    }

    pub fn default_mimetype(&self) -> &str {
        &self.default_mimetype
    }

    /// Get content type for a file name or URL.
    ///
    /// Only the last path component is considered, so `dir.d/README` has no extension.
    pub fn content_type(&self, name: &str) -> &str {
        let file_name = name.rsplit('/').next().unwrap_or(name);
        file_name
            .rsplit_once('.')
            .and_then(|(_, extension)| self.mimetypes.get(&extension.to_ascii_lowercase()))
            .map(String::as_str)
            .unwrap_or(self.default_mimetype.as_str())
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self::empty(DEFAULT_MIME_TYPE);
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    use tempfile::tempdir;
    use test_case::test_case;

    #[test_case("photo.jpg", "image/jpeg" ; "lowercase")]
    #[test_case("photo.JPG", "image/jpeg" ; "uppercase")]
    #[test_case("index.Html", "text/html" ; "mixed case")]
    #[test_case("archive.tar.zip", "application/zip" ; "last extension wins")]
    #[test_case("noext", DEFAULT_MIME_TYPE ; "no extension")]
    #[test_case("dir.d/README", DEFAULT_MIME_TYPE ; "dot in directory")]
    #[test_case("trailing.", DEFAULT_MIME_TYPE ; "empty extension")]
    #[test_case("file.unknown", DEFAULT_MIME_TYPE ; "unknown extension")]
    fn content_type_works(name: &str, expected: &str) {
        assert_eq!(MimeMap::default().content_type(name), expected);
    }

    #[test]
    fn mimetype_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mime.types");
        let mut file = File::create(&path).unwrap();
        let lines = &[
            "test/type1 a1",
            "test/this-gets-replaced  ap2",
            "# this is a comment",
            "test/type3\tapp3\r",
            "test/type2  ap2",
            "  test/foo foo",
            "text/x-markdown MD",
            "",
        ];
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }

        let mut mime_map = MimeMap::default();
        mime_map.parse_extension_map_file(&path).unwrap();
        mime_map.set_default_mimetype("test/default");

        assert_eq!(mime_map.content_type("x.a1"), "test/type1");
        assert_eq!(mime_map.content_type("x.ap2"), "test/type2");
        assert_eq!(mime_map.content_type("x.app3"), "test/type3");
        assert_eq!(mime_map.content_type("x.foo"), "test/foo");
        assert_eq!(mime_map.content_type("x.md"), "text/x-markdown");
        assert_eq!(mime_map.content_type("x.appp4"), "test/default");
        assert_eq!(mime_map.content_type("x.png"), "image/png");
    }

    #[test]
    fn missing_mimetype_file_is_an_error() {
        let dir = tempdir().unwrap();
        let mut mime_map = MimeMap::default();
        assert!(mime_map
            .parse_extension_map_file(&dir.path().join("missing"))
            .is_err());
    }
}
