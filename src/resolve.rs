use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::path::CanonicalPath;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListInfo {
    /// File name; directories end with `/`.
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
}

/// What a canonical path refers to on disk.
///
/// `path` is always the real path, with symlinks resolved, and lies under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedResource {
    File {
        path: PathBuf,
        size: u64,
        modified: Option<SystemTime>,
        /// Found by probing the default pages of a directory.
        default_page: bool,
    },
    Directory {
        path: PathBuf,
        entries: Vec<ListInfo>,
    },
    NotFound,
    Forbidden,
}

impl ResolvedResource {
    /// Real path of a file or directory.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } | Self::Directory { path, .. } => Some(path),
            Self::NotFound | Self::Forbidden => None,
        }
    }
}

/// Map canonical request paths to files, default pages and listings under a root.
#[derive(Debug, Clone, Copy)]
pub struct ResourceResolver<'a> {
    /// Canonical (symlink-free) absolute root.
    pub root: &'a Path,
    pub default_pages: &'a [String],
    pub listing: bool,
}

impl<'a> ResourceResolver<'a> {
    pub fn resolve(&self, path: &CanonicalPath) -> ResolvedResource {
        let target = path.under(self.root);
        let (real, metadata) = match self.confined_metadata(&target) {
            Ok(confined) => confined,
            Err(resource) => return resource,
        };

        if metadata.is_file() {
            return ResolvedResource::File {
                path: real,
                size: metadata.len(),
                modified: metadata.modified().ok(),
                default_page: false,
            };
        }
        if !metadata.is_dir() {
            return ResolvedResource::Forbidden;
        }

        for page in self.default_pages {
            let candidate = real.join(page);
            if let Ok((candidate, metadata)) = self.confined_metadata(&candidate) {
                if metadata.is_file() {
                    return ResolvedResource::File {
                        path: candidate,
                        size: metadata.len(),
                        modified: metadata.modified().ok(),
                        default_page: true,
                    };
                }
            }
        }

        if !self.listing {
            // Indistinguishable from the directory not existing.
            return ResolvedResource::NotFound;
        }
        match list_directory(&real) {
            Ok(entries) => ResolvedResource::Directory {
                path: real,
                entries,
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => ResolvedResource::NotFound,
            Err(_) => ResolvedResource::Forbidden,
        }
    }

    /// Canonical request path naming `real`, if it is under the root.
    pub fn relative(&self, real: &Path) -> Option<CanonicalPath> {
        real.strip_prefix(self.root)
            .ok()
            .and_then(CanonicalPath::from_relative)
    }

    /// Real path and metadata of `target`, but only if the real path is still under the
    /// root.
    fn confined_metadata(
        &self,
        target: &Path,
    ) -> Result<(PathBuf, fs::Metadata), ResolvedResource> {
        let real = fs::canonicalize(target).map_err(classify)?;
        if !real.starts_with(self.root) {
            return Err(ResolvedResource::Forbidden);
        }
        let metadata = fs::symlink_metadata(&real).map_err(classify)?;
        Ok((real, metadata))
    }
}

fn classify(e: io::Error) -> ResolvedResource {
    match e.kind() {
        io::ErrorKind::PermissionDenied => ResolvedResource::Forbidden,
        _ => ResolvedResource::NotFound,
    }
}

/// Immediate children of `dir`, sorted by name.
pub fn list_directory(dir: &Path) -> io::Result<Vec<ListInfo>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            // Follow symlinks so linked directories list as directories.
            let metadata = fs::metadata(entry.path()).or_else(|_| entry.metadata()).ok()?;
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if metadata.is_dir() {
                name.push('/');
            }
            Some(ListInfo {
                name,
                size: metadata.len(),
                is_dir: metadata.is_dir(),
                modified: metadata.modified().ok(),
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
