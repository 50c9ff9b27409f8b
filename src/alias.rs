use crate::path::{canonicalize, CanonicalPath};

/// Request path prefix rewrites, applied before the path is joined under the root.
///
/// Both sides are canonical, and targets are relative to the root, so an alias can never
/// point outside of it.
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    aliases: Vec<(CanonicalPath, CanonicalPath)>,
}

impl AliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map requests under `from` to `to`.
    pub fn insert(&mut self, from: &str, to: &str) {
        self.aliases.push((canonicalize(from), canonicalize(to)));
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Rewrite the longest matching prefix of `path`.
    ///
    /// Among prefixes of equal length the one inserted first wins.
    pub fn resolve(&self, path: &CanonicalPath) -> CanonicalPath {
        let mut best: Option<&(CanonicalPath, CanonicalPath)> = None;
        for alias in &self.aliases {
            let (from, _) = alias;
            if !path.starts_with(from) {
                continue;
            }
            match best {
                Some((best_from, _)) if best_from.segments().len() >= from.segments().len() => {}
                _ => best = Some(alias),
            }
        }
        match best {
            Some((from, to)) => path.splice(from.segments().len(), to),
            None => path.clone(),
        }
    }
}
