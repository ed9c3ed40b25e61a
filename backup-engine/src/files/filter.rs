//! Path exclusion for the file walk.

use std::path::Path;

/// Directory and file names that are never worth backing up.
const SYSTEM_NAMES: &[&str] = &[".git", ".svn", ".hg", "node_modules", ".DS_Store", "Thumbs.db"];

/// CMS cache and scratch locations, relative to the site root.
const CACHE_PREFIXES: &[&str] = &[
    "wp-content/cache",
    "wp-content/upgrade",
    "wp-content/backups",
    "wp-content/uploads/cache",
    "var/cache",
    "tmp",
];

/// Decides whether a relative path is left out of the backup.
///
/// Patterns containing `/` match a relative-path prefix; bare patterns match
/// any path component by name.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    names: Vec<String>,
    prefixes: Vec<String>,
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl PathFilter {
    /// Built-in exclusions plus the user's patterns.
    pub fn new(user_patterns: &[String]) -> Self {
        let mut filter = Self {
            names: SYSTEM_NAMES.iter().map(|s| s.to_string()).collect(),
            prefixes: CACHE_PREFIXES.iter().map(|s| s.to_string()).collect(),
        };
        for pattern in user_patterns {
            filter.add(pattern);
        }
        filter
    }

    pub fn add(&mut self, pattern: &str) {
        let pattern = normalize(pattern);
        if pattern.is_empty() {
            return;
        }
        if pattern.contains('/') {
            self.prefixes.push(pattern);
        } else {
            self.names.push(pattern);
        }
    }

    /// Exclude `path` if it lies under `root`, e.g. the engine's own work directory.
    pub fn exclude_local_path(&mut self, root: &Path, path: &Path) {
        if let Ok(relative) = path.strip_prefix(root) {
            let relative = relative.to_string_lossy().replace('\\', "/");
            let relative = normalize(&relative);
            if !relative.is_empty() {
                self.prefixes.push(relative);
            }
        }
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            return false;
        }
        if relative
            .split('/')
            .any(|component| self.names.iter().any(|n| n == component))
        {
            return true;
        }
        self.prefixes.iter().any(|prefix| {
            relative == prefix
                || (relative.starts_with(prefix.as_str())
                    && relative.as_bytes().get(prefix.len()) == Some(&b'/'))
        })
    }
}
