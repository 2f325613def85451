//! Project tree walking and content hashing.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use sift_config::IndexingConfig;
use tracing::debug;

use crate::fingerprint::system_time_millis;

/// Directories never descended into, whatever the ignore files say.
const EXCLUDED_DIRS: &[&str] = &["target", "node_modules", ".git", "vendor", "__pycache__"];

/// Which files a scan picks up.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub extensions: Vec<String>,
    pub respect_gitignore: bool,
    pub max_file_bytes: u64,
}

impl From<&IndexingConfig> for ScanOptions {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            extensions: config.extensions.clone(),
            respect_gitignore: config.respect_gitignore,
            max_file_bytes: config.max_file_bytes,
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from(&IndexingConfig::default())
    }
}

impl ScanOptions {
    /// Whether `path` has one of the indexed extensions.
    pub fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }
}

/// A file found by [`scan_files`].
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Path relative to the scan root, `/`-separated.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    /// Modification time in Unix milliseconds (0 if unknown).
    pub modified: u64,
    /// Metadata could not be read; the file must be treated as changed.
    pub stat_failed: bool,
}

/// Walk `root` and return every indexable file, sorted by relative path.
pub fn scan_files(root: &Path, options: &ScanOptions) -> Vec<ScannedFile> {
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(options.respect_gitignore)
        .git_global(options.respect_gitignore)
        .git_exclude(options.respect_gitignore)
        .parents(options.respect_gitignore)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            !(is_dir && entry.depth() > 0 && is_excluded_dir(entry.file_name().to_str()))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("Skipping unreadable walk entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if !options.matches_extension(path) {
            continue;
        }
        let Some(rel_path) = relative_path(root, path) else {
            continue;
        };

        match entry.metadata() {
            Ok(meta) => {
                if meta.len() > options.max_file_bytes {
                    debug!("Skipping oversized file {} ({} bytes)", rel_path, meta.len());
                    continue;
                }
                files.push(ScannedFile {
                    rel_path,
                    abs_path: path.to_path_buf(),
                    size: meta.len(),
                    modified: meta.modified().map(system_time_millis).unwrap_or(0),
                    stat_failed: false,
                });
            }
            Err(e) => {
                debug!("Failed to stat {}: {}", rel_path, e);
                files.push(ScannedFile {
                    rel_path,
                    abs_path: path.to_path_buf(),
                    size: 0,
                    modified: 0,
                    stat_failed: true,
                });
            }
        }
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    files
}

fn is_excluded_dir(name: Option<&str>) -> bool {
    name.map(|n| EXCLUDED_DIRS.contains(&n)).unwrap_or(false)
}

/// Whether a relative path lies under an excluded or hidden directory.
pub fn is_excluded_path(rel_path: &str) -> bool {
    let mut segments: Vec<&str> = rel_path.split('/').collect();
    segments.pop();
    segments
        .iter()
        .any(|s| EXCLUDED_DIRS.contains(s) || s.starts_with('.'))
}

/// `path` relative to `root`, with `/` separators. `None` if `path` is
/// not under `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Raw SHA-256 digest of `bytes`.
pub fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(digest(bytes))
}

/// Hex SHA-256 of a file's content.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let content = std::fs::read(path)?;
    Ok(hash_bytes(&content))
}
