//! File indexing agent: reads a directory tree under a fixed root.
//!
//! Needs no LLM, so it keeps working when no engine is available. The
//! request is a path relative to the configured root; the reply is a JSON
//! index of relative path to file content.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use super::{require_request, Agent, AgentError, LocalAgent};
use crate::config::Config;

const IGNORED_DIRS: &[&str] = &["node_modules", "target", "__pycache__", "dist", "build"];

/// Where the indexer may look and how much it may return.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub root: PathBuf,
    pub max_files: usize,
    pub max_file_bytes: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            max_files: 200,
            max_file_bytes: 64 * 1024,
        }
    }
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.index_root.clone(),
            max_files: config.index_max_files,
            max_file_bytes: config.index_max_file_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
struct SkippedFile {
    path: String,
    reason: String,
}

#[derive(Debug, Serialize)]
struct FileIndex {
    root: String,
    files: BTreeMap<String, String>,
    skipped: Vec<SkippedFile>,
    /// More files existed than `max_files`
    truncated: bool,
}

#[derive(Debug, Clone)]
pub struct FileIndexingAgent {
    settings: IndexSettings,
}

impl FileIndexingAgent {
    pub fn new(settings: IndexSettings) -> Self {
        Self { settings }
    }

    /// Resolve `request` inside the root, following symlinks before the check.
    fn resolve(&self, request: &str) -> Result<(PathBuf, PathBuf), AgentError> {
        let root = self.settings.root.canonicalize().map_err(|e| {
            AgentError::Index(format!(
                "index root {} unavailable: {}",
                self.settings.root.display(),
                e
            ))
        })?;
        let target = root
            .join(request)
            .canonicalize()
            .map_err(|e| AgentError::Index(format!("{}: {}", request, e)))?;
        if !target.starts_with(&root) {
            return Err(AgentError::OutsideRoot(request.to_string()));
        }
        if !target.is_dir() {
            return Err(AgentError::Index(format!("{} is not a directory", request)));
        }
        Ok((root, target))
    }

    fn build_index(&self, request: &str) -> Result<FileIndex, AgentError> {
        let (root, target) = self.resolve(request)?;
        tracing::info!("Indexing files in {}", target.display());

        let mut index = FileIndex {
            root: request.to_string(),
            files: BTreeMap::new(),
            skipped: Vec::new(),
            truncated: false,
        };
        let walker = WalkDir::new(&target)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(keep_entry);

        let mut listed = 0usize;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!("Skipping unreadable entry: {}", err);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if listed >= self.settings.max_files {
                index.truncated = true;
                break;
            }
            listed += 1;

            let relative = relative_name(&root, entry.path());
            match self.read_file(entry.path()) {
                Ok(content) => {
                    index.files.insert(relative, content);
                }
                Err(reason) => {
                    tracing::debug!("Not indexing {}: {}", relative, reason);
                    index.skipped.push(SkippedFile {
                        path: relative,
                        reason,
                    });
                }
            }
        }
        tracing::info!(
            "Indexed {} files under {} ({} skipped)",
            index.files.len(),
            request,
            index.skipped.len()
        );
        Ok(index)
    }

    fn read_file(&self, path: &Path) -> Result<String, String> {
        let size = std::fs::metadata(path).map_err(|e| e.to_string())?.len();
        if size > self.settings.max_file_bytes {
            return Err(format!(
                "{} bytes exceeds the {} byte limit",
                size, self.settings.max_file_bytes
            ));
        }
        std::fs::read_to_string(path).map_err(|e| e.to_string())
    }
}

/// Hidden and build directories are not descended into.
fn keep_entry(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    !name.starts_with('.') && !IGNORED_DIRS.iter().any(|dir| *dir == name)
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

impl Agent for FileIndexingAgent {
    fn role(&self) -> &str {
        "File-Indexing-Agent"
    }

    fn profile(&self) -> &str {
        "Developer"
    }

    fn description(&self) -> &str {
        "Indexes the text files of a directory under the configured root"
    }
}

impl LocalAgent for FileIndexingAgent {
    fn respond(&self, request: &str) -> Result<String, AgentError> {
        let path = require_request(self.role(), request)?;
        let index = self.build_index(path)?;
        serde_json::to_string_pretty(&index).map_err(|e| AgentError::Index(e.to_string()))
    }
}
