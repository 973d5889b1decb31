//! Candidate discovery with skip-if-done resumability.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};
use roadmask_config::DiscoveryConfig;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{FsOpsError, FsOpsResult};
use crate::layout::{FileTask, MirrorLayout};

/// Extensions treated as images even when not accepted for processing.
const IMAGE_LIKE_EXTENSIONS: [&str; 10] = [
    "jpg", "jpeg", "png", "webp", "tif", "tiff", "bmp", "gif", "heic", "heif",
];

/// Filters applied during discovery.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    supported: Vec<String>,
    excluded: Vec<String>,
    exclude_globs: Option<GlobSet>,
    max_depth: Option<usize>,
    force_reprocess: bool,
    modified_since: Option<SystemTime>,
    only_subdirs: Vec<PathBuf>,
}

impl DiscoveryOptions {
    /// Compile options from the `discovery` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::Glob`] when an exclude pattern does not compile.
    pub fn from_config(config: &DiscoveryConfig) -> FsOpsResult<Self> {
        Ok(Self {
            supported: normalize_extensions(&config.supported_extensions),
            excluded: normalize_extensions(&config.excluded_extensions),
            exclude_globs: build_globset(&config.exclude_globs)?,
            max_depth: config.max_depth,
            force_reprocess: config.force_reprocess,
            modified_since: config.modified_since.map(SystemTime::from),
            only_subdirs: config.only_subdirs.clone(),
        })
    }

    /// Whether the done-check is bypassed.
    #[must_use]
    pub const fn force_reprocess(&self) -> bool {
        self.force_reprocess
    }
}

/// Whether a candidate still needs work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    /// At least one expected artifact is missing.
    Pending,
    /// Every expected artifact exists.
    AlreadyDone,
}

/// A discovered input file.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Derived paths for the file.
    pub task: FileTask,
    /// Done-check verdict.
    pub status: CandidateStatus,
}

/// Enumerates input files and decides which still need processing.
#[derive(Debug, Clone)]
pub struct PathIndex {
    layout: Arc<MirrorLayout>,
    options: Arc<DiscoveryOptions>,
}

impl PathIndex {
    /// Index the tree described by `layout`.
    #[must_use]
    pub fn new(layout: MirrorLayout, options: DiscoveryOptions) -> Self {
        Self {
            layout: Arc::new(layout),
            options: Arc::new(options),
        }
    }

    /// Root mapping in use.
    #[must_use]
    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    /// Start a fresh, lazy walk of the input tree.
    ///
    /// Entries are visited in file-name order. The returned iterator is
    /// single-pass; call `discover` again to start over.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::MissingRoot`] when the input root is missing or
    /// not a directory.
    pub fn discover(&self) -> FsOpsResult<Discovery> {
        let root = self.layout.input_root();
        let metadata = fs::metadata(root).map_err(|source| FsOpsError::MissingRoot {
            path: root.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(FsOpsError::MissingRoot {
                path: root.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotADirectory, "input root is not a directory"),
            });
        }

        let mut walker = WalkDir::new(root).sort_by_file_name();
        if let Some(depth) = self.options.max_depth {
            walker = walker.max_depth(depth.saturating_add(1));
        }
        Ok(Discovery {
            walker: walker.into_iter(),
            index: self.clone(),
        })
    }

    /// Walk the whole tree up front so the run knows its total.
    ///
    /// # Errors
    ///
    /// See [`PathIndex::discover`].
    pub fn discover_all(&self) -> FsOpsResult<Vec<Candidate>> {
        Ok(self.discover()?.collect())
    }

    /// Done-check: every expected artifact exists.
    #[must_use]
    pub fn is_done(&self, task: &FileTask) -> bool {
        task.expected_artifacts().iter().all(|path| path.is_file())
    }

    fn evaluate(&self, path: &Path) -> Option<Candidate> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())?;
        let options = &self.options;

        if options.excluded.contains(&extension)
            || (IMAGE_LIKE_EXTENSIONS.contains(&extension.as_str())
                && !options.supported.contains(&extension))
        {
            info!(path = %path.display(), extension = %extension, "skipping excluded image format");
            return None;
        }
        if !options.supported.contains(&extension) {
            return None;
        }

        let relative = path.strip_prefix(self.layout.input_root()).ok()?;
        if options
            .exclude_globs
            .as_ref()
            .is_some_and(|globs| globs.is_match(relative))
        {
            debug!(path = %path.display(), "skipping path matched by exclude glob");
            return None;
        }
        if !options.only_subdirs.is_empty()
            && !options.only_subdirs.iter().any(|dir| relative.starts_with(dir))
        {
            return None;
        }
        if let Some(since) = options.modified_since {
            match fs::metadata(path).and_then(|meta| meta.modified()) {
                Ok(modified) if modified < since => return None,
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "could not read modification time; keeping candidate");
                }
            }
        }

        let task = match self.layout.task_for(path) {
            Ok(task) => task,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not derive artifact paths");
                return None;
            }
        };
        let status = if !options.force_reprocess && self.is_done(&task) {
            CandidateStatus::AlreadyDone
        } else {
            CandidateStatus::Pending
        };
        Some(Candidate { task, status })
    }
}

/// Lazy sequence of candidates produced by [`PathIndex::discover`].
pub struct Discovery {
    walker: walkdir::IntoIter,
    index: PathIndex,
}

impl Iterator for Discovery {
    type Item = Candidate;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(
                        path = ?err.path(),
                        error = %err,
                        "skipping unreadable directory entry"
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(candidate) = self.index.evaluate(entry.path()) {
                return Some(candidate);
            }
        }
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(extensions.len());
    for ext in extensions {
        if let Some(ext) = DiscoveryConfig::normalize_extension(ext)
            && !normalized.contains(&ext)
        {
            normalized.push(ext);
        }
    }
    normalized
}

fn build_globset(patterns: &[String]) -> FsOpsResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|source| FsOpsError::glob("exclude_globs", pattern.clone(), source))?,
        );
    }
    builder
        .build()
        .map(Some)
        .map_err(|source| FsOpsError::glob("exclude_globs", "<set>".to_string(), source))
}
