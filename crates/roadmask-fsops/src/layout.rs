//! Deterministic path mirroring between the input, output, and archive trees.

use std::path::{Path, PathBuf};

use roadmask_config::RoadmaskConfig;

use crate::error::{FsOpsError, FsOpsResult};

/// Suffix appended to the input file name for the metadata record.
const RECORD_SUFFIX: &str = ".json";
/// Suffix appended to the input file name for the mask preview.
const PREVIEW_SUFFIX: &str = ".mask.png";
/// Suffix appended to the input file name for the failure note.
const ERROR_NOTE_SUFFIX: &str = ".error.txt";

/// Archive destination flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    /// Archive on local storage.
    Local,
    /// Archive on a network share.
    Remote,
}

impl ArchiveKind {
    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Root mapping for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorLayout {
    input_root: PathBuf,
    output_root: PathBuf,
    archives: Vec<(ArchiveKind, PathBuf)>,
    error_root: Option<PathBuf>,
    write_preview: bool,
}

impl MirrorLayout {
    /// Mirror `input_root` into `output_root`, with previews enabled and no archives.
    #[must_use]
    pub fn new(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
            archives: Vec::new(),
            error_root: None,
            write_preview: true,
        }
    }

    /// Add an archive destination.
    #[must_use]
    pub fn with_archive(mut self, kind: ArchiveKind, root: impl Into<PathBuf>) -> Self {
        self.archives.push((kind, root.into()));
        self
    }

    /// Mirror failed inputs into `root`.
    #[must_use]
    pub fn with_error_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.error_root = Some(root.into());
        self
    }

    /// Toggle the mask preview artifact.
    #[must_use]
    pub const fn with_preview(mut self, write_preview: bool) -> Self {
        self.write_preview = write_preview;
        self
    }

    /// Build the layout from configuration.
    #[must_use]
    pub fn from_config(config: &RoadmaskConfig) -> Self {
        let paths = &config.paths;
        let mut layout = Self::new(&paths.input_root, &paths.output_root)
            .with_preview(config.masking.write_preview);
        if let Some(local) = &paths.archive.local_root {
            layout = layout.with_archive(ArchiveKind::Local, local);
        }
        if let Some(remote) = &paths.archive.remote_root {
            layout = layout.with_archive(ArchiveKind::Remote, remote);
        }
        if let Some(errors) = &paths.error_root {
            layout = layout.with_error_root(errors);
        }
        layout
    }

    /// Root of the input tree.
    #[must_use]
    pub fn input_root(&self) -> &Path {
        &self.input_root
    }

    /// Root of the output tree.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Whether any archive destination is configured.
    #[must_use]
    pub fn has_archives(&self) -> bool {
        !self.archives.is_empty()
    }

    /// Whether failed inputs are mirrored.
    #[must_use]
    pub const fn has_error_root(&self) -> bool {
        self.error_root.is_some()
    }

    /// Derive every artifact path for `input`.
    ///
    /// Derived names keep the full input file name, so `a.jpg` and `a.png`
    /// in one directory get distinct records.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::InvalidInput`] when `input` is not a file below
    /// the input root, or when its name would collide with a mask preview.
    pub fn task_for(&self, input: &Path) -> FsOpsResult<FileTask> {
        let relative = input
            .strip_prefix(&self.input_root)
            .map_err(|_| FsOpsError::InvalidInput {
                field: "input",
                reason: "outside input root",
                value: Some(input.display().to_string()),
            })?
            .to_path_buf();
        let Some(file_name) = relative.file_name().map(|name| name.to_string_lossy().into_owned())
        else {
            return Err(FsOpsError::InvalidInput {
                field: "input",
                reason: "missing file name",
                value: Some(input.display().to_string()),
            });
        };
        if file_name.to_ascii_lowercase().ends_with(PREVIEW_SUFFIX) {
            return Err(FsOpsError::InvalidInput {
                field: "input",
                reason: "name is reserved for mask previews",
                value: Some(input.display().to_string()),
            });
        }
        let record_name = format!("{file_name}{RECORD_SUFFIX}");

        let output_image = self.output_root.join(&relative);
        let output = OutputPaths {
            record: output_image.with_file_name(&record_name),
            preview: self
                .write_preview
                .then(|| output_image.with_file_name(format!("{file_name}{PREVIEW_SUFFIX}"))),
            image: output_image,
        };
        let error = self.error_root.as_ref().map(|root| {
            let original = root.join(&relative);
            ErrorPaths {
                note: original.with_file_name(format!("{file_name}{ERROR_NOTE_SUFFIX}")),
                original,
            }
        });
        let archives = self
            .archives
            .iter()
            .map(|(kind, root)| {
                let original = root.join(&relative);
                ArchivePaths {
                    kind: *kind,
                    record: original.with_file_name(&record_name),
                    original,
                }
            })
            .collect();

        Ok(FileTask {
            input: input.to_path_buf(),
            file_name,
            relative,
            output,
            archives,
            error,
        })
    }
}

/// Artifacts written under the output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    /// Masked image, same name and format as the input.
    pub image: PathBuf,
    /// Metadata record; written last and used as the commit marker.
    pub record: PathBuf,
    /// Binary mask preview, when enabled.
    pub preview: Option<PathBuf>,
}

/// Artifacts written under one archive root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePaths {
    /// Destination flavour.
    pub kind: ArchiveKind,
    /// Copy of the original input.
    pub original: PathBuf,
    /// Copy of the metadata record.
    pub record: PathBuf,
}

/// Destinations of the error mirror for one failed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPaths {
    /// Copy of the failed input.
    pub original: PathBuf,
    /// Text note holding the failure cause.
    pub note: PathBuf,
}

/// One input image and every path derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTask {
    input: PathBuf,
    relative: PathBuf,
    file_name: String,
    output: OutputPaths,
    archives: Vec<ArchivePaths>,
    error: Option<ErrorPaths>,
}

impl FileTask {
    /// Absolute input path.
    #[must_use]
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Input path relative to the input root.
    #[must_use]
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// File name of the input.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Output artifacts.
    #[must_use]
    pub const fn output(&self) -> &OutputPaths {
        &self.output
    }

    /// Archive artifacts, one entry per destination.
    #[must_use]
    pub fn archives(&self) -> &[ArchivePaths] {
        &self.archives
    }

    /// Error mirror destinations, when enabled. Never part of the done-check.
    #[must_use]
    pub const fn error(&self) -> Option<&ErrorPaths> {
        self.error.as_ref()
    }

    /// Every artifact that must exist for the task to count as done.
    #[must_use]
    pub fn expected_artifacts(&self) -> Vec<&Path> {
        let mut paths = vec![self.output.image.as_path(), self.output.record.as_path()];
        if let Some(preview) = &self.output.preview {
            paths.push(preview);
        }
        for archive in &self.archives {
            paths.push(&archive.original);
            paths.push(&archive.record);
        }
        paths
    }
}
