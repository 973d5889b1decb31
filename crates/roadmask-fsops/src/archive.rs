//! Persisting masked outputs and archiving originals.

use std::io::Cursor;
use std::path::Path;

use image::{
    EncodableLayout, GrayImage, ImageBuffer, ImageFormat, Pixel, PixelWithColorType, RgbImage,
};
use roadmask_core::{MetadataRecord, TaskFailure};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{FsOpsError, FsOpsResult};
use crate::layout::FileTask;
use crate::retry::RetryingFileIo;

/// What [`Archiver::archive`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Archive destinations written.
    pub destinations: usize,
    /// Whether the input file was removed afterwards.
    pub input_deleted: bool,
}

/// Writes outputs and archive copies through [`RetryingFileIo`].
#[derive(Clone)]
pub struct Archiver {
    io: RetryingFileIo,
    delete_input: bool,
}

impl Archiver {
    /// Build an archiver. `delete_input` removes each input once every
    /// archive copy is confirmed; it has no effect without archive roots.
    #[must_use]
    pub const fn new(io: RetryingFileIo, delete_input: bool) -> Self {
        Self { io, delete_input }
    }

    /// Underlying IO facade.
    #[must_use]
    pub const fn io(&self) -> &RetryingFileIo {
        &self.io
    }

    /// Encode and atomically write the masked image (format from the output
    /// extension) and, when enabled, the PNG mask preview.
    ///
    /// # Errors
    ///
    /// Returns an encode error or the IO failure that outlasted retries.
    pub fn save(
        &self,
        task: &FileTask,
        masked: &RgbImage,
        preview: Option<&GrayImage>,
    ) -> FsOpsResult<()> {
        let output = task.output();
        let format = ImageFormat::from_path(&output.image).map_err(|source| FsOpsError::Encode {
            path: output.image.clone(),
            source,
        })?;
        let bytes = encode(masked, format, &output.image)?;
        self.io.write_atomic(&output.image, &bytes)?;

        if let (Some(path), Some(preview)) = (&output.preview, preview) {
            let bytes = encode(preview, ImageFormat::Png, path)?;
            self.io.write_atomic(path, &bytes)?;
        }
        Ok(())
    }

    /// Copy the original and its record into every archive tree, then write
    /// the output record. The output record is the last artifact written, so
    /// its presence marks a completed task. Deletes the input afterwards when
    /// configured and at least one archive copy exists.
    ///
    /// # Errors
    ///
    /// Returns the first IO or serialization failure. Artifacts written before
    /// the failure are left in place.
    pub fn archive(&self, task: &FileTask, record: &MetadataRecord) -> FsOpsResult<ArchiveReport> {
        let output = task.output();
        let json = serde_json::to_vec_pretty(record)
            .map_err(|source| FsOpsError::json("record.serialize", &output.record, source))?;

        for archive in task.archives() {
            if archive.original.exists() {
                warn!(
                    path = %archive.original.display(),
                    destination = archive.kind.as_str(),
                    "archive file already exists; overwriting"
                );
            }
            self.io.copy_atomic(task.input(), &archive.original)?;
            self.io.write_atomic(&archive.record, &json)?;
        }
        self.io.write_atomic(&output.record, &json)?;

        let mut input_deleted = false;
        if self.delete_input && !task.archives().is_empty() {
            let confirmed = task
                .archives()
                .iter()
                .all(|archive| archive.original.is_file() && archive.record.is_file());
            if confirmed {
                self.io.remove_file(task.input())?;
                input_deleted = true;
                info!(path = %task.input().display(), "input removed after archiving");
            } else {
                warn!(path = %task.input().display(), "archive copies not confirmed; keeping input");
            }
        }

        Ok(ArchiveReport {
            destinations: task.archives().len(),
            input_deleted,
        })
    }

    /// Copy a failed input into the error tree and write a note with the
    /// failure cause next to it. Returns `false` when the error mirror is
    /// disabled for the task.
    ///
    /// An input that has already disappeared only gets the note.
    ///
    /// # Errors
    ///
    /// Returns the IO failure that outlasted retries.
    pub fn mirror_failure(&self, task: &FileTask, failure: &TaskFailure) -> FsOpsResult<bool> {
        let Some(error) = task.error() else {
            return Ok(false);
        };
        if task.input().is_file() {
            self.io.copy_atomic(task.input(), &error.original)?;
        } else {
            warn!(path = %task.input().display(), "failed input is gone; writing error note only");
        }
        let note = format!(
            "input: {}\nstage: {}\nkind: {}\ncause: {}\n",
            task.relative().display(),
            failure.stage.as_str(),
            failure.kind.as_str(),
            failure.detail
        );
        self.io.write_atomic(&error.note, note.as_bytes())?;
        Ok(true)
    }
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn encode<P>(
    image: &ImageBuffer<P, Vec<P::Subpixel>>,
    format: ImageFormat,
    path: &Path,
) -> FsOpsResult<Vec<u8>>
where
    P: Pixel + PixelWithColorType,
    [P::Subpixel]: EncodableLayout,
{
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, format)
        .map_err(|source| FsOpsError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(buffer.into_inner())
}
