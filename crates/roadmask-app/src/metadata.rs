//! Fallback metadata extractor used when no EXIF reader is supplied.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use roadmask_core::{Metadata, MetadataError, MetadataExtractor};

/// Reports the file modification time as the capture time and the file size
/// as the only attribute. Never reports a location.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemMetadata;

impl MetadataExtractor for FileSystemMetadata {
    fn read_metadata(&self, path: &Path) -> Result<Metadata, MetadataError> {
        let stat = fs::metadata(path).map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let captured_at = stat.modified().ok().map(DateTime::<Utc>::from);
        let mut attributes = BTreeMap::new();
        attributes.insert("file_size".to_string(), stat.len().to_string());
        Ok(Metadata {
            captured_at,
            location: None,
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn reads_size_and_modification_time() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.jpg");
        fs::write(&path, b"12345")?;

        let metadata = FileSystemMetadata.read_metadata(&path)?;
        assert!(metadata.captured_at.is_some());
        assert!(metadata.location.is_none());
        assert_eq!(metadata.attributes.get("file_size").map(String::as_str), Some("5"));
        Ok(())
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = FileSystemMetadata.read_metadata(Path::new("/definitely/missing.jpg"));
        assert!(matches!(result, Err(MetadataError::Io { .. })));
    }
}
