//! Local staging tree for session exports.
//!
//! Layout, relative to the staging root:
//!
//! ```text
//! <contribution id>/article.<ext>
//! <contribution id>/<image key, with `/` as `_`>
//! ```

use crate::error::JobError;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error};

const STAGING_PREFIX: &str = "mcm-processing-";

/// Uniquely named scratch directory owned by one export job.
///
/// Removed by [`StagingTree::remove`], or on drop if the job is abandoned.
pub struct StagingTree {
    dir: TempDir,
}

impl StagingTree {
    pub fn create(parent: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(parent)?;
        debug!(path = %dir.path().display(), "Created staging tree");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn contribution_dir(&self, contribution_id: i64) -> PathBuf {
        self.path().join(contribution_id.to_string())
    }

    pub fn remove(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "Removed staging tree"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to delete staging tree"),
        }
    }
}

/// `article.<ext>`, keeping the extension of the article's original upload.
pub fn article_file_name(link_original: &str) -> String {
    match Path::new(link_original).extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => format!("article.{}", ext),
        _ => "article".to_string(),
    }
}

/// Local file name for an image: its whole storage key with `/` replaced by `_`.
///
/// Keys sharing a last segment (`faculty1/cover.png`, `faculty2/cover.png`)
/// stay distinct. Keys with empty, `.` or `..` segments, and keys that would
/// shadow the article file, are rejected.
pub fn image_file_name(key: &str) -> Result<String, JobError> {
    let unusable = || JobError::InvalidEntry(format!("unusable image key {:?}", key));

    let segments: Vec<&str> = key.split('/').collect();
    let bad_segment = |segment: &&str| {
        segment.is_empty() || *segment == "." || *segment == ".." || segment.contains('\\')
    };
    if segments.iter().any(bad_segment) {
        return Err(unusable());
    }

    let name = segments.join("_");
    if name == "article" || name.starts_with("article.") {
        return Err(unusable());
    }
    Ok(name)
}
