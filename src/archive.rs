//! Zip archive construction from a staging tree.

use crate::error::JobError;
use std::fs::File;
use std::io::{self, Seek, Write};
use std::path::{Component, Path};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Zips every regular file under `root` into a new temporary file in `parent`.
///
/// The temporary file is deleted when the returned handle is dropped.
pub fn build_archive(root: &Path, parent: &Path) -> Result<NamedTempFile, JobError> {
    let mut archive = tempfile::Builder::new()
        .prefix("mcm-export-")
        .suffix(".zip")
        .tempfile_in(parent)?;

    let entries = write_archive(root, archive.as_file_mut())?;
    archive.as_file_mut().rewind()?;

    debug!(
        path = %archive.path().display(),
        entries,
        "Built export archive"
    );
    Ok(archive)
}

/// Writes the tree under `root` depth-first as zip entries and returns the entry count.
///
/// Directories are not written as entries; each file is stored under its
/// path relative to `root`.
pub fn write_archive<W: Write + Seek>(root: &Path, out: W) -> Result<usize, JobError> {
    let mut zip = ZipWriter::new(out);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut entries = 0;

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry_name(root, entry.path())?;
        debug!(path = %entry.path().display(), entry = %name, "Adding archive entry");

        zip.start_file(name, options)?;
        let mut file = File::open(entry.path())?;
        io::copy(&mut file, &mut zip)?;
        entries += 1;
    }

    zip.finish()?;
    Ok(entries)
}

/// Archive entry name of `path`: relative to `root`, `/`-separated.
pub fn entry_name(root: &Path, path: &Path) -> Result<String, JobError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| JobError::InvalidEntry(format!("{} is outside the staging tree", path.display())))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                JobError::InvalidEntry(format!("{} is not valid UTF-8", relative.display()))
            })?),
            _ => {
                return Err(JobError::InvalidEntry(format!(
                    "{} is not a plain relative path",
                    relative.display()
                )))
            }
        }
    }

    if parts.is_empty() {
        return Err(JobError::InvalidEntry("staging root is not a file".to_string()));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::io::{Cursor, Read};

    fn stage(root: &Path, files: &[(&str, &[u8])]) {
        for (relative, body) in files {
            let path = root.join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
    }

    fn read_entries(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut body = Vec::new();
                file.read_to_end(&mut body).unwrap();
                (file.name().to_string(), body)
            })
            .collect()
    }

    #[test]
    fn test_archive_paths_match_staging_paths() {
        let staging = tempfile::tempdir().unwrap();
        stage(
            staging.path(),
            &[
                ("1/article.pdf", b"pdf body"),
                ("2/article.docx", b"docx body"),
                ("2/img1.png", b"png body"),
            ],
        );
        std::fs::create_dir(staging.path().join("3")).unwrap();

        let mut out = Cursor::new(Vec::new());
        let count = write_archive(staging.path(), &mut out).unwrap();
        assert_eq!(count, 3);

        let entries = read_entries(out.into_inner());
        let names: BTreeSet<String> = entries.iter().map(|(name, _)| name.clone()).collect();
        let expected: BTreeSet<String> = ["1/article.pdf", "2/article.docx", "2/img1.png"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, expected);

        for (name, body) in &entries {
            assert!(!name.starts_with('/'));
            assert!(!name.split('/').any(|part| part == ".."));
            assert_eq!(body, &std::fs::read(staging.path().join(name)).unwrap());
        }
    }

    #[test]
    fn test_empty_tree_builds_empty_archive() {
        let staging = tempfile::tempdir().unwrap();
        let mut out = Cursor::new(Vec::new());
        assert_eq!(write_archive(staging.path(), &mut out).unwrap(), 0);
        assert!(read_entries(out.into_inner()).is_empty());
    }

    #[test]
    fn test_build_archive_writes_temp_file() {
        let staging = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        stage(staging.path(), &[("7/article.odt", b"odt")]);

        let archive = build_archive(staging.path(), scratch.path()).unwrap();
        let path = archive.path().to_path_buf();
        assert!(path.starts_with(scratch.path()));

        let entries = read_entries(std::fs::read(&path).unwrap());
        assert_eq!(entries, vec![("7/article.odt".to_string(), b"odt".to_vec())]);

        drop(archive);
        assert!(!path.exists());
    }

    #[test]
    fn test_entry_name_rejects_paths_outside_root() {
        let root = Path::new("/tmp/staging");
        assert_eq!(
            entry_name(root, Path::new("/tmp/staging/4/img.png")).unwrap(),
            "4/img.png"
        );
        assert!(entry_name(root, Path::new("/tmp/other/4/img.png")).is_err());
        assert!(entry_name(root, root).is_err());
    }
}
