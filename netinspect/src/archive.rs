//! Zip archiving of run evidence.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::{Error, Result};

/// Packs evidence into archives.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archive every file under `dir`. Entry names keep `dir`'s own name
    /// as their first component.
    async fn compress_directory(&self, dir: &Path, target: &Path) -> Result<PathBuf>;

    /// Archive `files` flat, by file name. Missing files are skipped.
    async fn compress_files(&self, files: &[PathBuf], target: &Path) -> Result<PathBuf>;
}

/// Deflate-compressed zip archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiver;

#[async_trait]
impl Archiver for ZipArchiver {
    async fn compress_directory(&self, dir: &Path, target: &Path) -> Result<PathBuf> {
        let dir = dir.to_path_buf();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            zip_directory(&dir, &target)?;
            Ok(target)
        })
        .await
        .map_err(|e| Error::Archive {
            message: format!("archive task failed: {e}"),
        })?
    }

    async fn compress_files(&self, files: &[PathBuf], target: &Path) -> Result<PathBuf> {
        let files = files.to_vec();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            zip_files(&files, &target)?;
            Ok(target)
        })
        .await
        .map_err(|e| Error::Archive {
            message: format!("archive task failed: {e}"),
        })?
    }
}

fn options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn zip_directory(dir: &Path, target: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(Error::Archive {
            message: format!("source directory not found: {}", dir.display()),
        });
    }
    let base = dir.parent().unwrap_or(dir);

    let mut files = Vec::new();
    collect_files(dir, &mut files).map_err(|e| Error::io(dir, e))?;
    files.sort();

    let mut writer = ZipWriter::new(File::create(target).map_err(|e| Error::io(target, e))?);
    for path in &files {
        let name = entry_name(path.strip_prefix(base).unwrap_or(path));
        add_file(&mut writer, path, name)?;
    }
    finish(writer, target)?;
    info!("Archived {} ({} files) -> {}", dir.display(), files.len(), target.display());
    Ok(())
}

fn zip_files(files: &[PathBuf], target: &Path) -> Result<()> {
    let mut writer = ZipWriter::new(File::create(target).map_err(|e| Error::io(target, e))?);
    let mut added = 0;
    for path in files {
        let Some(name) = path.file_name() else {
            continue;
        };
        if !path.is_file() {
            debug!("Skipping missing file {}", path.display());
            continue;
        }
        add_file(&mut writer, path, name.to_string_lossy().into_owned())?;
        added += 1;
    }
    finish(writer, target)?;
    info!("Archived {} files -> {}", added, target.display());
    Ok(())
}

fn add_file(writer: &mut ZipWriter<File>, path: &Path, name: String) -> Result<()> {
    writer
        .start_file(name, options())
        .map_err(|e| Error::Archive {
            message: format!("cannot add {}: {e}", path.display()),
        })?;
    let mut source = File::open(path).map_err(|e| Error::io(path, e))?;
    io::copy(&mut source, writer).map_err(|e| Error::io(path, e))?;
    Ok(())
}

fn finish(writer: ZipWriter<File>, target: &Path) -> Result<()> {
    writer.finish().map_err(|e| Error::Archive {
        message: format!("cannot finish {}: {e}", target.display()),
    })?;
    Ok(())
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Zip entry names always use `/`.
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use zip::ZipArchive;

    use super::*;

    fn entries(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_directory_archive_keeps_directory_name() {
        let tmp = tempfile::tempdir().unwrap();
        let device_dir = tmp.path().join("10.0.0.1_ts");
        std::fs::create_dir_all(device_dir.join("nested")).unwrap();
        std::fs::write(device_dir.join("10.0.0.1_a.log"), "alpha").unwrap();
        std::fs::write(device_dir.join("nested/b.txt"), "beta").unwrap();
        let target = tmp.path().join("10.0.0.1_ts.zip");

        let written = ZipArchiver
            .compress_directory(&device_dir, &target)
            .await
            .unwrap();

        assert_eq!(written, target);
        assert_eq!(
            entries(&target),
            vec!["10.0.0.1_ts/10.0.0.1_a.log", "10.0.0.1_ts/nested/b.txt"]
        );

        let mut archive = ZipArchive::new(File::open(&target).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("10.0.0.1_ts/10.0.0.1_a.log")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "alpha");
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ZipArchiver
            .compress_directory(&tmp.path().join("absent"), &tmp.path().join("x.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Archive { .. }));
    }

    #[tokio::test]
    async fn test_file_archive_is_flat_and_skips_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.zip");
        let b = tmp.path().join("failed_devices.txt");
        std::fs::write(&a, "zip bytes").unwrap();
        std::fs::write(&b, "10.0.0.3\n").unwrap();
        let target = tmp.path().join("all_devices_ts.zip");

        ZipArchiver
            .compress_files(&[a, tmp.path().join("gone.zip"), b], &target)
            .await
            .unwrap();

        assert_eq!(entries(&target), vec!["a.zip", "failed_devices.txt"]);
    }
}
