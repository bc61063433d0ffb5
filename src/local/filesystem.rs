// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::fs as tokiofs;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::{Error, Result};
use crate::filesystem::{FileSystemPort, PathAttributes, PosixFilePermission};
use crate::path::Path;

use super::ADAPTOR_NAME;

/// Local-disk back-end, everything through `tokio::fs`.
pub struct LocalFileSystemPort {
    open: AtomicBool,
}

impl LocalFileSystemPort {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
        }
    }

    fn map_io(&self, message: impl Into<String>, err: io::Error) -> Error {
        Error::from_io(ADAPTOR_NAME, message, err)
    }
}

impl Default for LocalFileSystemPort {
    fn default() -> Self {
        Self::new()
    }
}

fn to_std(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string())
}

fn millis_since_epoch(time: io::Result<SystemTime>) -> Option<u64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
}

fn convert_attributes(path: Path, metadata: &std::fs::Metadata) -> PathAttributes {
    let file_type = metadata.file_type();
    let permissions = PosixFilePermission::from_mode_bits(metadata.permissions().mode());

    let mut attributes = PathAttributes {
        directory: file_type.is_dir(),
        regular: file_type.is_file(),
        symbolic_link: file_type.is_symlink(),
        size: metadata.len(),
        owner: Some(metadata.uid().to_string()),
        group: Some(metadata.gid().to_string()),
        executable: permissions.contains(&PosixFilePermission::OwnerExecute),
        readable: permissions.contains(&PosixFilePermission::OwnerRead),
        writable: permissions.contains(&PosixFilePermission::OwnerWrite),
        hidden: path.file_name().is_some_and(|n| n.starts_with('.')),
        ..Default::default()
    };
    attributes.other =
        !(attributes.directory || attributes.regular || attributes.symbolic_link);

    attributes.last_modified_time = millis_since_epoch(metadata.modified()).unwrap_or(0);
    attributes.creation_time = match millis_since_epoch(metadata.created()) {
        Some(t) => t,
        None => attributes.last_modified_time,
    };
    match millis_since_epoch(metadata.accessed()) {
        Some(t) => attributes.last_access_time = t,
        // No access time reported: the modification time lands in the
        // creation stamp and the access time stays at 0.
        None => attributes.creation_time = attributes.last_modified_time,
    }

    attributes.permissions = permissions;
    attributes.path = path;
    attributes
}

#[async_trait]
impl FileSystemPort for LocalFileSystemPort {
    async fn rename(&self, source: &Path, target: &Path) -> Result<()> {
        tokiofs::rename(to_std(source), to_std(target))
            .await
            .map_err(|e| self.map_io(format!("failed to rename {source} to {target}"), e))
    }

    async fn create_directory(&self, dir: &Path) -> Result<()> {
        tokiofs::create_dir(to_std(dir))
            .await
            .map_err(|e| self.map_io(format!("failed to create directory {dir}"), e))
    }

    async fn create_file(&self, file: &Path) -> Result<()> {
        tokiofs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(to_std(file))
            .await
            .map(|_| ())
            .map_err(|e| self.map_io(format!("failed to create file {file}"), e))
    }

    async fn create_symbolic_link(&self, link: &Path, target: &Path) -> Result<()> {
        tokiofs::symlink(to_std(target), to_std(link))
            .await
            .map_err(|e| self.map_io(format!("failed to create link {link} -> {target}"), e))
    }

    async fn delete_file(&self, file: &Path) -> Result<()> {
        tokiofs::remove_file(to_std(file))
            .await
            .map_err(|e| self.map_io(format!("failed to delete file {file}"), e))
    }

    async fn delete_directory(&self, dir: &Path) -> Result<()> {
        tokiofs::remove_dir(to_std(dir))
            .await
            .map_err(|e| self.map_io(format!("failed to delete directory {dir}"), e))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match tokiofs::symlink_metadata(to_std(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.map_io(format!("failed to stat {path}"), e)),
        }
    }

    async fn list_directory(&self, dir: &Path) -> Result<Vec<PathAttributes>> {
        let mut entries = tokiofs::read_dir(to_std(dir))
            .await
            .map_err(|e| self.map_io(format!("failed to list directory {dir}"), e))?;
        let mut result = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.map_io(format!("failed to list directory {dir}"), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = dir.resolve_str(&name);
            let metadata = tokiofs::symlink_metadata(entry.path())
                .await
                .map_err(|e| self.map_io(format!("failed to stat {child}"), e))?;
            result.push(convert_attributes(child, &metadata));
        }
        Ok(result)
    }

    async fn read_from_file(&self, file: &Path) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let f = tokiofs::File::open(to_std(file))
            .await
            .map_err(|e| self.map_io(format!("failed to open {file} for reading"), e))?;
        Ok(Box::new(f))
    }

    async fn write_to_file(
        &self,
        file: &Path,
        _size: Option<u64>,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let f = tokiofs::File::create(to_std(file))
            .await
            .map_err(|e| self.map_io(format!("failed to open {file} for writing"), e))?;
        Ok(Box::new(f))
    }

    async fn append_to_file(&self, file: &Path) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let f = tokiofs::OpenOptions::new()
            .append(true)
            .open(to_std(file))
            .await
            .map_err(|e| self.map_io(format!("failed to open {file} for appending"), e))?;
        Ok(Box::new(f))
    }

    async fn get_attributes(&self, path: &Path) -> Result<PathAttributes> {
        let metadata = tokiofs::symlink_metadata(to_std(path))
            .await
            .map_err(|e| self.map_io(format!("failed to stat {path}"), e))?;
        Ok(convert_attributes(path.clone(), &metadata))
    }

    async fn read_symbolic_link(&self, link: &Path) -> Result<Path> {
        let target = tokiofs::read_link(to_std(link))
            .await
            .map_err(|e| self.map_io(format!("failed to read link {link}"), e))?;
        Ok(Path::new(&target.to_string_lossy()))
    }

    async fn set_posix_file_permissions(
        &self,
        path: &Path,
        permissions: &HashSet<PosixFilePermission>,
    ) -> Result<()> {
        let mode = PosixFilePermission::to_mode_bits(permissions);
        tokiofs::set_permissions(to_std(path), std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| self.map_io(format!("failed to set permissions on {path}"), e))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn attributes_reflect_the_entry() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("data.txt");
        std::fs::write(&file, b"12345").unwrap();

        let port = LocalFileSystemPort::new();
        let path = Path::new(file.to_str().unwrap());
        let attrs = port.get_attributes(&path).await.unwrap();

        assert!(attrs.regular);
        assert!(!attrs.directory);
        assert_eq!(attrs.size, 5);
        assert!(attrs.last_modified_time > 0);
        assert!(!attrs.hidden);
        assert!(attrs.readable);
    }

    #[tokio::test]
    async fn dotfiles_are_hidden() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join(".profile");
        std::fs::write(&file, b"x").unwrap();

        let port = LocalFileSystemPort::new();
        let attrs = port
            .get_attributes(&Path::new(file.to_str().unwrap()))
            .await
            .unwrap();
        assert!(attrs.hidden);
    }

    #[tokio::test]
    async fn listing_does_not_follow_links() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("real"), b"x").unwrap();
        std::os::unix::fs::symlink("real", tmp.path().join("link")).unwrap();

        let port = LocalFileSystemPort::new();
        let dir = Path::new(tmp.path().to_str().unwrap());
        let listing = port.list_directory(&dir).await.unwrap();

        let link = listing
            .iter()
            .find(|a| a.path.file_name() == Some("link"))
            .unwrap();
        assert!(link.symbolic_link);
        assert!(!link.regular);

        let target = port.read_symbolic_link(&link.path).await.unwrap();
        assert_eq!(target, Path::new("real"));
    }

    #[tokio::test]
    async fn missing_paths_map_to_no_such_path() {
        let port = LocalFileSystemPort::new();
        let err = port
            .get_attributes(&Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::NoSuchPath);
    }
}
