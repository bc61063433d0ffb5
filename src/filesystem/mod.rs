// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

mod attributes;
mod copy;

pub use attributes::{PathAttributes, PosixFilePermission};
pub use copy::{CopyMode, CopyState, CopyStatus};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::credentials::Credential;
use crate::errors::{Error, ErrorKind, Result};
use crate::path::Path;

use copy::CopyAdmin;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The primitives a storage back-end must provide.
///
/// Implementations receive absolute, normalized paths; relative-path
/// resolution, existence assertions and the recursive operations all live in
/// the [`FileSystem`] facade so every back-end gets them for free. Transport
/// errors must be translated into the common taxonomy before they leave the
/// port.
#[async_trait]
pub trait FileSystemPort: Send + Sync {
    async fn rename(&self, source: &Path, target: &Path) -> Result<()>;

    async fn create_directory(&self, dir: &Path) -> Result<()>;

    async fn create_file(&self, file: &Path) -> Result<()>;

    async fn create_symbolic_link(&self, link: &Path, target: &Path) -> Result<()>;

    /// Delete a file or link. Only called on existing non-directories.
    async fn delete_file(&self, file: &Path) -> Result<()>;

    /// Delete a directory. Only called once the directory is empty.
    async fn delete_directory(&self, dir: &Path) -> Result<()>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// List the entries of one directory, non-recursively, with attributes.
    /// Entries carry absolute paths. `.` and `..` may be included; the facade
    /// filters them.
    async fn list_directory(&self, dir: &Path) -> Result<Vec<PathAttributes>>;

    async fn read_from_file(&self, file: &Path) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Open a file for writing, truncating it. `size` is a hint for
    /// back-ends that can preallocate; it may be ignored.
    async fn write_to_file(
        &self,
        file: &Path,
        size: Option<u64>,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;

    async fn append_to_file(&self, file: &Path) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;

    async fn get_attributes(&self, path: &Path) -> Result<PathAttributes>;

    async fn read_symbolic_link(&self, link: &Path) -> Result<Path>;

    async fn set_posix_file_permissions(
        &self,
        path: &Path,
        permissions: &HashSet<PosixFilePermission>,
    ) -> Result<()>;

    /// Native server-side copy to a destination on a compatible back-end.
    /// Returns `Ok(false)` when the pair is not supported, in which case the
    /// generic stream-based pipeline is used instead.
    async fn third_party_copy(
        &self,
        _source: &Path,
        _destination_fs: &FileSystem,
        _destination: &Path,
        _mode: CopyMode,
    ) -> Result<bool> {
        Ok(false)
    }

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

pub(crate) struct FsInner {
    adaptor: String,
    location: String,
    credential: Credential,
    properties: HashMap<String, String>,
    port: Box<dyn FileSystemPort>,
    working_directory: Mutex<Path>,
    buffer_size: usize,
    closed: AtomicBool,
    pub(crate) copies: CopyAdmin,
}

/// A (possibly remote) file system.
///
/// Cheap to clone; all clones share the same connection, working directory
/// and copy administration. Equality is identity: two handles are equal when
/// they refer to the same underlying filesystem instance.
#[derive(Clone)]
pub struct FileSystem {
    pub(crate) inner: Arc<FsInner>,
}

impl PartialEq for FileSystem {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("adaptor", &self.inner.adaptor)
            .field("location", &self.inner.location)
            .finish_non_exhaustive()
    }
}

/// Create a new filesystem on the given adaptor.
///
/// `properties` configures the adaptor; unknown keys within the adaptor's
/// namespace are rejected.
pub async fn create_file_system(
    adaptor: &str,
    location: &str,
    credential: &Credential,
    properties: &HashMap<String, String>,
) -> Result<FileSystem> {
    match adaptor {
        crate::local::ADAPTOR_NAME => {
            crate::local::create_file_system(location, credential, properties).await
        }
        _ => Err(Error::new(
            ErrorKind::UnknownAdaptor,
            adaptor,
            format!("unknown filesystem adaptor: {adaptor}"),
        )),
    }
}

impl FileSystem {
    /// Wire up a facade around a back-end port. Must be called from within a
    /// tokio runtime: the per-filesystem copy worker is spawned here.
    pub fn new(
        adaptor: impl Into<String>,
        location: impl Into<String>,
        credential: Credential,
        properties: HashMap<String, String>,
        working_directory: Path,
        buffer_size: usize,
        port: Box<dyn FileSystemPort>,
    ) -> Result<FileSystem> {
        let adaptor = adaptor.into();
        if buffer_size == 0 {
            return Err(Error::new(
                ErrorKind::BadParameter,
                &adaptor,
                "copy buffer size must be larger than zero",
            ));
        }
        if !working_directory.is_absolute() {
            return Err(Error::new(
                ErrorKind::InvalidLocation,
                &adaptor,
                format!("working directory must be absolute: {working_directory}"),
            ));
        }
        log::debug!(
            "creating {adaptor} filesystem with working directory {working_directory} and buffer size {buffer_size}"
        );
        let inner = Arc::new(FsInner {
            adaptor,
            location: location.into(),
            credential,
            properties,
            port,
            working_directory: Mutex::new(working_directory.normalize()),
            buffer_size,
            closed: AtomicBool::new(false),
            copies: CopyAdmin::new(),
        });
        let fs = FileSystem { inner };
        fs.inner.copies.spawn_worker();
        Ok(fs)
    }

    pub fn adaptor_name(&self) -> &str {
        &self.inner.adaptor
    }

    pub fn location(&self) -> &str {
        &self.inner.location
    }

    pub fn credential(&self) -> &Credential {
        &self.inner.credential
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.inner.properties
    }

    pub fn path_separator(&self) -> char {
        self.inner.working_directory.lock().unwrap().separator()
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn get_working_directory(&self) -> Path {
        self.inner.working_directory.lock().unwrap().clone()
    }

    /// Change the directory relative paths resolve against. The target must
    /// exist and be a directory.
    pub async fn set_working_directory(&self, directory: &Path) -> Result<()> {
        let wd = self.to_absolute_path(directory);
        self.assert_directory_exists(&wd).await?;
        *self.inner.working_directory.lock().unwrap() = wd;
        Ok(())
    }

    /// Resolve a path against the working directory and normalize it.
    pub fn to_absolute_path(&self, path: &Path) -> Path {
        if path.is_absolute() {
            return path.normalize();
        }
        self.inner
            .working_directory
            .lock()
            .unwrap()
            .resolve(path)
            .normalize()
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && self.inner.port.is_open()
    }

    /// Close the filesystem. Copies still in flight are failed with
    /// `NotConnected`; their statuses remain observable until harvested.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.copies.shutdown(&self.inner.adaptor);
        self.inner.port.close().await
    }

    pub async fn exists(&self, path: &Path) -> Result<bool> {
        let absolute = self.to_absolute_path(path);
        self.inner.port.exists(&absolute).await
    }

    pub async fn get_attributes(&self, path: &Path) -> Result<PathAttributes> {
        let absolute = self.to_absolute_path(path);
        self.inner.port.get_attributes(&absolute).await
    }

    pub async fn create_directory(&self, dir: &Path) -> Result<()> {
        let absolute = self.to_absolute_path(dir);
        self.assert_path_not_exists(&absolute).await?;
        self.assert_parent_directory_exists(&absolute).await?;
        self.inner.port.create_directory(&absolute).await
    }

    /// Create a directory and any missing parents. Existing directories along
    /// the way, including the target itself, are left untouched.
    pub async fn create_directories(&self, dir: &Path) -> Result<()> {
        let absolute = self.to_absolute_path(dir);
        self.create_directories_abs(&absolute).await
    }

    fn create_directories_abs<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.inner.port.exists(dir).await? {
                let attrs = self.inner.port.get_attributes(dir).await?;
                if attrs.directory {
                    return Ok(());
                }
                return Err(self.err(
                    ErrorKind::PathAlreadyExists,
                    format!("path exists but is not a directory: {dir}"),
                ));
            }
            if let Some(parent) = dir.parent() {
                if (parent.is_absolute() || !parent.is_empty())
                    && !self.inner.port.exists(&parent).await?
                {
                    self.create_directories_abs(&parent).await?;
                }
            }
            self.inner.port.create_directory(dir).await
        })
    }

    pub async fn create_file(&self, file: &Path) -> Result<()> {
        let absolute = self.to_absolute_path(file);
        self.assert_path_not_exists(&absolute).await?;
        self.assert_parent_directory_exists(&absolute).await?;
        self.inner.port.create_file(&absolute).await
    }

    pub async fn create_symbolic_link(&self, link: &Path, target: &Path) -> Result<()> {
        let absolute = self.to_absolute_path(link);
        self.assert_path_not_exists(&absolute).await?;
        self.assert_parent_directory_exists(&absolute).await?;
        self.inner.port.create_symbolic_link(&absolute, target).await
    }

    /// Rename within this filesystem. Renaming a path onto itself is a no-op;
    /// the target must not exist otherwise.
    pub async fn rename(&self, source: &Path, target: &Path) -> Result<()> {
        let source = self.to_absolute_path(source);
        let target = self.to_absolute_path(target);
        self.assert_path_exists(&source).await?;
        if source == target {
            return Ok(());
        }
        self.assert_path_not_exists(&target).await?;
        self.assert_parent_directory_exists(&target).await?;
        self.inner.port.rename(&source, &target).await
    }

    /// Delete a file, link or directory. A populated directory is only
    /// removed when `recursive` is set.
    pub async fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        let absolute = self.to_absolute_path(path);
        self.assert_path_exists(&absolute).await?;
        self.delete_abs(absolute, recursive).await
    }

    fn delete_abs(&self, path: Path, recursive: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let attrs = self.inner.port.get_attributes(&path).await?;
            if attrs.directory {
                let listing = self.inner.port.list_directory(&path).await?;
                if recursive {
                    for entry in listing {
                        if is_dot_or_dotdot(&entry.path) {
                            continue;
                        }
                        self.delete_abs(entry.path, true).await?;
                    }
                } else if listing.iter().any(|e| !is_dot_or_dotdot(&e.path)) {
                    return Err(self.err(
                        ErrorKind::DirectoryNotEmpty,
                        format!("directory not empty: {path}"),
                    ));
                }
                self.inner.port.delete_directory(&path).await
            } else {
                self.inner.port.delete_file(&path).await
            }
        })
    }

    /// List a directory, depth-first when `recursive`, skipping `.` and `..`.
    /// The listing is materialized: it reflects the tree at call time.
    pub async fn list(&self, dir: &Path, recursive: bool) -> Result<Vec<PathAttributes>> {
        let absolute = self.to_absolute_path(dir);
        self.assert_directory_exists(&absolute).await?;
        let mut out = Vec::new();
        self.list_into(absolute, recursive, &mut out).await?;
        Ok(out)
    }

    fn list_into<'a>(
        &'a self,
        dir: Path,
        recursive: bool,
        out: &'a mut Vec<PathAttributes>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for entry in self.inner.port.list_directory(&dir).await? {
                if is_dot_or_dotdot(&entry.path) {
                    continue;
                }
                let descend = recursive && entry.directory;
                let child = entry.path.clone();
                out.push(entry);
                if descend {
                    self.list_into(child, true, out).await?;
                }
            }
            Ok(())
        })
    }

    pub async fn read_from_file(&self, file: &Path) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let absolute = self.to_absolute_path(file);
        self.assert_file_exists(&absolute).await?;
        self.inner.port.read_from_file(&absolute).await
    }

    /// Open a new file for writing. Fails when the file already exists.
    pub async fn write_to_file(
        &self,
        file: &Path,
        size: Option<u64>,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let absolute = self.to_absolute_path(file);
        self.assert_path_not_exists(&absolute).await?;
        self.assert_parent_directory_exists(&absolute).await?;
        self.inner.port.write_to_file(&absolute, size).await
    }

    pub async fn append_to_file(&self, file: &Path) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let absolute = self.to_absolute_path(file);
        self.assert_file_exists(&absolute).await?;
        self.inner.port.append_to_file(&absolute).await
    }

    pub async fn read_symbolic_link(&self, link: &Path) -> Result<Path> {
        let absolute = self.to_absolute_path(link);
        self.assert_path_exists(&absolute).await?;
        if !self.inner.port.get_attributes(&absolute).await?.symbolic_link {
            return Err(self.err(
                ErrorKind::InvalidPath,
                format!("not a symbolic link: {absolute}"),
            ));
        }
        self.inner.port.read_symbolic_link(&absolute).await
    }

    pub async fn set_posix_file_permissions(
        &self,
        path: &Path,
        permissions: &HashSet<PosixFilePermission>,
    ) -> Result<()> {
        let absolute = self.to_absolute_path(path);
        self.assert_path_exists(&absolute).await?;
        self.inner
            .port
            .set_posix_file_permissions(&absolute, permissions)
            .await
    }

    pub(crate) fn err(&self, kind: ErrorKind, message: impl Into<String>) -> Error {
        Error::new(kind, &self.inner.adaptor, message)
    }

    pub(crate) async fn assert_path_exists(&self, path: &Path) -> Result<()> {
        if !self.inner.port.exists(path).await? {
            return Err(self.err(ErrorKind::NoSuchPath, format!("path does not exist: {path}")));
        }
        Ok(())
    }

    pub(crate) async fn assert_path_not_exists(&self, path: &Path) -> Result<()> {
        if self.inner.port.exists(path).await? {
            return Err(self.err(
                ErrorKind::PathAlreadyExists,
                format!("path already exists: {path}"),
            ));
        }
        Ok(())
    }

    pub(crate) async fn assert_directory_exists(&self, path: &Path) -> Result<()> {
        self.assert_path_exists(path).await?;
        if !self.inner.port.get_attributes(path).await?.directory {
            return Err(self.err(
                ErrorKind::InvalidPath,
                format!("path is not a directory: {path}"),
            ));
        }
        Ok(())
    }

    pub(crate) async fn assert_file_exists(&self, path: &Path) -> Result<()> {
        self.assert_path_exists(path).await?;
        if !self.inner.port.get_attributes(path).await?.regular {
            return Err(self.err(ErrorKind::InvalidPath, format!("path is not a file: {path}")));
        }
        Ok(())
    }

    pub(crate) async fn assert_parent_directory_exists(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) if parent.is_absolute() || !parent.is_empty() => {
                self.assert_directory_exists(&parent).await
            }
            _ => Ok(()),
        }
    }

}

pub(crate) fn is_dot_or_dotdot(path: &Path) -> bool {
    matches!(path.file_name(), Some(".") | Some(".."))
}
