// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::{is_dot_or_dotdot, FileSystem};
use crate::path::Path;
use crate::util;

/// What to do when the destination of a copy already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyMode {
    /// Fail with `PathAlreadyExists`.
    Create,
    /// Overwrite an existing file; merge into an existing directory.
    Replace,
    /// Leave the existing destination untouched.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyState {
    Pending,
    Running,
    Done,
    Failed,
}

impl CopyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyState::Pending => "PENDING",
            CopyState::Running => "RUNNING",
            CopyState::Done => "DONE",
            CopyState::Failed => "FAILED",
        }
    }
}

/// A point-in-time observation of an asynchronous copy.
#[derive(Debug, Clone)]
pub struct CopyStatus {
    copy_identifier: String,
    state: CopyState,
    bytes_to_copy: u64,
    bytes_copied: u64,
    error: Option<Arc<Error>>,
}

impl CopyStatus {
    fn new(
        copy_identifier: impl Into<String>,
        state: CopyState,
        bytes_to_copy: u64,
        bytes_copied: u64,
        error: Option<Arc<Error>>,
    ) -> Self {
        Self {
            copy_identifier: copy_identifier.into(),
            state,
            bytes_to_copy,
            bytes_copied,
            error,
        }
    }

    pub fn copy_identifier(&self) -> &str {
        &self.copy_identifier
    }

    pub fn state(&self) -> CopyState {
        self.state
    }

    /// Total planned bytes; only known once the planning pass has run.
    pub fn bytes_to_copy(&self) -> u64 {
        self.bytes_to_copy
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied
    }

    pub fn error(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }

    pub fn has_exception(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.state == CopyState::Running
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, CopyState::Done | CopyState::Failed)
    }
}

/// Shared progress and cancellation state of one copy. The worker updates it
/// between buffer transfers; observers read it lock-free.
pub(crate) struct CopyCallback {
    bytes_to_copy: AtomicU64,
    bytes_copied: AtomicU64,
    started: AtomicBool,
    begun: AtomicBool,
    cancelled: AtomicBool,
    outcome: Mutex<Option<Option<Arc<Error>>>>,
    done_tx: watch::Sender<bool>,
}

impl CopyCallback {
    fn new() -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            bytes_to_copy: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
            started: AtomicBool::new(false),
            begun: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            outcome: Mutex::new(None),
            done_tx,
        }
    }

    /// Record the planning result. Only the first call sticks.
    pub(crate) fn start(&self, bytes_to_copy: u64) {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.bytes_to_copy.store(bytes_to_copy, Ordering::SeqCst);
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn add_bytes_copied(&self, bytes: u64) {
        self.bytes_copied.fetch_add(bytes, Ordering::SeqCst);
    }

    fn bytes_to_copy(&self) -> u64 {
        self.bytes_to_copy.load(Ordering::SeqCst)
    }

    fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Marks that the worker picked this copy up, distinguishing a queued
    /// copy (which cancel resolves immediately) from one in flight.
    fn mark_begun(&self) {
        self.begun.store(true, Ordering::SeqCst);
    }

    fn has_begun(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }

    /// Record the terminal outcome. The first caller wins; later calls are
    /// ignored so a cancel racing the worker cannot overwrite the result.
    fn finish(&self, result: Result<()>) {
        let mut outcome = self.outcome.lock().unwrap();
        if outcome.is_none() {
            *outcome = Some(result.err().map(Arc::new));
        }
        drop(outcome);
        self.done_tx.send_replace(true);
    }

    fn is_finished(&self) -> bool {
        self.outcome.lock().unwrap().is_some()
    }

    fn finish_result(&self) -> Option<Option<Arc<Error>>> {
        self.outcome.lock().unwrap().clone()
    }

    fn done_receiver(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }
}

struct QueuedCopy {
    source_fs: FileSystem,
    source: Path,
    destination_fs: FileSystem,
    destination: Path,
    mode: CopyMode,
    recursive: bool,
    callback: Arc<CopyCallback>,
}

struct PendingCopy {
    callback: Arc<CopyCallback>,
}

/// Per-filesystem copy administration: the pending-copy map and the single
/// worker that serializes copies reading from this filesystem.
pub(crate) struct CopyAdmin {
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<QueuedCopy>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedCopy>>>,
    pending: Mutex<HashMap<String, PendingCopy>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CopyAdmin {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            next_id: AtomicU64::new(0),
            tx,
            rx: Mutex::new(Some(rx)),
            pending: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn spawn_worker(&self) {
        let Some(mut rx) = self.rx.lock().unwrap().take() else {
            return;
        };
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if job.callback.is_finished() {
                    continue;
                }
                job.callback.mark_begun();
                if job.callback.is_cancelled() {
                    job.callback
                        .finish(Err(job.source_fs.copy_cancelled_error()));
                    continue;
                }
                log::debug!(
                    "{}: copying {} to {}:{}",
                    job.source_fs.adaptor_name(),
                    job.source,
                    job.destination_fs.adaptor_name(),
                    job.destination
                );
                let result = job
                    .source_fs
                    .perform_copy(
                        &job.source,
                        &job.destination_fs,
                        &job.destination,
                        job.mode,
                        job.recursive,
                        &job.callback,
                    )
                    .await;
                job.callback.finish(result);
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn remove(&self, copy_identifier: &str) -> Option<PendingCopy> {
        self.pending.lock().unwrap().remove(copy_identifier)
    }

    /// Stop the worker and fail everything still pending so observers do not
    /// wait forever on a closed filesystem.
    pub(crate) fn shutdown(&self, adaptor: &str) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
        for entry in self.pending.lock().unwrap().values() {
            entry.callback.finish(Err(Error::new(
                ErrorKind::NotConnected,
                adaptor,
                "filesystem was closed",
            )));
        }
    }
}

impl FileSystem {
    /// Start an asynchronous copy of `source` on this filesystem to
    /// `destination` on `destination_fs`, which may be this filesystem or a
    /// different one. Returns immediately with an identifier that can be
    /// polled with [`get_status`](FileSystem::get_status).
    ///
    /// Copies reading from the same source filesystem run one at a time, in
    /// submission order; copies on different filesystems are independent.
    pub fn copy(
        &self,
        source: &Path,
        destination_fs: &FileSystem,
        destination: &Path,
        mode: CopyMode,
        recursive: bool,
    ) -> Result<String> {
        if !self.is_open() {
            return Err(self.err(ErrorKind::NotConnected, "filesystem is closed"));
        }
        let copy_identifier = format!(
            "COPY-{}-{}",
            self.adaptor_name(),
            self.inner.copies.next_id()
        );
        let callback = Arc::new(CopyCallback::new());
        let queued = QueuedCopy {
            source_fs: self.clone(),
            source: self.to_absolute_path(source),
            destination_fs: destination_fs.clone(),
            destination: destination_fs.to_absolute_path(destination),
            mode,
            recursive,
            callback: Arc::clone(&callback),
        };
        self.inner
            .copies
            .pending
            .lock()
            .unwrap()
            .insert(copy_identifier.clone(), PendingCopy { callback });
        self.inner
            .copies
            .tx
            .send(queued)
            .map_err(|_| self.err(ErrorKind::NotConnected, "filesystem is closed"))?;
        Ok(copy_identifier)
    }

    /// Status of a copy. Observing a terminal state removes the copy: a
    /// second lookup of the same identifier raises `NoSuchCopy`.
    pub fn get_status(&self, copy_identifier: &str) -> Result<CopyStatus> {
        let mut pending = self.inner.copies.pending.lock().unwrap();
        let entry = pending
            .get(copy_identifier)
            .ok_or_else(|| self.no_such_copy(copy_identifier))?;
        if entry.callback.is_finished() {
            let entry = pending.remove(copy_identifier).unwrap();
            drop(pending);
            return Ok(self.terminal_copy_status(copy_identifier, &entry.callback));
        }
        let state = if entry.callback.is_started() {
            CopyState::Running
        } else {
            CopyState::Pending
        };
        Ok(CopyStatus::new(
            copy_identifier,
            state,
            entry.callback.bytes_to_copy(),
            entry.callback.bytes_copied(),
            None,
        ))
    }

    /// Wait until a copy reaches a terminal state, or until `timeout_ms`
    /// expires (0 = wait indefinitely). On a terminal result the copy is
    /// removed; on timeout it keeps running and stays observable.
    pub async fn wait_until_done(
        &self,
        copy_identifier: &str,
        timeout_ms: u64,
    ) -> Result<CopyStatus> {
        let (callback, mut done) = {
            let pending = self.inner.copies.pending.lock().unwrap();
            let entry = pending
                .get(copy_identifier)
                .ok_or_else(|| self.no_such_copy(copy_identifier))?;
            (Arc::clone(&entry.callback), entry.callback.done_receiver())
        };
        let finished = match util::deadline(timeout_ms) {
            Some(at) => tokio::time::timeout_at(at, done.wait_for(|done| *done))
                .await
                .is_ok(),
            None => {
                let _ = done.wait_for(|done| *done).await;
                true
            }
        };
        if finished {
            self.inner.copies.remove(copy_identifier);
            Ok(self.terminal_copy_status(copy_identifier, &callback))
        } else {
            Ok(CopyStatus::new(
                copy_identifier,
                CopyState::Running,
                callback.bytes_to_copy(),
                callback.bytes_copied(),
                None,
            ))
        }
    }

    /// Cancel a copy and wait for it to wind down. The copy is forgotten;
    /// subsequent lookups raise `NoSuchCopy`.
    pub async fn cancel(&self, copy_identifier: &str) -> Result<CopyStatus> {
        let entry = self
            .inner
            .copies
            .remove(copy_identifier)
            .ok_or_else(|| self.no_such_copy(copy_identifier))?;
        entry.callback.cancel();
        if !entry.callback.has_begun() {
            // Still queued behind other copies; resolve it here, the worker
            // will skip it.
            entry.callback.finish(Err(self.copy_cancelled_error()));
        }
        let mut done = entry.callback.done_receiver();
        let _ = done.wait_for(|done| *done).await;
        Ok(self.terminal_copy_status(copy_identifier, &entry.callback))
    }

    fn terminal_copy_status(&self, copy_identifier: &str, callback: &CopyCallback) -> CopyStatus {
        let (state, error) = match callback.finish_result() {
            Some(None) => (CopyState::Done, None),
            Some(Some(error)) => (CopyState::Failed, Some(error)),
            None => (
                CopyState::Failed,
                Some(Arc::new(
                    self.err(ErrorKind::Internal, "copy finished without an outcome"),
                )),
            ),
        };
        CopyStatus::new(
            copy_identifier,
            state,
            callback.bytes_to_copy(),
            callback.bytes_copied(),
            error,
        )
    }

    fn no_such_copy(&self, copy_identifier: &str) -> Error {
        self.err(
            ErrorKind::NoSuchCopy,
            format!("copy not found: {copy_identifier}"),
        )
    }

    pub(crate) fn copy_cancelled_error(&self) -> Error {
        self.err(ErrorKind::CopyCancelled, "copy cancelled by user")
    }

    pub(crate) async fn perform_copy(
        &self,
        source: &Path,
        destination_fs: &FileSystem,
        destination: &Path,
        mode: CopyMode,
        recursive: bool,
        callback: &CopyCallback,
    ) -> Result<()> {
        if !self.inner.port.exists(source).await? {
            return Err(self.err(ErrorKind::NoSuchPath, format!("no such path: {source}")));
        }
        let attributes = self.inner.port.get_attributes(source).await?;

        if attributes.regular {
            return self
                .copy_file(source, destination_fs, destination, mode, callback)
                .await;
        }

        if attributes.symbolic_link {
            return self
                .copy_symbolic_link(source, destination_fs, destination, mode)
                .await;
        }

        if !attributes.directory {
            return Err(self.err(
                ErrorKind::InvalidPath,
                format!("source path is not a file, link or directory: {source}"),
            ));
        }

        if !recursive {
            return Err(self.err(
                ErrorKind::InvalidPath,
                format!("source path is a directory: {source}"),
            ));
        }

        // The source is a directory; settle the type of the destination
        // before walking.
        if destination_fs.exists(destination).await? {
            match mode {
                CopyMode::Create => {
                    return Err(self.err(
                        ErrorKind::PathAlreadyExists,
                        format!("destination path already exists: {destination}"),
                    ));
                }
                CopyMode::Ignore => return Ok(()),
                CopyMode::Replace => {}
            }
            let dest_attributes = destination_fs.get_attributes(destination).await?;
            if dest_attributes.regular || dest_attributes.symbolic_link {
                destination_fs.delete(destination, false).await?;
                destination_fs.create_directory(destination).await?;
            } else if !dest_attributes.directory {
                return Err(self.err(
                    ErrorKind::InvalidPath,
                    format!("existing destination is not a file, link or directory: {destination}"),
                ));
            }
        } else {
            destination_fs.create_directory(destination).await?;
        }

        self.copy_recursive(source, destination_fs, destination, mode, callback)
            .await
    }

    /// Copy one regular file. Back-ends with a native cross-copy take over
    /// via [`FileSystemPort::third_party_copy`](super::FileSystemPort::third_party_copy);
    /// otherwise the data is streamed through a fixed-size buffer with
    /// per-block progress and cancellation checks.
    pub(crate) async fn copy_file(
        &self,
        source: &Path,
        destination_fs: &FileSystem,
        destination: &Path,
        mode: CopyMode,
        callback: &CopyCallback,
    ) -> Result<()> {
        let attributes = self.inner.port.get_attributes(source).await?;
        if !attributes.regular {
            return Err(self.err(
                ErrorKind::InvalidPath,
                format!("source is not a regular file: {source}"),
            ));
        }

        destination_fs
            .assert_parent_directory_exists(destination)
            .await?;

        if destination_fs.exists(destination).await? {
            match mode {
                CopyMode::Create => {
                    return Err(self.err(
                        ErrorKind::PathAlreadyExists,
                        format!("destination path already exists: {destination}"),
                    ));
                }
                CopyMode::Ignore => return Ok(()),
                CopyMode::Replace => destination_fs.delete(destination, true).await?,
            }
        }

        if callback.is_cancelled() {
            return Err(self.copy_cancelled_error());
        }

        if self
            .inner
            .port
            .third_party_copy(source, destination_fs, destination, mode)
            .await?
        {
            return Ok(());
        }

        let mut reader = self.inner.port.read_from_file(source).await?;
        let mut writer = destination_fs
            .inner
            .port
            .write_to_file(destination, Some(attributes.size))
            .await?;
        self.stream_copy(reader.as_mut(), writer.as_mut(), callback)
            .await
    }

    /// Copy a symbolic link by recreating it on the destination. The link
    /// target is carried over verbatim; it is not dereferenced.
    pub(crate) async fn copy_symbolic_link(
        &self,
        source: &Path,
        destination_fs: &FileSystem,
        destination: &Path,
        mode: CopyMode,
    ) -> Result<()> {
        let attributes = self.inner.port.get_attributes(source).await?;
        if !attributes.symbolic_link {
            return Err(self.err(
                ErrorKind::InvalidPath,
                format!("source is not a symbolic link: {source}"),
            ));
        }

        destination_fs
            .assert_parent_directory_exists(destination)
            .await?;

        if destination_fs.exists(destination).await? {
            match mode {
                CopyMode::Create => {
                    return Err(self.err(
                        ErrorKind::PathAlreadyExists,
                        format!("destination path already exists: {destination}"),
                    ));
                }
                CopyMode::Ignore => return Ok(()),
                CopyMode::Replace => destination_fs.delete(destination, false).await?,
            }
        }

        let target = self.inner.port.read_symbolic_link(source).await?;
        destination_fs
            .inner
            .port
            .create_symbolic_link(destination, &target)
            .await
    }

    /// Copy data between two streams in `buffer_size` blocks, reporting
    /// progress after every block and honoring cancellation between blocks.
    async fn stream_copy(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        callback: &CopyCallback,
    ) -> Result<()> {
        let mut buffer = vec![0u8; self.buffer_size()];
        loop {
            let size = reader
                .read(&mut buffer)
                .await
                .map_err(|e| Error::from_io(self.adaptor_name(), "stream copy failed", e))?;
            if size == 0 {
                break;
            }
            writer
                .write_all(&buffer[..size])
                .await
                .map_err(|e| Error::from_io(self.adaptor_name(), "stream copy failed", e))?;
            callback.add_bytes_copied(size as u64);
            if callback.is_cancelled() {
                return Err(self.copy_cancelled_error());
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| Error::from_io(self.adaptor_name(), "stream copy failed", e))
    }

    /// Walk an existing source directory into an existing destination
    /// directory in two passes: first create the subdirectory skeleton and
    /// total the bytes to copy, then stream each regular file to its
    /// relative location. Cancellation is honored between every entry.
    async fn copy_recursive(
        &self,
        source: &Path,
        destination_fs: &FileSystem,
        destination: &Path,
        mode: CopyMode,
        callback: &CopyCallback,
    ) -> Result<()> {
        let listing = self.list(source, true).await?;

        let mut bytes_to_copy = 0u64;
        for entry in &listing {
            if callback.is_cancelled() {
                return Err(self.copy_cancelled_error());
            }
            if entry.directory && !is_dot_or_dotdot(&entry.path) {
                let relative = self.relative_to(source, &entry.path)?;
                let target = destination.resolve(&relative);
                if destination_fs.exists(&target).await? {
                    if destination_fs.get_attributes(&target).await?.directory {
                        match mode {
                            CopyMode::Create => {
                                return Err(self.err(
                                    ErrorKind::PathAlreadyExists,
                                    format!("directory already exists: {target}"),
                                ));
                            }
                            CopyMode::Replace => {}
                            CopyMode::Ignore => return Ok(()),
                        }
                    } else {
                        destination_fs.delete(&target, true).await?;
                        destination_fs.create_directories(&target).await?;
                    }
                } else {
                    destination_fs.create_directories(&target).await?;
                }
            } else if entry.regular {
                bytes_to_copy += entry.size;
            }
        }

        callback.start(bytes_to_copy);

        for entry in &listing {
            if callback.is_cancelled() {
                return Err(self.copy_cancelled_error());
            }
            if entry.regular {
                let relative = self.relative_to(source, &entry.path)?;
                let target = destination.resolve(&relative);
                self.copy_file(&entry.path, destination_fs, &target, mode, callback)
                    .await?;
            }
        }

        Ok(())
    }

    fn relative_to(&self, base: &Path, path: &Path) -> Result<Path> {
        base.relativize(path).ok_or_else(|| {
            self.err(
                ErrorKind::Internal,
                format!("listed entry {path} is not below {base}"),
            )
        })
    }
}
