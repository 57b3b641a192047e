//! Chunked upload store.
//!
//! Uploads are written to `.part` files addressed by
//! `(projectId, sessionId, uploadId)` and promoted with an atomic rename
//! once all declared bytes arrived. A `.part` file whose handle is dropped
//! without promotion is removed, so a connection dying mid-upload leaves
//! nothing behind. Write slots are a global semaphore; an exhausted quota is
//! reported to the peer instead of closing the connection.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt as _;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use uuid::Uuid;

use homelink_types::messages::FileDescriptor;

use super::StoreError;
use crate::metrics::METRICS_ID_UPLOAD_BYTES;

/// Why an upload could not be started.
#[derive(Debug, thiserror::Error)]
pub enum BeginUploadError {
    /// The declared size exceeds the per-upload quota.
    #[error("quota_exceeded")]
    QuotaExceeded,
    /// All write slots are taken.
    #[error("no_upload_slot")]
    Busy,
    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

struct Inner {
    root: PathBuf,
    quota_bytes: u64,
    slots: Arc<Semaphore>,
}

/// Shared handle to the upload store. Cheap to clone.
#[derive(Clone)]
pub struct UploadStore(Arc<Inner>);

impl UploadStore {
    /// Creates the store rooted at `root`.
    pub fn new(root: PathBuf, quota_bytes: u64, slots: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self(Arc::new(Inner {
            root,
            quota_bytes,
            slots: Arc::new(Semaphore::new(slots)),
        })))
    }

    /// Allocates a write slot and creates the `.part` file.
    pub async fn begin(
        &self,
        project_id: &str,
        session_id: &str,
        upload_id: Uuid,
        size: u64,
    ) -> Result<PartUpload, BeginUploadError> {
        if size > self.0.quota_bytes {
            return Err(BeginUploadError::QuotaExceeded);
        }
        let permit = match Arc::clone(&self.0.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(BeginUploadError::Busy),
            Err(TryAcquireError::Closed) => return Err(BeginUploadError::Busy),
        };

        let dir = self
            .0
            .root
            .join(sanitize(project_id))
            .join(sanitize(session_id));
        tokio::fs::create_dir_all(&dir).await?;
        let part_path = dir.join(format!("{upload_id}.part"));
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&part_path)
            .await?;
        Ok(PartUpload {
            file,
            part_path,
            dir,
            project_id: project_id.to_owned(),
            session_id: session_id.to_owned(),
            upload_id,
            promoted: false,
            _permit: permit,
        })
    }
}

/// An in-flight upload holding a write slot.
#[derive(Debug)]
pub struct PartUpload {
    file: tokio::fs::File,
    part_path: PathBuf,
    dir: PathBuf,
    project_id: String,
    session_id: String,
    upload_id: Uuid,
    promoted: bool,
    _permit: OwnedSemaphorePermit,
}

impl PartUpload {
    /// Appends one chunk. Callers guarantee offsets are sequential.
    pub async fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data).await?;
        ::metrics::counter!(METRICS_ID_UPLOAD_BYTES).increment(data.len() as u64);
        Ok(())
    }

    /// Flushes and atomically renames the `.part` file to its final name,
    /// returning the descriptor handed back to the application.
    pub async fn promote(
        mut self,
        filename: &str,
        mime_type: &str,
        size: u64,
    ) -> Result<FileDescriptor, StoreError> {
        self.file.sync_all().await?;
        let final_name = format!("{}-{}", self.upload_id, sanitize(filename));
        let final_path = self.dir.join(&final_name);
        tokio::fs::rename(&self.part_path, &final_path).await?;
        self.promoted = true;
        Ok(FileDescriptor {
            id: self.upload_id,
            project_id: self.project_id.clone(),
            session_id: self.session_id.clone(),
            filename: filename.to_owned(),
            size,
            mime_type: mime_type.to_owned(),
            path: format!(
                "{}/{}/{}",
                sanitize(&self.project_id),
                sanitize(&self.session_id),
                final_name
            ),
        })
    }
}

impl Drop for PartUpload {
    fn drop(&mut self) {
        if !self.promoted {
            if let Err(err) = std::fs::remove_file(&self.part_path) {
                tracing::debug!("could not remove {:?}: {err}", self.part_path);
            }
        }
    }
}

/// Keeps the final path component and strips separators; ids and filenames
/// come from the peer.
fn sanitize(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .filter(|component| !component.is_empty() && *component != "." && *component != "..")
        .unwrap_or("unnamed");
    base.to_owned()
}
