//! The copy task: one chunk of a long-running peer-to-peer file copy per
//! `execute` call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{RemoteFile, TaskContext, TaskHandler, TaskKind, TaskStatus};
use crate::error::Result;
use crate::volume::{name_and_parent, FileInfo, FileType};

/// The persisted, JSON-encoded state of a copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyPayload {
    pub source: RemoteFile,
    pub target: RemoteFile,
    pub offset: i64,
    pub error: String,
}

/// Copies `source` to `target` one buffer-sized chunk at a time. The
/// source is always read through the engine's own [`VolumeManager`]; the
/// target is always written through the [`PeerClient`](crate::peer::PeerClient),
/// even when target and source share a host, no same-host short-circuit.
pub struct CopyTask {
    status: TaskStatus,
    payload: CopyPayload,
}

impl CopyTask {
    pub fn new(source: RemoteFile, target: RemoteFile) -> CopyTask {
        CopyTask { status: TaskStatus::Waiting, payload: CopyPayload { source, target, offset: 0, error: String::new() } }
    }

    pub(crate) fn from_payload(status: TaskStatus, bytes: &[u8]) -> Result<CopyTask> {
        let payload: CopyPayload = serde_json::from_slice(bytes)?;
        Ok(CopyTask { status, payload })
    }
}

/// Metadata for the directory component of `vp`, synthesized well enough
/// for the target's own ancestor-creation pass to accept.
fn directory_info(vp: &str) -> FileInfo {
    let (name, parent) = name_and_parent(vp);
    let parent_path = if parent.ends_with(':') { format!("{parent}/") } else { parent };
    FileInfo { name, virtual_path: vp.to_string(), file_type: FileType::Directory, size: 0, parent_path }
}

#[async_trait]
impl TaskHandler for CopyTask {
    fn status(&self) -> TaskStatus {
        self.status
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Copy
    }

    fn payload(&self) -> Vec<u8> {
        serde_json::to_vec(&self.payload).expect("copy payload is always json-serializable")
    }

    async fn init(&mut self, _ctx: &TaskContext) -> Result<()> {
        self.status = TaskStatus::Waiting;
        Ok(())
    }

    async fn before_execute(&mut self, _ctx: &TaskContext) -> Result<()> {
        self.status = TaskStatus::Running;
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let result = self.execute_chunk(ctx).await;
        if let Err(err) = &result {
            self.status = TaskStatus::Failed;
            self.payload.error = err.to_string();
        }
        result
    }

    async fn after_execute(&mut self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
    }

    async fn cleanup_cancelled(&self, ctx: &TaskContext) -> Result<()> {
        match ctx.peer_client.remove(&self.payload.target.peer, &self.payload.target.virtual_path).await {
            Ok(()) => Ok(()),
            Err(crate::error::NetfsError::FileNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl CopyTask {
    async fn execute_chunk(&mut self, ctx: &TaskContext) -> Result<()> {
        let parent_vp = name_and_parent(&self.payload.target.virtual_path).1;
        ctx.peer_client.create(&self.payload.target.peer, &directory_info(&parent_vp)).await?;

        let volume = ctx.volumes.volume(&self.payload.source.virtual_path)?;
        let buffer = volume.read(&self.payload.source.virtual_path, self.payload.offset, ctx.buffer_size as i64).await?;

        ctx.peer_client.write(&self.payload.target.peer, &self.payload.target.virtual_path, &buffer).await?;
        self.payload.offset += buffer.len() as i64;

        if (buffer.len() as u64) < ctx.buffer_size {
            self.status = TaskStatus::Completed;
        } else {
            self.status = TaskStatus::Waiting;
        }
        Ok(())
    }
}
