//! The server: wires the transport, record store, volume manager and task
//! engine together, registers the endpoint table, and owns the process
//! lifecycle: signals, graceful stop.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::{Config, VolumePerm};
use crate::error::{NetfsError, Result};
use crate::network::{Network, Peer};
use crate::peer::PeerClient;
use crate::record::Store;
use crate::task::{CopyHandle, CopyTask, RemoteFile, Task, TaskContext, TaskEngine, TaskStatus};
use crate::transport::{Handler, Receiver, Request, Response, Sender};
use crate::volume::{FileInfo, Perm, VolumeManager};

pub const EP_SERVER_HOST: &str = "/netfs/api/server/host";
pub const EP_SERVER_STOP: &str = "/netfs/api/server/stop";
pub const EP_FILE_INFO: &str = "/netfs/api/file/info";
pub const EP_FILE_CHILDREN: &str = "/netfs/api/file/children";
pub const EP_FILE_CREATE: &str = "/netfs/api/file/create";
pub const EP_FILE_WRITE: &str = "/netfs/api/file/write";
pub const EP_FILE_REMOVE: &str = "/netfs/api/file/remove";
pub const EP_FILE_COPY_START: &str = "/netfs/api/file/copy/start";
pub const EP_FILE_COPY_STATUS: &str = "/netfs/api/file/copy/status";
pub const EP_FILE_COPY_CANCEL: &str = "/netfs/api/file/copy/cancel";

fn volume_perm(perms: &[VolumePerm]) -> Perm {
    perms.iter().fold(Perm::none(), |acc, p| acc.union(match p {
        VolumePerm::Read => Perm::READ,
        VolumePerm::Write => Perm::WRITE,
    }))
}

/// The composition root: owns every collaborator the endpoint handlers
/// need. There is no other global state, everything reachable from a
/// handler hangs off this struct.
pub struct Server {
    volumes: VolumeManager,
    tasks: Arc<TaskEngine>,
    receiver: Arc<dyn Receiver>,
    local_host: Peer,
    stop_signal: Arc<Notify>,
}

impl Server {
    /// Builds the server from configuration. Does not bind sockets or
    /// start any subsystem yet, see [`Server::serve`].
    pub fn new(config: &Config, receiver: Arc<dyn Receiver>, sender: Arc<dyn Sender>) -> Result<Server> {
        let local_host = Network::local_host()?;
        let store = Store::new();

        let volume_defs = config.volumes.iter().map(|v| (v.name.clone(), PathBuf::from(&v.os_path), volume_perm(&v.perm))).collect();
        let volumes = VolumeManager::new(store.clone(), volume_defs);

        let peer_client = Arc::new(PeerClient::new(sender));
        let task_ctx = TaskContext { volumes: volumes.clone(), peer_client, buffer_size: config.buffer_size };
        let tasks = TaskEngine::new(store, task_ctx, config.max_available_tasks, config.tasks_waiting_second);

        Ok(Server { volumes, tasks, receiver, local_host, stop_signal: Arc::new(Notify::new()) })
    }

    fn bind_handlers(&self) {
        let local_host = self.local_host.clone();
        self.receiver.bind(EP_SERVER_HOST, Arc::new(move |_req: Request| {
            let local_host = local_host.clone();
            async move { Response::json(local_host) }
        }));

        let local_host = self.local_host.clone();
        let stop_signal = self.stop_signal.clone();
        self.receiver.bind(EP_SERVER_STOP, Arc::new(move |req: Request| {
            let local_host = local_host.clone();
            let stop_signal = stop_signal.clone();
            async move { server_stop_handle(req, &local_host, &stop_signal) }
        }));

        let volumes = self.volumes.clone();
        self.receiver.bind(EP_FILE_INFO, Arc::new(move |req: Request| {
            let volumes = volumes.clone();
            async move { file_info_handle(req, &volumes) }
        }));

        let volumes = self.volumes.clone();
        self.receiver.bind(EP_FILE_CHILDREN, Arc::new(move |req: Request| {
            let volumes = volumes.clone();
            async move { file_children_handle(req, &volumes) }
        }));

        let volumes = self.volumes.clone();
        self.receiver.bind(EP_FILE_CREATE, Arc::new(move |req: Request| {
            let volumes = volumes.clone();
            async move { file_create_handle(req, &volumes).await }
        }));

        let volumes = self.volumes.clone();
        self.receiver.bind(EP_FILE_WRITE, Arc::new(move |req: Request| {
            let volumes = volumes.clone();
            async move { file_write_handle(req, &volumes).await }
        }));

        let volumes = self.volumes.clone();
        self.receiver.bind(EP_FILE_REMOVE, Arc::new(move |req: Request| {
            let volumes = volumes.clone();
            async move { file_remove_handle(req, &volumes).await }
        }));

        let tasks = self.tasks.clone();
        let local_host = self.local_host.clone();
        self.receiver.bind(EP_FILE_COPY_START, Arc::new(move |req: Request| {
            let tasks = tasks.clone();
            let local_host = local_host.clone();
            async move { file_copy_start_handle(req, &tasks, &local_host).await }
        }));

        let tasks = self.tasks.clone();
        let local_host = self.local_host.clone();
        self.receiver.bind(EP_FILE_COPY_STATUS, Arc::new(move |req: Request| {
            let tasks = tasks.clone();
            let local_host = local_host.clone();
            async move { file_copy_status_handle(req, &tasks, &local_host) }
        }));

        let tasks = self.tasks.clone();
        self.receiver.bind(EP_FILE_COPY_CANCEL, Arc::new(move |req: Request| {
            let tasks = tasks.clone();
            async move { file_copy_cancel_handle(req, &tasks).await }
        }));
    }

    /// Starts the subsystems in dependency order: transport receiver, then
    /// task engine. The record store is in-memory and needs no async start
    /// step of its own. Failures are joined, not fatal to the subsystems
    /// that did start, the caller decides whether to stop them.
    pub async fn start(&self) -> Result<()> {
        self.bind_handlers();

        let mut errors = Vec::new();
        if let Err(err) = self.receiver.start().await {
            error!(error = %err, "transport receiver failed to start");
            errors.push(err.to_string());
        }
        self.tasks.start();

        if errors.is_empty() {
            info!(host = %self.local_host.name, ip = %self.local_host.ip, "server is starting");
            Ok(())
        } else {
            Err(NetfsError::Startup(errors))
        }
    }

    /// Stops every subsystem in reverse order, best-effort.
    pub async fn stop(&self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(err) = self.tasks.stop().await {
            errors.push(err.to_string());
        }
        if let Err(err) = self.receiver.stop().await {
            errors.push(err.to_string());
        }

        info!("server is stopped");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetfsError::Startup(errors))
        }
    }

    /// Requests a graceful stop, as the `server/stop` handler and the
    /// process signal handlers both do.
    pub fn request_stop(&self) {
        self.stop_signal.notify_one();
    }

    /// Starts the server, installs SIGINT/SIGTERM handlers, and blocks
    /// until a stop is requested (by signal or by `server/stop`), then
    /// stops every subsystem. This is the server's whole owned lifecycle,
    /// an out-of-scope binary only needs to call this.
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;

        let signal_stop = self.stop_signal.clone();
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            signal_stop.notify_one();
        });

        self.stop_signal.notified().await;
        self.stop().await
    }

    pub fn local_host(&self) -> &Peer {
        &self.local_host
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler, only SIGINT will stop the server");
            std::future::pending().await
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn require_path(req: &Request) -> Result<String> {
    req.param("path").map(str::to_string).ok_or_else(|| NetfsError::MalformedVirtualPath(String::new()))
}

fn require_id(req: &Request) -> Result<u64> {
    req.param("id").and_then(|s| s.parse().ok()).ok_or(NetfsError::TaskNotFound(0))
}

/// Rejects a stop request unless it was observed arriving from this host.
/// An in-process callback request carries no source address and is
/// trusted, since it cannot have crossed the network.
fn server_stop_handle(req: Request, local_host: &Peer, stop_signal: &Notify) -> Result<Response> {
    let origin_ok = match req.source_ip() {
        None => true,
        Some(ip) => ip == local_host.ip || ip.is_loopback(),
    };

    if !origin_ok {
        return Err(NetfsError::Forbidden);
    }

    stop_signal.notify_one();
    Ok(Response::empty())
}

fn file_info_handle(req: Request, volumes: &VolumeManager) -> Result<Response> {
    let path = require_path(&req)?;
    let volume = volumes.volume(&path)?;
    let info = volume.info(&path)?;
    Response::json(info)
}

fn file_children_handle(req: Request, volumes: &VolumeManager) -> Result<Response> {
    let path = require_path(&req)?;
    let skip = req.param("skip").and_then(|s| s.parse().ok()).unwrap_or(0usize);
    let limit = req.param("limit").and_then(|s| s.parse().ok()).unwrap_or(usize::MAX);
    let volume = volumes.volume(&path)?;
    let children = volume.children(&path, skip, limit)?;
    Response::json(children)
}

async fn file_create_handle(req: Request, volumes: &VolumeManager) -> Result<Response> {
    let info: FileInfo = req.json_body()?;
    let volume = volumes.volume(&info.virtual_path)?;
    volume.create(&info).await?;
    Ok(Response::empty())
}

async fn file_write_handle(req: Request, volumes: &VolumeManager) -> Result<Response> {
    let path = require_path(&req)?;
    let volume = volumes.volume(&path)?;
    volume.write(&path, req.raw_body()).await?;
    Ok(Response::empty())
}

async fn file_remove_handle(req: Request, volumes: &VolumeManager) -> Result<Response> {
    let path = require_path(&req)?;
    let volume = volumes.volume(&path)?;
    volume.remove(&path).await?;
    Ok(Response::empty())
}

async fn file_copy_start_handle(req: Request, tasks: &TaskEngine, local_host: &Peer) -> Result<Response> {
    let (source, target): (RemoteFile, RemoteFile) = req.json_body()?;
    let id = tasks.submit(Task::new(Box::new(CopyTask::new(source, target)))).await?;
    Response::json(CopyHandle { id, status: TaskStatus::Waiting, host: local_host.clone() })
}

fn file_copy_status_handle(req: Request, tasks: &TaskEngine, local_host: &Peer) -> Result<Response> {
    let id = require_id(&req)?;
    let task = tasks.get(id)?;
    Response::json(CopyHandle { id, status: task.status(), host: local_host.clone() })
}

async fn file_copy_cancel_handle(req: Request, tasks: &TaskEngine) -> Result<Response> {
    let id = require_id(&req)?;
    tasks.cancel(id).await?;
    Ok(Response::empty())
}
