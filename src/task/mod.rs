//! The task engine: submits, persists, schedules, executes and cancels
//! long-running tasks. Copy is the only task kind today; the kind is a
//! tagged variant rather than a class hierarchy, so adding a second kind
//! means adding an arm to [`TaskKind`] and [`decode_handler`], not a new
//! trait hierarchy.
//!
//! Persistence model: a task that is `Running` in memory stays `Waiting`
//! on disk. The scheduler tracks which rows are currently leased out to a
//! worker in-process and excludes those from its own `Waiting` query, so a
//! row is never picked up twice while leased. Nothing is ever persisted as
//! `Running`, so there is no stale-`Running` row to demote on restart.

pub mod copy;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_channel::TryRecvError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use copy::CopyTask;

use crate::error::{NetfsError, Result};
use crate::network::Peer;
use crate::peer::PeerClient;
use crate::record::{eq, id as id_cond, Limit, Record, Store, Table};
use crate::volume::VolumeManager;

/// Name of the `task` table in the Record Store.
pub const TASK_TABLE: &str = "task";

const F_STATUS: usize = 0;
const F_KIND: usize = 1;
const F_PAYLOAD: usize = 2;

/// A task's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are never re-scheduled.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    fn to_byte(self) -> u8 {
        match self {
            TaskStatus::Waiting => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed => 2,
            TaskStatus::Failed => 3,
            TaskStatus::Cancelled => 4,
        }
    }

    fn from_byte(byte: u8) -> TaskStatus {
        match byte {
            1 => TaskStatus::Running,
            2 => TaskStatus::Completed,
            3 => TaskStatus::Failed,
            4 => TaskStatus::Cancelled,
            _ => TaskStatus::Waiting,
        }
    }
}

/// The `type` tag of a persisted task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Copy,
}

impl TaskKind {
    fn to_byte(self) -> u8 {
        match self {
            TaskKind::Copy => 0,
        }
    }

    fn from_byte(byte: u8) -> Result<TaskKind> {
        match byte {
            0 => Ok(TaskKind::Copy),
            other => Err(NetfsError::UnknownTaskType(other)),
        }
    }
}

/// A file identified by the peer that owns it and its virtual path.
///
/// Carried symmetrically on both sides of a copy, but the engine only
/// ever reads a `source` through its own [`VolumeManager`]:
/// `source.peer` is accepted for API symmetry and for a future
/// multi-hop copy, not dereferenced during execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub peer: Peer,
    pub virtual_path: String,
}

/// The `{id, status, host}` triple returned by the copy endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyHandle {
    pub id: u64,
    pub status: TaskStatus,
    pub host: Peer,
}

/// Dependencies a task needs to run a chunk: local volume access for
/// reads, a peer client for remote writes, and the configured chunk size.
#[derive(Clone)]
pub struct TaskContext {
    pub volumes: VolumeManager,
    pub peer_client: Arc<PeerClient>,
    pub buffer_size: u64,
}

/// Polymorphic task behaviour: `init`/`before_execute`/`execute`/
/// `after_execute`/`mark_cancelled`/`cleanup_cancelled`, implemented per
/// tagged variant rather than via a class hierarchy. Object-safe so the
/// engine can hold `Box<dyn TaskHandler>` uniformly across kinds.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn status(&self) -> TaskStatus;
    fn kind(&self) -> TaskKind;
    fn payload(&self) -> Vec<u8>;

    /// Transitions to `Waiting`. Called once, at submission.
    async fn init(&mut self, ctx: &TaskContext) -> Result<()>;
    /// Transitions to `Running` in memory. Never persisted.
    async fn before_execute(&mut self, ctx: &TaskContext) -> Result<()>;
    /// Runs exactly one chunk, updating status to `Waiting`, `Completed`
    /// or `Failed`.
    async fn execute(&mut self, ctx: &TaskContext) -> Result<()>;
    /// Runs exactly once per submission, on any terminal state.
    async fn after_execute(&mut self, ctx: &TaskContext) -> Result<()>;
    /// Transitions to `Cancelled` in memory. No side effects: a worker may
    /// still be executing a leased chunk, so any compensating cleanup runs
    /// separately, once that can no longer be the case.
    fn mark_cancelled(&mut self);
    /// Performs the compensating cleanup for a cancelled task, e.g. removing
    /// a partially-written target. Only called once no worker can still be
    /// writing on the task's behalf.
    async fn cleanup_cancelled(&self, ctx: &TaskContext) -> Result<()>;
}

/// A task together with its persisted identity.
pub struct Task {
    id: u64,
    handler: Box<dyn TaskHandler>,
}

impl Task {
    pub fn new(handler: Box<dyn TaskHandler>) -> Task {
        Task { id: 0, handler }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.handler.status()
    }
}

fn decode_handler(kind: TaskKind, status: TaskStatus, payload: &[u8]) -> Result<Box<dyn TaskHandler>> {
    match kind {
        TaskKind::Copy => Ok(Box::new(CopyTask::from_payload(status, payload)?)),
    }
}

fn task_from_record(record: &Record) -> Result<Task> {
    let status = TaskStatus::from_byte(record.field(F_STATUS).first().copied().unwrap_or(0));
    let kind = TaskKind::from_byte(record.field(F_KIND).first().copied().unwrap_or(0))?;
    let handler = decode_handler(kind, status, record.field(F_PAYLOAD))?;
    Ok(Task { id: record.record_id(), handler })
}

fn task_to_record(task: &Task, table: &Table) -> Record {
    let id = if task.id == 0 { table.next_id() } else { task.id };
    let mut record = Record::new(3);
    record.set_record_id(id);
    record.set_field(F_STATUS, vec![task.handler.status().to_byte()]);
    record.set_field(F_KIND, vec![task.handler.kind().to_byte()]);
    record.set_field(F_PAYLOAD, task.handler.payload());
    record
}

/// Submits, persists, schedules, executes and cancels tasks.
///
/// A single supervising loop (spawned by [`TaskEngine::start`]) owns the
/// decision to start work; each started task runs on its own tokio task
/// and reports back over a completion channel. The supervisor never
/// blocks on task work except by awaiting that channel.
pub struct TaskEngine {
    store: Store,
    ctx: TaskContext,
    max_available_tasks: u16,
    tasks_waiting: Duration,
    cancelled: Arc<AtomicBool>,
    leased: StdMutex<HashSet<u64>>,
    join: StdMutex<Option<JoinHandle<()>>>,
}

impl TaskEngine {
    pub fn new(store: Store, ctx: TaskContext, max_available_tasks: u16, tasks_waiting_second: u64) -> Arc<TaskEngine> {
        Arc::new(TaskEngine {
            store,
            ctx,
            max_available_tasks,
            tasks_waiting: Duration::from_secs(tasks_waiting_second),
            cancelled: Arc::new(AtomicBool::new(false)),
            leased: StdMutex::new(HashSet::new()),
            join: StdMutex::new(None),
        })
    }

    fn table(&self) -> Arc<Table> {
        self.store.table(TASK_TABLE)
    }

    fn is_leased(&self, id: u64) -> bool {
        self.leased.lock().expect("task engine leased lock poisoned").contains(&id)
    }

    /// Initializes the task, persists it (allocating an id if this is a
    /// new submission), and returns the assigned id. No partial state is
    /// observable if any step fails.
    pub async fn submit(&self, mut task: Task) -> Result<u64> {
        task.handler.init(&self.ctx).await?;
        let table = self.table();
        let record = task_to_record(&task, &table);
        table.set(record.clone());
        info!(task_id = record.record_id(), "task is waiting");
        Ok(record.record_id())
    }

    /// Decodes the persisted row for `id`.
    pub fn get(&self, id: u64) -> Result<Task> {
        let rows = self.table().get(&[id_cond(id)], Some(Limit(1)));
        let record = rows.first().ok_or(NetfsError::TaskNotFound(id))?;
        task_from_record(record)
    }

    /// Cancels a task. A no-op on a terminal task. Always writes `Cancelled`
    /// to the row immediately. On a task currently leased to a running
    /// worker, the compensating cleanup (e.g. removing a partially-written
    /// target) is deferred to [`TaskEngine::drain_completed`], once the
    /// worker's in-flight chunk has actually finished: running it here
    /// would race the worker's own `write`, which can land after the
    /// cleanup and resurrect the target. A task that isn't leased has no
    /// worker left to race, so its cleanup runs right away, since nothing
    /// will ever drain it once it's no longer `Waiting`.
    pub async fn cancel(&self, id: u64) -> Result<()> {
        let mut task = self.get(id)?;
        if task.status().is_terminal() {
            return Ok(());
        }

        task.handler.mark_cancelled();
        let table = self.table();
        table.set(task_to_record(&task, &table));

        if self.is_leased(id) {
            debug!(task_id = id, "task is leased, deferring cleanup to drain");
        } else {
            task.handler.cleanup_cancelled(&self.ctx).await?;
        }

        info!(task_id = id, "task is cancelled");
        Ok(())
    }

    /// Starts the supervising loop. Non-blocking.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run().await });
        *self.join.lock().expect("task engine join lock poisoned") = Some(handle);
        info!("task engine is starting");
    }

    /// Signals the loop to stop taking new work and waits until every
    /// leased task has drained.
    pub async fn stop(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        let handle = self.join.lock().expect("task engine join lock poisoned").take();
        if let Some(handle) = handle {
            handle.await.map_err(|err| NetfsError::Startup(vec![err.to_string()]))?;
        }
        info!("task engine is stopped");
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let table = self.table();
        let (complete_tx, complete_rx) = async_channel::bounded::<Task>(self.max_available_tasks as usize + 1);
        let mut available = self.max_available_tasks;

        loop {
            match complete_rx.try_recv() {
                Ok(mut task) => {
                    self.drain_completed(&table, &mut task).await;
                    self.leased.lock().expect("task engine leased lock poisoned").remove(&task.id);
                    available += 1;
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Closed) => {}
            }

            let cancelled = self.cancelled.load(Ordering::SeqCst);
            if !cancelled && available > 0 {
                let leased_count = self.leased.lock().expect("task engine leased lock poisoned").len();
                let fetch_limit = available as i64 + leased_count as i64;
                let rows = table.get(&[eq(F_STATUS, vec![TaskStatus::Waiting.to_byte()])], Some(Limit(fetch_limit)));
                let pickable: Vec<Record> = {
                    let leased = self.leased.lock().expect("task engine leased lock poisoned");
                    rows.into_iter().filter(|r| !leased.contains(&r.record_id())).collect()
                };

                if pickable.is_empty() && available == self.max_available_tasks {
                    tokio::time::sleep(self.tasks_waiting).await;
                } else {
                    for row in pickable.into_iter().take(available as usize) {
                        let mut task = match task_from_record(&row) {
                            Ok(task) => task,
                            Err(err) => {
                                error!(error = %err, "task decode failed, skipping row");
                                continue;
                            }
                        };

                        self.leased.lock().expect("task engine leased lock poisoned").insert(task.id);
                        if let Err(err) = task.handler.before_execute(&self.ctx).await {
                            error!(task_id = task.id, error = %err, "before-execute failed");
                            self.leased.lock().expect("task engine leased lock poisoned").remove(&task.id);
                            continue;
                        }

                        available -= 1;
                        debug!(task_id = task.id, "task is running");

                        let ctx = self.ctx.clone();
                        let tx = complete_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = task.handler.execute(&ctx).await {
                                warn!(task_id = task.id, error = %err, "task execution error");
                            }
                            let _ = tx.send(task).await;
                        });
                    }
                }
            } else if !complete_rx.is_empty() {
                // a completion is already waiting, loop straight back to it
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            if cancelled && available == self.max_available_tasks {
                break;
            }
        }
    }

    /// Runs `after_execute` and persists the worker's result, unless the
    /// row was cancelled out-of-band while the worker was in flight, in
    /// which case the disk `Cancelled` status wins and the compensating
    /// cleanup `cancel` deferred now runs, since the worker that could have
    /// raced it has just finished.
    async fn drain_completed(&self, table: &Table, task: &mut Task) {
        if let Err(err) = task.handler.after_execute(&self.ctx).await {
            error!(task_id = task.id, error = %err, "after-execute failed");
        }

        let current = table.get(&[id_cond(task.id)], Some(Limit(1)));
        let already_cancelled = current.first().map(|r| TaskStatus::from_byte(r.field(F_STATUS).first().copied().unwrap_or(0))) == Some(TaskStatus::Cancelled);

        if already_cancelled {
            debug!(task_id = task.id, "task was cancelled while in flight, running deferred cleanup");
            if let Err(err) = task.handler.cleanup_cancelled(&self.ctx).await {
                error!(task_id = task.id, error = %err, "cancelled-task cleanup failed");
            }
            return;
        }

        table.set(task_to_record(task, table));
        info!(task_id = task.id, status = ?task.status(), "task chunk completed");
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::transport::callback::CallbackNetwork;
    use crate::transport::Receiver;
    use crate::volume::Perm;

    fn peer(ip: &str) -> Peer {
        Peer { name: "peer".into(), ip: ip.parse::<Ipv4Addr>().unwrap() }
    }

    fn context(buffer_size: u64) -> (TaskContext, Store, CallbackNetwork) {
        let network = CallbackNetwork::new();
        let peer_client = Arc::new(PeerClient::new(Arc::new(network.sender())));
        let store = Store::new();
        let volumes = VolumeManager::new(store.clone(), vec![]);
        (TaskContext { volumes, peer_client, buffer_size }, store, network)
    }

    fn bind_volume_endpoints(network: &CallbackNetwork, ip: Ipv4Addr, volumes: VolumeManager) {
        let receiver = network.receiver(ip);
        let v = volumes.clone();
        receiver.bind(
            "/netfs/api/file/create",
            Arc::new(move |req: crate::transport::Request| {
                let v = v.clone();
                async move {
                    let info: crate::volume::FileInfo = req.json_body()?;
                    let vol = v.volume(&info.virtual_path)?;
                    vol.create(&info).await?;
                    crate::transport::Response::json(())
                }
            }),
        );
        let v = volumes.clone();
        receiver.bind(
            "/netfs/api/file/write",
            Arc::new(move |req: crate::transport::Request| {
                let v = v.clone();
                async move {
                    let path = req.param("path").unwrap_or_default().to_string();
                    let vol = v.volume(&path)?;
                    vol.write(&path, req.raw_body()).await?;
                    crate::transport::Response::json(())
                }
            }),
        );
        let v = volumes.clone();
        receiver.bind(
            "/netfs/api/file/remove",
            Arc::new(move |req: crate::transport::Request| {
                let v = v.clone();
                async move {
                    let path = req.param("path").unwrap_or_default().to_string();
                    let vol = v.volume(&path)?;
                    vol.remove(&path).await?;
                    crate::transport::Response::json(())
                }
            }),
        );
    }

    #[tokio::test]
    async fn submit_then_get_round_trips_waiting_status() {
        let (ctx, store, _network) = context(10);
        let engine = TaskEngine::new(store, ctx, 1, 1);

        let source = RemoteFile { peer: peer("10.0.0.1"), virtual_path: "root:/src".into() };
        let target = RemoteFile { peer: peer("10.0.0.2"), virtual_path: "root:/dst".into() };
        let id = engine.submit(Task::new(Box::new(CopyTask::new(source, target)))).await.unwrap();

        let task = engine.get(id).unwrap();
        assert_eq!(task.status(), TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn copy_completes_after_scheduler_drives_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();

        let source_store = Store::new();
        let source_volumes = VolumeManager::new(source_store, vec![("root".to_string(), dir.path().to_path_buf(), Perm::READ.union(Perm::WRITE))]);
        let source_vol = source_volumes.volume("root:/src").unwrap();
        source_vol
            .create(&crate::volume::FileInfo {
                name: "src".into(),
                virtual_path: "root:/src".into(),
                file_type: crate::volume::FileType::File,
                size: 0,
                parent_path: "root:/".into(),
            })
            .await
            .unwrap();
        source_vol.write("root:/src", &[1u8; 25]).await.unwrap();

        let target_store = Store::new();
        let target_volumes = VolumeManager::new(target_store, vec![("root".to_string(), target_dir.path().to_path_buf(), Perm::READ.union(Perm::WRITE))]);

        let network = CallbackNetwork::new();
        let target_ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
        bind_volume_endpoints(&network, target_ip, target_volumes.clone());

        let peer_client = Arc::new(PeerClient::new(Arc::new(network.sender())));
        let ctx = TaskContext { volumes: source_volumes, peer_client, buffer_size: 10 };
        let engine_store = Store::new();
        let engine = TaskEngine::new(engine_store, ctx, 1, 1);

        let source = RemoteFile { peer: peer("10.0.0.1"), virtual_path: "root:/src".into() };
        let target = RemoteFile { peer: peer("10.0.0.2"), virtual_path: "root:/dst".into() };
        let id = engine.submit(Task::new(Box::new(CopyTask::new(source, target)))).await.unwrap();

        engine.start();
        let mut attempts = 0;
        loop {
            let task = engine.get(id).unwrap();
            if task.status().is_terminal() || attempts > 200 {
                assert_eq!(task.status(), TaskStatus::Completed);
                break;
            }
            attempts += 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.stop().await.unwrap();

        let target_vol = target_volumes.volume("root:/dst").unwrap();
        let written = target_vol.read("root:/dst", 0, 100).await.unwrap();
        assert_eq!(written, vec![1u8; 25]);
    }

    #[tokio::test]
    async fn cancel_of_terminal_task_is_a_no_op() {
        let (ctx, store, _network) = context(10);
        let engine = TaskEngine::new(store, ctx, 1, 1);

        let source = RemoteFile { peer: peer("10.0.0.1"), virtual_path: "root:/src".into() };
        let target = RemoteFile { peer: peer("10.0.0.2"), virtual_path: "root:/dst".into() };
        let id = engine.submit(Task::new(Box::new(CopyTask::new(source, target)))).await.unwrap();

        // Force-complete it directly on the row to simulate a terminal task.
        let table = engine.table();
        let mut record = table.get(&[id_cond(id)], Some(Limit(1))).remove(0);
        record.set_field(F_STATUS, vec![TaskStatus::Completed.to_byte()]);
        table.set(record);

        engine.cancel(id).await.unwrap();
        assert_eq!(engine.get(id).unwrap().status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_on_a_leased_task_defers_cleanup_until_drained() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, store, network) = context(10);
        let target_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let target_volumes = VolumeManager::new(Store::new(), vec![("root".to_string(), dir.path().to_path_buf(), Perm::READ.union(Perm::WRITE))]);
        bind_volume_endpoints(&network, target_ip, target_volumes.clone());

        let engine = TaskEngine::new(store, ctx, 1, 1);

        let source = RemoteFile { peer: peer("10.0.0.1"), virtual_path: "root:/src".into() };
        let target = RemoteFile { peer: peer("10.0.0.5"), virtual_path: "root:/dst".into() };
        let id = engine.submit(Task::new(Box::new(CopyTask::new(source, target)))).await.unwrap();

        // A chunk already in flight has created the target and written to it.
        let target_vol = target_volumes.volume("root:/dst").unwrap();
        target_vol
            .create(&crate::volume::FileInfo { name: "dst".into(), virtual_path: "root:/dst".into(), file_type: crate::volume::FileType::File, size: 0, parent_path: "root:/".into() })
            .await
            .unwrap();
        target_vol.write("root:/dst", b"partial").await.unwrap();

        engine.leased.lock().expect("task engine leased lock poisoned").insert(id);

        engine.cancel(id).await.unwrap();
        assert!(target_vol.info("root:/dst").is_ok(), "cleanup must not run while the task is still leased");

        let mut task = engine.get(id).unwrap();
        let table = engine.table();
        engine.drain_completed(&table, &mut task).await;

        assert!(matches!(target_vol.info("root:/dst"), Err(NetfsError::FileNotFound(_))));
    }
}
