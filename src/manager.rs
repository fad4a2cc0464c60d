//! The task registry, its state machine and the admission scheduler.

use crate::config::{self, Settings};
use crate::deps::{DependencyResolver, ToolResolver};
use crate::events::{EventSink, TaskObserver, TracingSink};
use crate::parser::ProgressTracker;
use crate::paths::{resolve_in, AppPaths};
use crate::process::CancelToken;
use crate::runner::{self, RunOutcome};
use crate::store::TaskStore;
use crate::task::{AddPlaylistRequest, AddTaskRequest, Task, TaskStatus};
use crate::task_log;
use crate::{EngineError, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const IDLE_POLL_INTERVAL_MS: u64 = 100;

/// Everything guarded by the registry lock.
pub(crate) struct Registry {
    tasks: HashMap<String, Task>,
    /// Present while the task owns (or is about to spawn) a process.
    cancel_handles: HashMap<String, CancelToken>,
    /// Runner threads that have not finalized yet.
    live_runners: HashSet<String>,
    trackers: HashMap<String, ProgressTracker>,
    last_created_at_ms: i64,
    store: TaskStore,
}

impl Registry {
    fn persist(&self, task: &Task) {
        if let Err(e) = self.store.save(task) {
            tracing::warn!(task_id = %task.id, error = %e, "failed to persist task");
        }
    }

    fn forget(&mut self, id: &str) {
        if let Err(e) = self.store.delete(id) {
            tracing::warn!(task_id = id, error = %e, "failed to delete task row");
        }
    }

    /// Strictly increasing creation stamps keep admission order stable within one millisecond.
    fn next_created_at(&mut self) -> i64 {
        let stamp = now_ms().max(self.last_created_at_ms + 1);
        self.last_created_at_ms = stamp;
        stamp
    }

    fn children_of(&self, parent_id: &str) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Recomputes a playlist parent's counters from its children.
    fn refresh_parent(&mut self, parent_id: &str) -> Option<Task> {
        let children: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .collect();
        let total = children.len() as i64;
        let finished = children.iter().filter(|t| t.status.is_terminal()).count() as i64;

        let parent = self.tasks.get_mut(parent_id)?;
        parent.total_items = total;
        parent.current_item = finished;
        parent.progress = if total > 0 {
            100.0 * finished as f64 / total as f64
        } else {
            0.0
        };
        let snapshot = parent.clone();
        self.persist(&snapshot);
        Some(snapshot)
    }
}

pub(crate) struct Shared {
    paths: AppPaths,
    settings: RwLock<Settings>,
    registry: Mutex<Registry>,
    sink: Arc<dyn EventSink>,
    resolver: Arc<dyn DependencyResolver>,
    observers: RwLock<Vec<Arc<dyn TaskObserver>>>,
    /// Admission is held until `start` and again after `shutdown`.
    held: AtomicBool,
    cleanup: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the download queue. Clones share the same registry.
#[derive(Clone)]
pub struct TaskManager {
    shared: Arc<Shared>,
}

impl TaskManager {
    /// Opens the queue with settings from disk, yt-dlp/ffmpeg from `<base>/tools` or `PATH`,
    /// and events going to `tracing`.
    pub fn open(paths: AppPaths) -> Result<Self> {
        let settings = config::load_settings(&paths)?;
        let resolver = Arc::new(ToolResolver::new(paths.clone()));
        Self::open_with(paths, settings, Arc::new(TracingSink), resolver)
    }

    pub fn open_with(
        paths: AppPaths,
        settings: Settings,
        sink: Arc<dyn EventSink>,
        resolver: Arc<dyn DependencyResolver>,
    ) -> Result<Self> {
        let manager = Self::load(paths, settings, sink, resolver)?;
        manager.start();
        Ok(manager)
    }

    /// Loads and reconciles the queue without admitting anything until [`TaskManager::start`].
    pub fn load(
        paths: AppPaths,
        settings: Settings,
        sink: Arc<dyn EventSink>,
        resolver: Arc<dyn DependencyResolver>,
    ) -> Result<Self> {
        paths.ensure_dirs()?;
        let store = TaskStore::open(&paths)?;
        let loaded = store.load_reconciled()?;
        let last_created_at_ms = loaded.iter().map(|t| t.created_at_ms).max().unwrap_or(0);
        tracing::info!(tasks = loaded.len(), base_dir = %paths.base_dir.display(), "task queue opened");

        let registry = Registry {
            tasks: loaded.into_iter().map(|t| (t.id.clone(), t)).collect(),
            cancel_handles: HashMap::new(),
            live_runners: HashSet::new(),
            trackers: HashMap::new(),
            last_created_at_ms,
            store,
        };

        let prune_paths = paths.clone();
        thread::spawn(move || {
            if let Err(e) = task_log::prune(&prune_paths) {
                tracing::warn!(error = %e, "failed to prune task logs");
            }
        });

        Ok(Self {
            shared: Arc::new(Shared {
                paths,
                settings: RwLock::new(settings),
                registry: Mutex::new(registry),
                sink,
                resolver,
                observers: RwLock::new(Vec::new()),
                held: AtomicBool::new(true),
                cleanup: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn start(&self) {
        self.shared.held.store(false, Ordering::SeqCst);
        self.schedule();
    }

    pub fn settings(&self) -> Settings {
        self.shared
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persists new settings and re-runs admission (the ceiling may have grown).
    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        config::save_settings(&self.shared.paths, &settings)?;
        *self
            .shared
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
        self.schedule();
        Ok(())
    }

    pub fn subscribe(&self, observer: Arc<dyn TaskObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn add_task(&self, request: AddTaskRequest) -> Result<String> {
        let url = request.url.trim().to_string();
        if url.is_empty() {
            return Err(EngineError::InvalidRequest("url is empty".to_string()));
        }
        let dir = self.resolve_dir(request.dir.as_deref());

        let snapshot = {
            let mut reg = self.lock();
            let id = Uuid::now_v7().to_string();
            let mut task = Task {
                log_path: self.log_path(&id),
                id,
                url: url.clone(),
                dir,
                quality: request.quality,
                format: non_empty(request.format).unwrap_or_else(|| "original".to_string()),
                format_id: non_empty(request.format_id).unwrap_or_default(),
                title: non_empty(request.title).unwrap_or(url),
                thumbnail: non_empty(request.thumbnail).unwrap_or_default(),
                trim_start: non_empty(request.trim_start),
                trim_end: non_empty(request.trim_end),
                trim_mode: request.trim_mode,
                created_at_ms: reg.next_created_at(),
                ..Task::default()
            };
            task.set_total_bytes(request.total_bytes.unwrap_or(0));
            reg.persist(&task);
            reg.tasks.insert(task.id.clone(), task.clone());
            task
        };

        self.shared.sink.emit_task_snapshot(&snapshot);
        self.log(&snapshot.id, &format!("queued {}", snapshot.url));
        self.schedule();
        Ok(snapshot.id)
    }

    /// Creates an aggregate parent plus one pending child per item. Returns the parent id.
    pub fn add_playlist(&self, request: AddPlaylistRequest) -> Result<String> {
        let url = request.url.trim().to_string();
        if url.is_empty() {
            return Err(EngineError::InvalidRequest("url is empty".to_string()));
        }
        let items: Vec<_> = request
            .items
            .into_iter()
            .filter(|item| !item.url.trim().is_empty())
            .collect();
        if items.is_empty() {
            return Err(EngineError::InvalidRequest("playlist has no items".to_string()));
        }
        let dir = self.resolve_dir(request.dir.as_deref());

        let created = {
            let mut reg = self.lock();
            let parent_id = Uuid::now_v7().to_string();
            let parent = Task {
                log_path: self.log_path(&parent_id),
                id: parent_id.clone(),
                is_playlist: true,
                url: url.clone(),
                dir: dir.clone(),
                title: non_empty(request.title).unwrap_or(url),
                thumbnail: non_empty(request.thumbnail).unwrap_or_default(),
                playlist_items: items.iter().map(|item| item.index).collect(),
                status: TaskStatus::Completed,
                total_items: items.len() as i64,
                created_at_ms: reg.next_created_at(),
                ..Task::default()
            };
            reg.persist(&parent);
            reg.tasks.insert(parent.id.clone(), parent.clone());

            let mut created = vec![parent];
            for item in items {
                let id = Uuid::now_v7().to_string();
                let child = Task {
                    log_path: self.log_path(&id),
                    id,
                    parent_id: Some(parent_id.clone()),
                    url: item.url.trim().to_string(),
                    dir: dir.clone(),
                    title: if item.title.trim().is_empty() {
                        item.url.trim().to_string()
                    } else {
                        item.title
                    },
                    thumbnail: item.thumbnail,
                    created_at_ms: reg.next_created_at(),
                    ..Task::default()
                };
                reg.persist(&child);
                reg.tasks.insert(child.id.clone(), child.clone());
                created.push(child);
            }
            created
        };

        for task in &created {
            self.shared.sink.emit_task_snapshot(task);
        }
        let parent_id = created[0].id.clone();
        self.log(
            &parent_id,
            &format!("queued playlist with {} items", created.len() - 1),
        );
        self.schedule();
        Ok(parent_id)
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.lock().tasks.get(id).cloned()
    }

    /// All tasks in creation order.
    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| (a.created_at_ms, &a.id).cmp(&(b.created_at_ms, &b.id)));
        tasks
    }

    pub fn has_cancel_handle(&self, id: &str) -> bool {
        self.lock().cancel_handles.contains_key(id)
    }

    /// Stops a starting or downloading task. Merges and trims run to completion.
    pub fn pause_task(&self, id: &str) -> Result<()> {
        let snapshot = {
            let mut reg = self.lock();
            let task = reg
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            if !matches!(task.status, TaskStatus::Starting | TaskStatus::Downloading) {
                return Ok(());
            }
            task.status = TaskStatus::Paused;
            task.speed.clear();
            task.eta.clear();
            let snapshot = task.clone();
            if let Some(token) = reg.cancel_handles.remove(id) {
                token.cancel();
            }
            reg.persist(&snapshot);
            snapshot
        };

        self.shared.sink.emit_task_snapshot(&snapshot);
        self.log(id, "paused");
        self.schedule();
        Ok(())
    }

    /// Requeues a paused or failed task, keeping its progress.
    pub fn resume_task(&self, id: &str) -> Result<()> {
        self.requeue(id, &[TaskStatus::Paused, TaskStatus::Error], false)
    }

    /// Requeues a failed task from scratch.
    pub fn retry_task(&self, id: &str) -> Result<()> {
        self.requeue(id, &[TaskStatus::Error, TaskStatus::TrimFailed], true)
    }

    fn requeue(&self, id: &str, from: &[TaskStatus], reset: bool) -> Result<()> {
        let (snapshot, parent) = {
            let mut reg = self.lock();
            let task = reg
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            if task.is_playlist || !from.contains(&task.status) {
                return Ok(());
            }
            task.status = TaskStatus::Pending;
            task.error = None;
            task.speed.clear();
            task.eta.clear();
            if reset {
                task.progress = 0.0;
                task.files.clear();
                task.file_exists = false;
            }
            let snapshot = task.clone();
            reg.persist(&snapshot);
            let parent = snapshot
                .parent_id
                .as_deref()
                .and_then(|p| reg.refresh_parent(p));
            (snapshot, parent)
        };

        self.shared.sink.emit_task_snapshot(&snapshot);
        if let Some(parent) = parent {
            self.shared.sink.emit_task_snapshot(&parent);
        }
        self.log(id, if reset { "retrying" } else { "resuming" });
        self.schedule();
        Ok(())
    }

    /// Deletes a task and whatever it cascades to: a playlist takes its children along, and the
    /// last child of a playlist takes the parent. Returns every deleted id.
    ///
    /// Refused with [`EngineError::TaskBusy`] while any of them is merging or trimming.
    pub fn delete_task(&self, id: &str, delete_files: bool) -> Result<Vec<String>> {
        let (deleted, artifacts, parent_snapshot) = {
            let mut reg = self.lock();
            let task = reg
                .tasks
                .get(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

            let mut targets = vec![id.to_string()];
            if task.is_playlist {
                targets.extend(reg.children_of(id));
            }
            let mut surviving_parent = None;
            if let Some(parent_id) = task.parent_id.clone() {
                let siblings = reg.children_of(&parent_id);
                if siblings.iter().all(|s| s == id) {
                    targets.push(parent_id);
                } else {
                    surviving_parent = Some(parent_id);
                }
            }

            if let Some(busy) = targets
                .iter()
                .filter_map(|t| reg.tasks.get(t))
                .find(|t| t.status.is_critical())
            {
                return Err(EngineError::TaskBusy {
                    id: busy.id.clone(),
                    status: busy.status.to_string(),
                });
            }

            let mut artifacts: Vec<PathBuf> = Vec::new();
            for target in &targets {
                if let Some(token) = reg.cancel_handles.remove(target) {
                    token.cancel();
                }
                reg.trackers.remove(target);
                if let Some(removed) = reg.tasks.remove(target) {
                    if delete_files {
                        artifacts.extend(task_artifacts(&removed));
                    }
                    task_log::remove(Path::new(&removed.log_path));
                }
                reg.forget(target);
            }

            let parent_snapshot = surviving_parent.and_then(|p| reg.refresh_parent(&p));
            (targets, artifacts, parent_snapshot)
        };

        if !artifacts.is_empty() {
            // The killed process may still hold its files open for a moment.
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(500));
                for path in artifacts {
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(path = %path.display(), error = %e, "failed to delete artifact");
                        }
                    }
                }
            });
            let mut cleanup = self
                .shared
                .cleanup
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cleanup.retain(|h| !h.is_finished());
            cleanup.push(handle);
        }
        if let Some(parent) = parent_snapshot {
            self.shared.sink.emit_task_snapshot(&parent);
        }
        tracing::info!(ids = ?deleted, delete_files, "deleted tasks");
        self.schedule();
        Ok(deleted)
    }

    pub fn task_logs(&self, id: &str) -> Result<Vec<String>> {
        let path = match self.lock().tasks.get(id) {
            Some(task) if !task.log_path.is_empty() => PathBuf::from(&task.log_path),
            _ => self.shared.paths.task_log_path(id),
        };
        task_log::read_lines(&path)
    }

    /// Admits pending tasks while the number of active ones is below the ceiling.
    pub fn schedule(&self) {
        if self.shared.held.load(Ordering::SeqCst) {
            return;
        }
        let ceiling = self.settings().max_concurrent_downloads();

        let admitted = {
            let mut reg = self.lock();
            let active = reg.tasks.values().filter(|t| t.status.is_active()).count();
            if active >= ceiling {
                return;
            }

            let mut pending: Vec<(i64, String)> = reg
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending && !t.is_playlist)
                .filter(|t| !reg.live_runners.contains(&t.id))
                .map(|t| (t.created_at_ms, t.id.clone()))
                .collect();
            pending.sort();

            let mut admitted = Vec::new();
            for (_, id) in pending.into_iter().take(ceiling - active) {
                let Some(task) = reg.tasks.get_mut(&id) else {
                    continue;
                };
                task.status = TaskStatus::Starting;
                task.speed.clear();
                task.eta.clear();
                let snapshot = task.clone();

                let token = CancelToken::new();
                reg.cancel_handles.insert(id.clone(), token.clone());
                reg.live_runners.insert(id.clone());
                reg.trackers.insert(id.clone(), ProgressTracker::new());
                reg.persist(&snapshot);
                admitted.push((snapshot, token));
            }
            admitted
        };

        for (snapshot, token) in admitted {
            self.shared.sink.emit_task_snapshot(&snapshot);
            let manager = self.clone();
            let id = snapshot.id.clone();
            let spawned = thread::Builder::new()
                .name(format!("task-{}", short_id(&id)))
                .spawn(move || runner::run_task(&manager, &id, token));
            if let Err(e) = spawned {
                self.finish_run(
                    &snapshot.id,
                    RunOutcome::launch_failure(format!("failed to start runner thread: {e}")),
                );
            }
        }
    }

    /// No task is running and none is waiting for a slot.
    pub fn is_idle(&self) -> bool {
        let reg = self.lock();
        reg.live_runners.is_empty()
            && !reg
                .tasks
                .values()
                .any(|t| t.status == TaskStatus::Pending && !t.is_playlist)
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.is_idle() {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(IDLE_POLL_INTERVAL_MS));
        }
    }

    /// Stops admitting work and kills running processes. Their tasks keep their active status
    /// on disk and come back as paused on the next open.
    pub fn shutdown(&self) {
        self.shared.held.store(true, Ordering::SeqCst);
        let reg = self.lock();
        for token in reg.cancel_handles.values() {
            token.cancel();
        }
    }

    /// Blocks until background artifact deletion has finished.
    pub fn join_background(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .shared
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub(crate) fn resolver(&self) -> &dyn DependencyResolver {
        self.shared.resolver.as_ref()
    }

    /// Mutates a task under the lock, persists it and emits the result.
    pub(crate) fn update_and_persist<F>(&self, id: &str, f: F) -> Option<Task>
    where
        F: FnOnce(&mut Task),
    {
        let snapshot = {
            let mut reg = self.lock();
            let task = reg.tasks.get_mut(id)?;
            f(task);
            let snapshot = task.clone();
            reg.persist(&snapshot);
            snapshot
        };
        self.shared.sink.emit_task_snapshot(&snapshot);
        Some(snapshot)
    }

    /// Appends to the task's text log and forwards the line.
    pub(crate) fn log(&self, id: &str, message: &str) {
        {
            let reg = self.lock();
            let Some(task) = reg.tasks.get(id) else {
                return;
            };
            if let Err(e) = task_log::append_line(Path::new(&task.log_path), message) {
                tracing::warn!(task_id = id, error = %e, "failed to append task log");
            }
        }
        self.shared.sink.emit_log_line(id, message, false);
    }

    /// Folds one line of downloader output into the task.
    pub(crate) fn handle_output_line(&self, id: &str, line: &str) {
        let (effect, snapshot) = {
            let mut guard = self.lock();
            let reg = &mut *guard;
            let (Some(task), Some(tracker)) = (reg.tasks.get_mut(id), reg.trackers.get_mut(id))
            else {
                return;
            };

            let before = task.status;
            let effect = tracker.apply(line, task);
            // Output still draining after a pause (or a resume back to pending) cannot move it.
            if !before.is_active() {
                task.status = before;
            }
            if effect.keep_in_log {
                if let Err(e) = task_log::append_line(Path::new(&task.log_path), line) {
                    tracing::warn!(task_id = id, error = %e, "failed to append task log");
                }
            }
            let snapshot = effect.changed.then(|| task.clone());
            if task.status != before {
                let persisted = task.clone();
                reg.persist(&persisted);
            }
            (effect, snapshot)
        };

        self.shared.sink.emit_log_line(id, line, !effect.keep_in_log);
        if let Some(snapshot) = snapshot {
            self.shared.sink.emit_task_snapshot(&snapshot);
        }
    }

    /// Records a run's outcome, releases its slot and admits the next task.
    pub(crate) fn finish_run(&self, id: &str, outcome: RunOutcome) {
        let (snapshot, parent, message) = {
            let mut reg = self.lock();
            reg.cancel_handles.remove(id);
            reg.trackers.remove(id);
            reg.live_runners.remove(id);

            let Some(task) = reg.tasks.get_mut(id) else {
                drop(reg);
                self.schedule();
                return;
            };

            let message = match &outcome {
                RunOutcome::Completed { limit_reached } => {
                    task.status = TaskStatus::Completed;
                    task.progress = 100.0;
                    task.error = None;
                    Some(if *limit_reached {
                        "download limit reached (expected)".to_string()
                    } else {
                        "download completed".to_string()
                    })
                }
                RunOutcome::TrimFailed(detail) => {
                    task.status = TaskStatus::TrimFailed;
                    task.error = Some(detail.clone());
                    Some(format!("trim failed, original kept: {detail}"))
                }
                RunOutcome::Failed { kind, detail } => {
                    if task.status == TaskStatus::Paused {
                        None
                    } else {
                        task.status = TaskStatus::Error;
                        task.error = Some(format!("{kind}: {detail}"));
                        Some(format!("Error: {kind}: {detail}"))
                    }
                }
                RunOutcome::Cancelled => None,
            };
            if message.is_some() {
                task.speed.clear();
                task.eta.clear();
            }

            let snapshot = task.clone();
            let parent_id = snapshot.parent_id.clone();
            reg.persist(&snapshot);
            let parent = match parent_id {
                Some(p) if snapshot.status.is_terminal() => reg.refresh_parent(&p),
                _ => None,
            };
            (snapshot, parent, message)
        };

        if let Some(message) = message {
            self.log(id, &message);
            self.shared.sink.emit_task_snapshot(&snapshot);
            let observers = self
                .shared
                .observers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for observer in observers {
                match snapshot.status {
                    TaskStatus::Completed => observer.task_completed(&snapshot),
                    TaskStatus::Error | TaskStatus::TrimFailed => observer.task_failed(&snapshot),
                    _ => {}
                }
            }
        }
        if let Some(parent) = parent {
            self.shared.sink.emit_task_snapshot(&parent);
        }
        self.schedule();
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn log_path(&self, id: &str) -> String {
        self.shared
            .paths
            .task_log_path(id)
            .to_string_lossy()
            .to_string()
    }

    fn resolve_dir(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            Some(dir) if !dir.is_empty() => dir.to_string(),
            _ => self.settings().download_dir_or_default(&self.shared.paths),
        }
    }
}

fn task_artifacts(task: &Task) -> Vec<PathBuf> {
    let dir = Path::new(&task.dir);
    let mut out: Vec<PathBuf> = Vec::new();
    let candidates = std::iter::once(task.file_path.as_str()).chain(task.files.iter().map(|f| f.path.as_str()));
    for raw in candidates {
        if raw.trim().is_empty() {
            continue;
        }
        let path = resolve_in(dir, raw);
        // yt-dlp keeps in-flight data beside the announced name.
        let part = sidecar(&path, ".part");
        let ytdl = sidecar(&path, ".ytdl");
        for candidate in [path, part, ytdl] {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
    }
    out
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn short_id(id: &str) -> &str {
    id.get(id.len().saturating_sub(8)..).unwrap_or(id)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
