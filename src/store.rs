use crate::db;
use crate::format::format_bytes;
use crate::paths::{resolve_in, AppPaths};
use crate::task::{Task, TaskStatus};
use crate::Result;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;

/// Durable side of the task registry. One connection, owned by the manager's registry lock.
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    pub fn open(paths: &AppPaths) -> Result<Self> {
        let conn = db::open(paths)?;
        db::migrate(&conn)?;

        let legacy = paths.legacy_store_path();
        if legacy.exists() && db::count_tasks(&conn)? == 0 {
            let imported = import_legacy_json(&conn, &legacy)?;
            let backup = legacy.with_extension("json.bak");
            std::fs::rename(&legacy, &backup)?;
            tracing::info!(imported, backup = %backup.display(), "imported legacy task store");
        }

        Ok(Self { conn })
    }

    /// Loads every task, demoting runs that were interrupted by a crash and refreshing
    /// on-disk facts. Rows that changed are written back.
    pub fn load_reconciled(&self) -> Result<Vec<Task>> {
        let mut tasks = db::load_tasks(&self.conn)?;
        for task in tasks.iter_mut() {
            if reconcile_loaded(task) {
                db::upsert_task(&self.conn, task)?;
            }
        }
        Ok(tasks)
    }

    pub fn save(&self, task: &Task) -> Result<()> {
        db::upsert_task(&self.conn, task)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        db::delete_task(&self.conn, id)
    }
}

/// Returns true when the task was modified.
pub fn reconcile_loaded(task: &mut Task) -> bool {
    let before = task.clone();

    if task.status.is_active() {
        task.status = TaskStatus::Paused;
        task.speed.clear();
        task.eta.clear();
    }

    let dir = Path::new(&task.dir).to_path_buf();
    for file in task.files.iter_mut() {
        let resolved = resolve_in(&dir, &file.path);
        file.path = resolved.to_string_lossy().to_string();
        if let Ok(meta) = std::fs::metadata(&resolved) {
            let len = meta.len() as i64;
            if len > 0 {
                file.size_bytes = len;
                file.size = format_bytes(len);
            }
        }
    }

    if task.status == TaskStatus::Completed && !task.is_playlist {
        task.file_exists = output_exists(task);
    }

    *task != before
}

pub fn output_exists(task: &Task) -> bool {
    let dir = Path::new(&task.dir);
    if !task.file_path.is_empty() && resolve_in(dir, &task.file_path).exists() {
        return true;
    }
    task.files
        .iter()
        .any(|f| !f.path.is_empty() && resolve_in(dir, &f.path).exists())
}

/// Imports a `tasks.json` map (id -> task) written by releases that predate SQLite.
pub fn import_legacy_json(conn: &Connection, path: &Path) -> Result<usize> {
    let bytes = std::fs::read(path)?;
    let legacy: HashMap<String, Task> = serde_json::from_slice(&bytes)?;

    let mut imported = 0;
    for (id, mut task) in legacy {
        if task.id.is_empty() {
            task.id = id;
        }
        if task.parent_id.as_deref().is_some_and(str::is_empty) {
            task.parent_id = None;
        }
        reconcile_loaded(&mut task);
        db::upsert_task(conn, &task)?;
        imported += 1;
    }
    Ok(imported)
}
