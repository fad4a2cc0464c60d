use crate::paths::AppPaths;
use crate::task::{Quality, Task, TaskStatus, TrimMode};
use crate::Result;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::time::Duration;

pub fn open(paths: &AppPaths) -> Result<Connection> {
    paths.ensure_dirs()?;

    let conn = Connection::open_with_flags(
        paths.db_path(),
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;

    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;

    Ok(conn)
}

/// Columns added after the first release; older databases get them with these defaults.
const BACKFILL_COLUMNS: &[(&str, &str)] = &[
    ("trim_start", "TEXT"),
    ("trim_end", "TEXT"),
    ("trim_mode", "TEXT NOT NULL DEFAULT 'none'"),
    ("error", "TEXT"),
    ("created_at_ms", "INTEGER NOT NULL DEFAULT 0"),
];

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task (
  id TEXT PRIMARY KEY,
  parent_id TEXT,
  is_playlist INTEGER NOT NULL DEFAULT 0,
  url TEXT NOT NULL,
  dir TEXT NOT NULL,
  quality TEXT NOT NULL,
  format TEXT NOT NULL,
  format_id TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL,
  progress REAL NOT NULL DEFAULT 0,
  title TEXT NOT NULL DEFAULT '',
  thumbnail TEXT NOT NULL DEFAULT '',
  total_size TEXT NOT NULL DEFAULT '',
  total_bytes INTEGER NOT NULL DEFAULT 0,
  speed TEXT NOT NULL DEFAULT '',
  eta TEXT NOT NULL DEFAULT '',
  current_item INTEGER NOT NULL DEFAULT 0,
  total_items INTEGER NOT NULL DEFAULT 0,
  log_path TEXT NOT NULL DEFAULT '',
  file_exists INTEGER NOT NULL DEFAULT 0,
  file_path TEXT NOT NULL DEFAULT '',
  files_json TEXT NOT NULL DEFAULT '[]',
  playlist_items_json TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_task_parent ON task(parent_id);
"#,
    )?;

    let existing = table_columns(conn, "task")?;
    for (name, ddl) in BACKFILL_COLUMNS {
        if !existing.iter().any(|c| c == name) {
            conn.execute(&format!("ALTER TABLE task ADD COLUMN {name} {ddl}"), [])?;
        }
    }
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_status_created ON task(status, created_at_ms)",
        [],
    )?;

    let current_schema_version = 2;
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(v) if v == current_schema_version.to_string() => {}
        _ => {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES('schema_version', ?)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                [current_schema_version.to_string()],
            )?;
        }
    }

    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut names = Vec::new();
    while let Some(row) = rows.next()? {
        names.push(row.get::<_, String>(1)?);
    }
    Ok(names)
}

pub fn upsert_task(conn: &Connection, task: &Task) -> Result<()> {
    let files_json = serde_json::to_string(&task.files)?;
    let playlist_items_json = serde_json::to_string(&task.playlist_items)?;
    conn.execute(
        "INSERT INTO task (
           id, parent_id, is_playlist, url, dir, quality, format, format_id,
           trim_start, trim_end, trim_mode, status, progress, title, thumbnail,
           total_size, total_bytes, speed, eta, current_item, total_items, log_path,
           file_exists, file_path, files_json, playlist_items_json, error, created_at_ms
         ) VALUES (
           ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
           ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28
         )
         ON CONFLICT(id) DO UPDATE SET
           parent_id=excluded.parent_id, is_playlist=excluded.is_playlist,
           url=excluded.url, dir=excluded.dir, quality=excluded.quality,
           format=excluded.format, format_id=excluded.format_id,
           trim_start=excluded.trim_start, trim_end=excluded.trim_end,
           trim_mode=excluded.trim_mode, status=excluded.status,
           progress=excluded.progress, title=excluded.title,
           thumbnail=excluded.thumbnail, total_size=excluded.total_size,
           total_bytes=excluded.total_bytes, speed=excluded.speed, eta=excluded.eta,
           current_item=excluded.current_item, total_items=excluded.total_items,
           log_path=excluded.log_path, file_exists=excluded.file_exists,
           file_path=excluded.file_path, files_json=excluded.files_json,
           playlist_items_json=excluded.playlist_items_json, error=excluded.error,
           created_at_ms=excluded.created_at_ms",
        params![
            task.id,
            task.parent_id,
            task.is_playlist,
            task.url,
            task.dir,
            task.quality.as_str(),
            task.format,
            task.format_id,
            task.trim_start,
            task.trim_end,
            task.trim_mode.as_str(),
            task.status.as_str(),
            task.progress,
            task.title,
            task.thumbnail,
            task.total_size,
            task.total_bytes,
            task.speed,
            task.eta,
            task.current_item,
            task.total_items,
            task.log_path,
            task.file_exists,
            task.file_path,
            files_json,
            playlist_items_json,
            task.error,
            task.created_at_ms,
        ],
    )?;
    Ok(())
}

pub fn delete_task(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM task WHERE id=?1", [id])?;
    Ok(())
}

pub fn count_tasks(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM task", [], |row| row.get(0))?)
}

pub fn load_tasks(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, is_playlist, url, dir, quality, format, format_id,
                trim_start, trim_end, trim_mode, status, progress, title, thumbnail,
                total_size, total_bytes, speed, eta, current_item, total_items, log_path,
                file_exists, file_path, files_json, playlist_items_json, error, created_at_ms
         FROM task ORDER BY created_at_ms ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([], row_to_task)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let quality: String = row.get(5)?;
    let trim_mode: String = row.get(10)?;
    let status: String = row.get(11)?;
    let files_json: String = row.get(24)?;
    let playlist_items_json: String = row.get(25)?;

    Ok(Task {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        is_playlist: row.get(2)?,
        url: row.get(3)?,
        dir: row.get(4)?,
        quality: Quality::from_str(&quality).unwrap_or_default(),
        format: row.get(6)?,
        format_id: row.get(7)?,
        trim_start: row.get(8)?,
        trim_end: row.get(9)?,
        trim_mode: TrimMode::from_str(&trim_mode).unwrap_or_default(),
        // Unknown statuses come from newer builds; treat them as failed rather than drop rows.
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Error),
        progress: row.get(12)?,
        title: row.get(13)?,
        thumbnail: row.get(14)?,
        total_size: row.get(15)?,
        total_bytes: row.get(16)?,
        speed: row.get(17)?,
        eta: row.get(18)?,
        current_item: row.get(19)?,
        total_items: row.get(20)?,
        log_path: row.get(21)?,
        file_exists: row.get(22)?,
        file_path: row.get(23)?,
        files: serde_json::from_str(&files_json).unwrap_or_default(),
        playlist_items: serde_json::from_str(&playlist_items_json).unwrap_or_default(),
        error: row.get(26)?,
        created_at_ms: row.get(27)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DownloadFile;

    #[test]
    fn migrate_adds_trim_columns_for_legacy_task_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");

        {
            let conn = Connection::open(paths.db_path()).expect("open");
            conn.execute_batch(
                r#"
CREATE TABLE task (
  id TEXT PRIMARY KEY,
  parent_id TEXT,
  is_playlist INTEGER NOT NULL DEFAULT 0,
  url TEXT NOT NULL,
  dir TEXT NOT NULL,
  quality TEXT NOT NULL,
  format TEXT NOT NULL,
  format_id TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL,
  progress REAL NOT NULL DEFAULT 0,
  title TEXT NOT NULL DEFAULT '',
  thumbnail TEXT NOT NULL DEFAULT '',
  total_size TEXT NOT NULL DEFAULT '',
  total_bytes INTEGER NOT NULL DEFAULT 0,
  speed TEXT NOT NULL DEFAULT '',
  eta TEXT NOT NULL DEFAULT '',
  current_item INTEGER NOT NULL DEFAULT 0,
  total_items INTEGER NOT NULL DEFAULT 0,
  log_path TEXT NOT NULL DEFAULT '',
  file_exists INTEGER NOT NULL DEFAULT 0,
  file_path TEXT NOT NULL DEFAULT '',
  files_json TEXT NOT NULL DEFAULT '[]',
  playlist_items_json TEXT NOT NULL DEFAULT '[]'
);
INSERT INTO task (id, url, dir, quality, format, status)
VALUES ('legacy', 'https://example.com/v', '/tmp', '720p', 'mp4', 'completed');
"#,
            )
            .expect("create legacy task table");
        }

        let conn = open(&paths).expect("open migrated");
        migrate(&conn).expect("migrate");

        let columns = table_columns(&conn, "task").expect("columns");
        for (name, _) in BACKFILL_COLUMNS {
            assert!(columns.iter().any(|c| c == name), "{name} should exist after migrate");
        }

        let tasks = load_tasks(&conn).expect("load");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].quality, Quality::P720);
        assert_eq!(tasks[0].trim_mode, TrimMode::None);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }

    #[test]
    fn migrate_records_schema_version_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let conn = open(&paths).expect("open");
        migrate(&conn).expect("first migrate");
        migrate(&conn).expect("second migrate");

        let versions: Vec<String> = conn
            .prepare("SELECT value FROM meta WHERE key='schema_version'")
            .expect("prepare")
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        assert_eq!(versions, vec!["2".to_string()]);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let conn = open(&paths).expect("open");
        migrate(&conn).expect("migrate");

        let mut task = Task {
            id: "t1".to_string(),
            url: "https://example.com/v".to_string(),
            dir: "/tmp".to_string(),
            playlist_items: vec![1, 3],
            ..Task::default()
        };
        upsert_task(&conn, &task).expect("insert");

        task.status = TaskStatus::Downloading;
        task.progress = 41.0;
        task.files.push(DownloadFile {
            path: "/tmp/v.mp4".to_string(),
            ..DownloadFile::default()
        });
        upsert_task(&conn, &task).expect("update");

        let loaded = load_tasks(&conn).expect("load");
        assert_eq!(loaded, vec![task]);
        assert_eq!(count_tasks(&conn).expect("count"), 1);

        delete_task(&conn, "t1").expect("delete");
        assert_eq!(count_tasks(&conn).expect("count"), 0);
    }
}
