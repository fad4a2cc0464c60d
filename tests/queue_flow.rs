#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tubeq_engine::config::Settings;
use tubeq_engine::deps::FixedTools;
use tubeq_engine::events::{NullSink, TaskObserver};
use tubeq_engine::paths::AppPaths;
use tubeq_engine::task::PlaylistItem;
use tubeq_engine::{
    AddPlaylistRequest, AddTaskRequest, EngineError, Quality, Task, TaskManager, TaskStatus,
    TrimMode,
};

const FAKE_YT_DLP: &str = r#"#!/bin/sh
dir="."
prev=""
url=""
for a in "$@"; do
  if [ "$prev" = "-P" ]; then dir="$a"; fi
  prev="$a"
  url="$a"
done
case " $* " in
  *" --dump-json "*)
    case "$url" in
      *nometa*) echo "ERROR: metadata blocked" >&2; exit 1 ;;
    esac
    echo '{"title":"Fake Video","thumbnail":"https://example.com/t.jpg","duration":10,"formats":[{"format_id":"140","vcodec":"none","acodec":"mp4a","filesize":512},{"format_id":"137","vcodec":"avc1","acodec":"none","height":1080,"filesize":1536}]}'
    exit 0 ;;
esac
case "$url" in
  *fail*) echo "ERROR: [generic] video unavailable" >&2; exit 1 ;;
  *limit*) echo "[download] Maximum number of downloads reached"; exit 101 ;;
  *slow*)
    mkdir -p "$dir"
    name=$(basename "$url")
    echo "[download] Destination: $dir/$name.mp4"
    head -c 512 /dev/zero > "$dir/$name.mp4.part"
    echo "[download]   5.0% of 10.00MiB at 1.00MiB/s ETA 00:09"
    exec sleep 30 ;;
esac
mkdir -p "$dir"
name=$(basename "$url")
out="$dir/$name.mp4"
echo "[download] Destination: $out"
echo "[download]  50.0% of 1.00KiB at 1.00KiB/s ETA 00:01"
head -c 1024 /dev/zero > "$out"
echo "[download] 100% of 1.00KiB in 00:00:01"
exit 0
"#;

const FAKE_FFMPEG: &str = r#"#!/bin/sh
in=""
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-i" ]; then in="$a"; fi
  prev="$a"
  out="$a"
done
if [ "$out" = "$in" ]; then
  echo "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from '$in':" >&2
  echo "  Duration: 00:01:05.50, start: 0.000000, bitrate: 1 kb/s" >&2
  echo "At least one output file must be specified" >&2
  exit 1
fi
case "$in" in
  *corrupt*) echo "partial" > "$out"; echo "Invalid data found when processing input" >&2; exit 1 ;;
esac
head -c 256 "$in" > "$out"
"#;

struct Fixtures {
    _dir: TempDir,
    yt_dlp: PathBuf,
    ffmpeg: PathBuf,
}

/// Scripts are written once per process; rewriting an executable other tests may be spawning
/// races with ETXTBSY.
fn fixtures() -> &'static Fixtures {
    static FIXTURES: OnceLock<Fixtures> = OnceLock::new();
    FIXTURES.get_or_init(|| {
        let dir = tempfile::tempdir().expect("fixture dir");
        let yt_dlp = write_script(dir.path(), "yt-dlp", FAKE_YT_DLP);
        let ffmpeg = write_script(dir.path(), "ffmpeg", FAKE_FFMPEG);
        Fixtures {
            _dir: dir,
            yt_dlp,
            ffmpeg,
        }
    })
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn open_manager(base: &Path, concurrency: i64) -> TaskManager {
    let tools = fixtures();
    let settings = Settings {
        download_dir: Some(base.join("media").to_string_lossy().to_string()),
        download_concurrency: concurrency,
        ..Settings::default()
    };
    TaskManager::open_with(
        AppPaths::new(base.to_path_buf()),
        settings,
        Arc::new(NullSink),
        Arc::new(FixedTools {
            downloader: Some(tools.yt_dlp.clone()),
            media_toolkit: Some(tools.ffmpeg.clone()),
        }),
    )
    .expect("open manager")
}

fn add(manager: &TaskManager, url: &str) -> String {
    manager
        .add_task(AddTaskRequest {
            url: url.to_string(),
            quality: Quality::P720,
            ..AddTaskRequest::default()
        })
        .expect("add task")
}

fn wait_for<F: Fn(&Task) -> bool>(manager: &TaskManager, id: &str, pred: F) -> Task {
    let started = Instant::now();
    loop {
        if let Some(task) = manager.get_task(id) {
            if pred(&task) {
                return task;
            }
        }
        assert!(
            started.elapsed() < Duration::from_secs(20),
            "task {id} never reached the expected state: {:?}",
            manager.get_task(id)
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn idle(manager: &TaskManager) {
    assert!(manager.wait_idle(Duration::from_secs(20)), "queue never went idle");
}

#[test]
fn download_completes_and_records_its_file() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = add(&manager, "https://video.test/ok-one");
    idle(&manager);

    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100.0);
    assert!(task.file_exists);
    assert!(task.file_path.ends_with("ok-one.mp4"));
    assert_eq!(task.files.len(), 1);
    assert_eq!(task.files[0].size_bytes, 1024);
    assert!(task.speed.is_empty() && task.eta.is_empty());
    assert!(!manager.has_cancel_handle(&id));

    let logs = manager.task_logs(&id).expect("logs");
    assert!(logs.iter().any(|l| l.contains("download completed")));
    assert!(logs.iter().any(|l| l.contains("100% of")));
    assert!(!logs.iter().any(|l| l.contains("50.0%")));
}

#[test]
fn best_quality_uses_metadata_preflight() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = manager
        .add_task(AddTaskRequest {
            url: "https://video.test/ok-best".to_string(),
            ..AddTaskRequest::default()
        })
        .expect("add");
    idle(&manager);

    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.title, "Fake Video");
    assert_eq!(task.total_bytes, 2048);
    assert!(task.format_id.contains("137"));
}

#[test]
fn metadata_failure_falls_back_to_generic_selector() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = manager
        .add_task(AddTaskRequest {
            url: "https://video.test/ok-nometa".to_string(),
            ..AddTaskRequest::default()
        })
        .expect("add");
    idle(&manager);

    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.format_id.is_empty());
    let logs = manager.task_logs(&id).expect("logs");
    assert!(logs.iter().any(|l| l.contains("metadata unavailable")));
    assert!(logs.iter().any(|l| l.contains("bestvideo+bestaudio/best")));
}

#[test]
fn limit_exit_code_is_a_completion() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = add(&manager, "https://video.test/limit");
    idle(&manager);

    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.error, None);
    assert!(manager
        .task_logs(&id)
        .expect("logs")
        .iter()
        .any(|l| l.contains("limit reached")));
}

#[test]
fn failed_download_can_be_retried_from_zero() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = add(&manager, "https://video.test/fail");
    idle(&manager);

    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Error);
    let error = task.error.expect("error detail");
    assert!(error.starts_with("runtime"), "{error}");
    assert!(error.contains("video unavailable"), "{error}");

    manager.retry_task(&id).expect("retry");
    idle(&manager);
    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(
        manager
            .task_logs(&id)
            .expect("logs")
            .iter()
            .filter(|l| l.contains("retrying"))
            .count(),
        1
    );
}

#[test]
fn pause_kills_the_process_and_keeps_progress() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = add(&manager, "https://video.test/slow");

    wait_for(&manager, &id, |t| {
        t.status == TaskStatus::Downloading && t.progress > 0.0
    });
    let started = Instant::now();
    manager.pause_task(&id).expect("pause");
    idle(&manager);
    assert!(started.elapsed() < Duration::from_secs(10));

    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.progress, 5.0);
    assert_eq!(task.error, None);
    assert!(!manager.has_cancel_handle(&id));
}

#[test]
fn ceiling_holds_while_tasks_run() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 1);
    let first = add(&manager, "https://video.test/slow-1");
    let second = add(&manager, "https://video.test/slow-2");

    wait_for(&manager, &first, |t| t.status == TaskStatus::Downloading);
    std::thread::sleep(Duration::from_millis(300));
    let active = manager
        .list_tasks()
        .iter()
        .filter(|t| t.status.is_active())
        .count();
    assert_eq!(active, 1);
    assert_eq!(
        manager.get_task(&second).expect("second").status,
        TaskStatus::Pending
    );

    manager.delete_task(&first, false).expect("delete first");
    wait_for(&manager, &second, |t| t.status == TaskStatus::Downloading);
    manager.delete_task(&second, false).expect("delete second");
    idle(&manager);
    assert!(manager.list_tasks().is_empty());
}

#[test]
fn overwrite_trim_replaces_the_original() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = manager
        .add_task(AddTaskRequest {
            url: "https://video.test/ok-trim".to_string(),
            quality: Quality::P480,
            trim_start: Some("00:00:01".to_string()),
            trim_mode: TrimMode::Overwrite,
            ..AddTaskRequest::default()
        })
        .expect("add");
    idle(&manager);

    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    let media = base.path().join("media");
    assert_eq!(
        std::fs::metadata(media.join("ok-trim.mp4")).expect("trimmed").len(),
        256
    );
    assert!(!media.join("ok-trim.trimmed.mp4").exists());
    assert_eq!(task.files.len(), 1);
}

#[test]
fn keep_both_trim_adds_a_second_file() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = manager
        .add_task(AddTaskRequest {
            url: "https://video.test/ok-keep".to_string(),
            quality: Quality::P480,
            trim_start: Some("00:00:01".to_string()),
            trim_end: Some("00:00:02".to_string()),
            trim_mode: TrimMode::KeepBoth,
            ..AddTaskRequest::default()
        })
        .expect("add");
    idle(&manager);

    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    let media = base.path().join("media");
    assert_eq!(std::fs::metadata(media.join("ok-keep.mp4")).expect("original").len(), 1024);
    assert!(media.join("ok-keep_trim_00-00-01_00-00-02.mp4").exists());
    assert_eq!(task.files.len(), 2);
}

#[test]
fn failed_trim_leaves_the_original_untouched() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = manager
        .add_task(AddTaskRequest {
            url: "https://video.test/ok-corrupt".to_string(),
            quality: Quality::P480,
            trim_end: Some("00:00:05".to_string()),
            trim_mode: TrimMode::Overwrite,
            ..AddTaskRequest::default()
        })
        .expect("add");
    idle(&manager);

    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::TrimFailed);
    assert!(task.error.is_some());
    let media = base.path().join("media");
    assert_eq!(std::fs::metadata(media.join("ok-corrupt.mp4")).expect("original").len(), 1024);
    assert!(!media.join("ok-corrupt.trimmed.mp4").exists());

    let err = manager.resume_task(&id);
    assert!(err.is_ok());
    assert_eq!(
        manager.get_task(&id).expect("task").status,
        TaskStatus::TrimFailed
    );
}

#[test]
fn playlist_children_run_and_update_the_parent() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 2);
    let items = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(i, name)| PlaylistItem {
            index: i as i64 + 1,
            title: format!("Part {name}"),
            url: format!("https://video.test/ok-part-{name}"),
            ..PlaylistItem::default()
        })
        .collect();
    let parent = manager
        .add_playlist(AddPlaylistRequest {
            url: "https://video.test/list".to_string(),
            title: Some("Some list".to_string()),
            items,
            ..AddPlaylistRequest::default()
        })
        .expect("add playlist");
    idle(&manager);

    let tasks = manager.list_tasks();
    let children: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.parent_id.as_deref() == Some(parent.as_str()))
        .collect();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|t| t.status == TaskStatus::Completed));

    let parent_task = manager.get_task(&parent).expect("parent");
    assert_eq!(parent_task.status, TaskStatus::Completed);
    assert_eq!(parent_task.current_item, 3);
    assert_eq!(parent_task.total_items, 3);
    assert_eq!(parent_task.progress, 100.0);
}

#[test]
fn delete_with_files_removes_outputs() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = add(&manager, "https://video.test/ok-gone");
    idle(&manager);
    let output = base.path().join("media").join("ok-gone.mp4");
    assert!(output.exists());
    let log_path = manager.get_task(&id).expect("task").log_path;
    assert!(Path::new(&log_path).exists());

    let deleted = manager.delete_task(&id, true).expect("delete");
    assert_eq!(deleted, vec![id.clone()]);
    manager.join_background();
    assert!(!output.exists());
    assert!(!Path::new(&log_path).exists());
    assert!(matches!(
        manager.delete_task(&id, true),
        Err(EngineError::TaskNotFound(_))
    ));
}

#[test]
fn deleting_mid_download_removes_partial_data() {
    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let id = add(&manager, "https://video.test/slow-partial");
    wait_for(&manager, &id, |t| {
        t.status == TaskStatus::Downloading && t.progress > 0.0
    });
    let media = base.path().join("media");
    assert!(media.join("slow-partial.mp4.part").exists());

    manager.delete_task(&id, true).expect("delete");
    manager.join_background();
    idle(&manager);

    let left: Vec<_> = std::fs::read_dir(&media)
        .expect("media dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    assert!(left.is_empty(), "leftovers: {left:?}");
}

#[test]
fn observers_hear_about_terminal_states() {
    #[derive(Default)]
    struct Counts {
        completed: AtomicUsize,
        failed: AtomicUsize,
    }

    impl TaskObserver for Counts {
        fn task_completed(&self, _task: &Task) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn task_failed(&self, _task: &Task) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    let base = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(base.path(), 3);
    let counts = Arc::new(Counts::default());
    manager.subscribe(counts.clone());

    add(&manager, "https://video.test/ok-seen");
    add(&manager, "https://video.test/fail-seen");
    idle(&manager);

    assert_eq!(counts.completed.load(Ordering::SeqCst), 1);
    assert_eq!(counts.failed.load(Ordering::SeqCst), 1);
}

#[test]
fn tasks_survive_a_reopen() {
    let base = tempfile::tempdir().expect("tempdir");
    let id = {
        let manager = open_manager(base.path(), 3);
        let id = add(&manager, "https://video.test/ok-persist");
        idle(&manager);
        id
    };

    let manager = open_manager(base.path(), 3);
    let task = manager.get_task(&id).expect("reloaded");
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.file_exists);
    assert_eq!(task.url, "https://video.test/ok-persist");
}

#[test]
fn media_toolkit_probes_and_clips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("talk.mkv");
    std::fs::write(&input, vec![7u8; 1024]).expect("write input");
    let ffmpeg = &fixtures().ffmpeg;

    let seconds = tubeq_engine::ffmpeg::probe_duration(ffmpeg, &input).expect("probe");
    assert_eq!(seconds, 65.5);

    let clip = tubeq_engine::ffmpeg::extract_clip(ffmpeg, &input, "00:00:10", "00:00:20")
        .expect("clip");
    assert_eq!(clip, dir.path().join("talk_clip_00-00-10_00-00-20.mkv"));
    assert_eq!(std::fs::metadata(&clip).expect("clip file").len(), 256);
    assert_eq!(std::fs::metadata(&input).expect("input").len(), 1024);
}

#[test]
fn shutdown_mid_download_comes_back_paused() {
    let base = tempfile::tempdir().expect("tempdir");
    let id = {
        let manager = open_manager(base.path(), 3);
        let id = add(&manager, "https://video.test/slow-shutdown");
        wait_for(&manager, &id, |t| {
            t.status == TaskStatus::Downloading && t.progress > 0.0
        });
        manager.shutdown();
        let started = Instant::now();
        while manager.has_cancel_handle(&id) {
            assert!(started.elapsed() < Duration::from_secs(10), "runner never finished");
            std::thread::sleep(Duration::from_millis(25));
        }
        id
    };

    let manager = open_manager(base.path(), 3);
    let task = manager.get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.progress, 5.0);
}
