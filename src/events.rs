use crate::task::Task;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

/// Receives everything a front end needs to render the queue.
pub trait EventSink: Send + Sync {
    fn emit_task_snapshot(&self, task: &Task);

    /// `ephemeral` lines (in-place progress) are not in the task's text log.
    fn emit_log_line(&self, task_id: &str, message: &str, ephemeral: bool);
}

/// Completion hooks, e.g. for feed bookkeeping or desktop notifications.
pub trait TaskObserver: Send + Sync {
    fn task_completed(&self, _task: &Task) {}

    fn task_failed(&self, _task: &Task) {}
}

pub struct NullSink;

impl EventSink for NullSink {
    fn emit_task_snapshot(&self, _task: &Task) {}

    fn emit_log_line(&self, _task_id: &str, _message: &str, _ephemeral: bool) {}
}

pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit_task_snapshot(&self, task: &Task) {
        tracing::debug!(
            task_id = %task.id,
            status = %task.status,
            progress = task.progress,
            "task snapshot"
        );
    }

    fn emit_log_line(&self, task_id: &str, message: &str, ephemeral: bool) {
        if !ephemeral {
            tracing::info!(task_id, "{message}");
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Snapshot(Task),
    Log {
        task_id: String,
        message: String,
        ephemeral: bool,
    },
}

/// Forwards events over a channel; a dropped receiver silently discards them.
pub struct ChannelSink {
    tx: Mutex<Sender<EngineEvent>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<EngineEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, event: EngineEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

impl EventSink for ChannelSink {
    fn emit_task_snapshot(&self, task: &Task) {
        self.send(EngineEvent::Snapshot(task.clone()));
    }

    fn emit_log_line(&self, task_id: &str, message: &str, ephemeral: bool) {
        self.send(EngineEvent::Log {
            task_id: task_id.to_string(),
            message: message.to_string(),
            ephemeral,
        });
    }
}
