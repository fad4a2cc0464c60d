pub mod cmd;
pub mod config;
mod db;
pub mod deps;
mod error;
pub mod events;
pub mod ffmpeg;
pub mod format;
pub mod logging;
pub mod manager;
pub mod parser;
pub mod paths;
pub mod process;
pub mod runner;
pub mod store;
pub mod task;
pub mod task_log;
pub mod trim;
pub mod ytdlp;

pub use error::{EngineError, Result};
pub use manager::TaskManager;
pub use parser::{classify_line, OutputLine, ProgressTracker};
pub use task::{AddPlaylistRequest, AddTaskRequest, Quality, Task, TaskStatus, TrimMode};
