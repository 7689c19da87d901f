// src/logging/runtime_logger.rs

use chrono::{FixedOffset, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Duration};
use tracing::{error, info, warn};
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::fmt::MakeWriter;

const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
const RETENTION_HOURS: u64 = 72;

/// 单条日志消息
pub struct LogEntry {
    pub level: String,
    pub content: String,
}

struct Tasks {
    stop: oneshot::Sender<()>,
    writer: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

/// 运行日志管理器
/// 按级别分流到不同的按小时滚动文件，后台批量写盘，并定期清理过期文件。
pub struct RuntimeLogger {
    sender: Sender<LogEntry>,
    tasks: Mutex<Option<Tasks>>,
}

fn timestamp() -> String {
    match FixedOffset::east_opt(8 * 3600) {
        Some(tz) => Utc::now().with_timezone(&tz).to_rfc3339(),
        None => Utc::now().to_rfc3339(),
    }
}

impl RuntimeLogger {
    /// - `log_dir`: 日志目录
    /// - `file_prefix`: 文件前缀，例如 "runtime"（文件名形如 runtime_info.json.2025-01-01-08）
    /// - `buffer_size`: 通道容量
    /// - `batch_size`: 每个级别缓冲多少条后写盘
    /// - `flush_interval`: 定时写盘间隔（毫秒）
    pub fn new(
        log_dir: &str,
        file_prefix: &str,
        buffer_size: usize,
        batch_size: usize,
        flush_interval: u64,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let mut log_files = HashMap::new();
        for level in LEVELS {
            let file_name = format!("{}_{}.json", file_prefix, level.to_lowercase());
            log_files.insert(level.to_string(), Arc::new(rolling::hourly(log_dir, &file_name)));
        }

        let (stop, stop_rx) = oneshot::channel();
        let writer = tokio::spawn(Self::background_log_writer(
            log_files,
            receiver,
            stop_rx,
            batch_size.max(1),
            flush_interval.max(1),
        ));
        let cleanup = {
            let log_dir = log_dir.to_string();
            tokio::spawn(async move {
                let cleanup_interval = Duration::from_secs(3600);
                loop {
                    Self::cleanup_old_logs(&log_dir, RETENTION_HOURS).await;
                    time::sleep(cleanup_interval).await;
                }
            })
        };

        Arc::new(Self {
            sender,
            tasks: Mutex::new(Some(Tasks { stop, writer, cleanup })),
        })
    }

    /// 记录一条运行日志
    pub async fn log(&self, level: &str, message: &str) {
        let content = json!({
            "timestamp": timestamp(),
            "level": level,
            "message": message
        })
        .to_string();

        let entry = LogEntry {
            level: level.to_uppercase(),
            content,
        };
        if let Err(e) = self.sender.send(entry).await {
            warn!(error = %e, "runtime logger channel closed");
        }
    }

    async fn background_log_writer(
        log_files: HashMap<String, Arc<RollingFileAppender>>,
        mut receiver: Receiver<LogEntry>,
        mut stop: oneshot::Receiver<()>,
        batch_size: usize,
        flush_interval: u64,
    ) {
        let mut buffers: HashMap<String, Vec<String>> = HashMap::new();
        let mut interval = time::interval(Duration::from_millis(flush_interval));
        loop {
            tokio::select! {
                Some(entry) = receiver.recv() => {
                    let buffer = buffers.entry(entry.level.clone()).or_default();
                    buffer.push(entry.content);
                    if buffer.len() >= batch_size {
                        if let Some(appender) = log_files.get(&entry.level) {
                            Self::write_logs_to_disk(appender.clone(), std::mem::take(buffer)).await;
                        } else {
                            buffer.clear();
                        }
                    }
                },
                _ = interval.tick() => {
                    Self::flush_all(&log_files, &mut buffers).await;
                },
                _ = &mut stop => {
                    while let Ok(entry) = receiver.try_recv() {
                        buffers.entry(entry.level).or_default().push(entry.content);
                    }
                    Self::flush_all(&log_files, &mut buffers).await;
                    return;
                }
            }
        }
    }

    async fn flush_all(log_files: &HashMap<String, Arc<RollingFileAppender>>, buffers: &mut HashMap<String, Vec<String>>) {
        for (level, buffer) in buffers.iter_mut() {
            if buffer.is_empty() {
                continue;
            }
            let lines = std::mem::take(buffer);
            if let Some(appender) = log_files.get(level) {
                Self::write_logs_to_disk(appender.clone(), lines).await;
            }
        }
    }

    async fn write_logs_to_disk(file: Arc<RollingFileAppender>, lines: Vec<String>) {
        let content = lines.join("\n") + "\n";
        let written = task::spawn_blocking(move || {
            let mut writer = file.make_writer();
            writer.write_all(content.as_bytes())
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failed to write runtime logs"),
            Err(e) => error!(error = %e, "runtime log writer task failed"),
        }
    }

    async fn cleanup_old_logs(log_dir: &str, retention_hours: u64) {
        let retention = StdDuration::from_secs(retention_hours * 3600);
        let now = SystemTime::now();
        let mut dir = match tokio::fs::read_dir(log_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(log_dir, error = %e, "failed to read log directory");
                return;
            }
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() <= retention {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "deleted old log file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to delete old log file"),
            }
        }
    }

    /// 写出缓冲中的日志并停止后台任务。重复调用无副作用
    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            return;
        };
        tasks.cleanup.abort();
        let _ = tasks.stop.send(());
        if let Err(e) = tasks.writer.await {
            error!(error = %e, "runtime log writer did not stop cleanly");
        }
    }
}
