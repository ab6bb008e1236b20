//! Structured logging substrate shared by every front-end and the admission
//! controller. Mirrors the reference codebase's channel-backed error logger:
//! callers never block on I/O, a single background task owns stderr.

use async_channel::{Receiver, Sender};
use chrono::Local;
use std::fmt;

/// Severity of a log line, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Notice,
  Warn,
  Error,
}

impl fmt::Display for LogLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LogLevel::Trace => "TRACE",
      LogLevel::Debug => "DEBUG",
      LogLevel::Info => "INFO",
      LogLevel::Notice => "NOTICE",
      LogLevel::Warn => "WARN",
      LogLevel::Error => "ERROR",
    };
    f.write_str(s)
  }
}

/// A single rendered log line, passed across the channel to the writer task.
#[derive(Debug, Clone)]
pub struct LogMessage {
  pub level: LogLevel,
  pub message: String,
}

impl LogMessage {
  pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
    Self {
      level,
      message: message.into(),
    }
  }
}

/// Cheaply cloneable handle threaded through admission, pump, and proxy code.
///
/// Cloning just clones the channel sender; dropping the last sender ends the
/// writer task. A logger with no sender (`None`) silently discards messages,
/// which keeps unit tests free of a background task.
#[derive(Clone)]
pub struct ErrorLogger {
  sender: Option<Sender<LogMessage>>,
  min_level: LogLevel,
}

impl ErrorLogger {
  pub fn new(sender: Sender<LogMessage>, min_level: LogLevel) -> Self {
    Self {
      sender: Some(sender),
      min_level,
    }
  }

  /// A logger that discards every message. Used in tests and standalone
  /// library use where no writer task has been spawned.
  pub fn discard() -> Self {
    Self {
      sender: None,
      min_level: LogLevel::Error,
    }
  }

  pub async fn log_at(&self, level: LogLevel, message: impl Into<String>) {
    if level < self.min_level {
      return;
    }
    if let Some(sender) = &self.sender {
      // A full channel means the writer task is behind; drop rather than
      // block the hot path on logging.
      let _ = sender.try_send(LogMessage::new(level, message));
    }
  }

  pub async fn log(&self, message: impl Into<String>) {
    self.log_at(LogLevel::Error, message).await;
  }

  pub async fn trace(&self, message: impl Into<String>) {
    self.log_at(LogLevel::Trace, message).await;
  }

  pub async fn notice(&self, message: impl Into<String>) {
    self.log_at(LogLevel::Notice, message).await;
  }

  pub async fn warn(&self, message: impl Into<String>) {
    self.log_at(LogLevel::Warn, message).await;
  }
}

/// Spawns the background writer task and returns the `ErrorLogger` handle
/// callers should clone and pass down into connection tasks.
pub fn start_logger(min_level: LogLevel) -> ErrorLogger {
  let (sender, receiver) = async_channel::unbounded();
  tokio::spawn(drain(receiver));
  ErrorLogger::new(sender, min_level)
}

async fn drain(receiver: Receiver<LogMessage>) {
  while let Ok(message) = receiver.recv().await {
    let now = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    eprintln!("[{now}] {:<6} {}", message.level.to_string(), message.message);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn discard_logger_never_panics() {
    let logger = ErrorLogger::discard();
    logger.log("ignored").await;
    logger.trace("ignored").await;
  }

  #[tokio::test]
  async fn messages_below_min_level_are_dropped() {
    let (sender, receiver) = async_channel::unbounded();
    let logger = ErrorLogger::new(sender, LogLevel::Warn);
    logger.trace("should not appear").await;
    logger.warn("should appear").await;
    drop(logger);
    let mut seen = Vec::new();
    while let Ok(msg) = receiver.try_recv() {
      seen.push(msg.message);
    }
    assert_eq!(seen, vec!["should appear".to_string()]);
  }
}
