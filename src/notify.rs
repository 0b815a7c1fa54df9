//! User-facing outcome notifications for writes.

use std::io::Write;

/// Receives one message per finished write.
pub trait Notifier: Send + Sync {
  fn success(&self, message: &str);
  fn error(&self, message: &str);
}

/// Prints successes to stdout and failures to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
  fn success(&self, message: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "✓ {}", message);
  }

  fn error(&self, message: &str) {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "✗ {}", message);
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use std::sync::Mutex;

  use super::Notifier;

  #[derive(Debug, Clone, PartialEq, Eq)]
  pub enum Notification {
    Success(String),
    Error(String),
  }

  /// Notifier that remembers everything it was told.
  #[derive(Debug, Default)]
  pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
  }

  impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
      self.events.lock().unwrap().clone()
    }
  }

  impl Notifier for RecordingNotifier {
    fn success(&self, message: &str) {
      self
        .events
        .lock()
        .unwrap()
        .push(Notification::Success(message.to_string()));
    }

    fn error(&self, message: &str) {
      self
        .events
        .lock()
        .unwrap()
        .push(Notification::Error(message.to_string()));
    }
  }
}
