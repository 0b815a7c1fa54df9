use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Shell events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// One line of user input
  Line(String),
  /// Periodic tick for query polling and cache housekeeping
  Tick,
  /// Input closed
  Eof,
}

/// Event handler that produces events from line input and a tick timer
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Read lines from stdin, ticking at the given rate
  pub fn new(tick_rate: Duration) -> Self {
    Self::from_reader(tokio::io::stdin(), tick_rate)
  }

  pub fn from_reader<R>(reader: R, tick_rate: Duration) -> Self
  where
    R: AsyncRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn line reader
    let line_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(reader).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line_tx.send(Event::Line(line)).is_err() {
              break;
            }
          }
          Ok(None) | Err(_) => {
            let _ = line_tx.send(Event::Eof);
            break;
          }
        }
      }
    });

    // Spawn ticker
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_lines_then_eof() {
    let mut events = EventHandler::from_reader(&b"brands list\n\nq\n"[..], Duration::from_secs(3600));

    let mut lines = Vec::new();
    while let Some(event) = events.next().await {
      match event {
        Event::Line(line) => lines.push(line),
        Event::Tick => {}
        Event::Eof => break,
      }
    }
    assert_eq!(lines, vec!["brands list", "", "q"]);
  }
}
