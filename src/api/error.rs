//! Classified transport errors.

use std::fmt;

use thiserror::Error;

/// The REST operation a request performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  List,
  Create,
  Update,
  Delete,
  Chat,
}

impl Operation {
  /// Progressive verb used in default error messages ("Error creating brand").
  pub fn verb(self) -> &'static str {
    match self {
      Self::List => "loading",
      Self::Create => "creating",
      Self::Update => "updating",
      Self::Delete => "deleting",
      Self::Chat => "sending",
    }
  }

  /// Past participle used in success messages ("Brand created successfully!").
  pub fn past(self) -> &'static str {
    match self {
      Self::List => "loaded",
      Self::Create => "created",
      Self::Update => "updated",
      Self::Delete => "deleted",
      Self::Chat => "sent",
    }
  }
}

/// What a failed request was trying to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
  /// Singular entity name, e.g. "brand"
  pub entity: &'static str,
  pub operation: Operation,
  pub id: Option<String>,
}

impl RequestContext {
  pub fn new(entity: &'static str, operation: Operation) -> Self {
    Self {
      entity,
      operation,
      id: None,
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }

  /// Generic user-facing message for this request failing.
  pub fn default_message(&self) -> String {
    match self.operation {
      Operation::List => format!("Error loading {}s", self.entity),
      Operation::Chat => "Error sending message".to_string(),
      op => format!("Error {} {}", op.verb(), self.entity),
    }
  }
}

impl fmt::Display for RequestContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let op = match self.operation {
      Operation::List => "list",
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Delete => "delete",
      Operation::Chat => "chat",
    };
    write!(f, "{} {}", op, self.entity)?;
    if let Some(id) = &self.id {
      write!(f, " {}", id)?;
    }
    Ok(())
  }
}

/// Error classes that drive retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// No response was received
  Network,
  /// 4xx other than 408/429
  Client,
  /// 408 or 429
  Throttled,
  /// 5xx and any other unexpected status
  Server,
  /// The response body didn't match the expected shape
  Decode,
  /// Rejected before a request was made
  Invalid,
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
  #[error("{context}: request failed: {message}")]
  Network {
    context: RequestContext,
    message: String,
  },

  #[error("{context}: HTTP {status}{}", .message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default())]
  Status {
    context: RequestContext,
    status: u16,
    /// `message` field of the error body, when the server sent one
    message: Option<String>,
  },

  #[error("{context}: unexpected response body: {message}")]
  Decode {
    context: RequestContext,
    message: String,
  },

  #[error("{context}: {message}")]
  Invalid {
    context: RequestContext,
    message: String,
  },
}

impl ApiError {
  pub fn context(&self) -> &RequestContext {
    match self {
      Self::Network { context, .. }
      | Self::Status { context, .. }
      | Self::Decode { context, .. }
      | Self::Invalid { context, .. } => context,
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Network { .. } => ErrorKind::Network,
      Self::Status { status, .. } => classify_status(*status),
      Self::Decode { .. } => ErrorKind::Decode,
      Self::Invalid { .. } => ErrorKind::Invalid,
    }
  }

  /// Whether a read that failed this way may be attempted again.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self.kind(),
      ErrorKind::Network | ErrorKind::Throttled | ErrorKind::Server
    )
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Message shown to the user: the server's message when it sent one,
  /// otherwise the per-operation default.
  pub fn user_message(&self) -> String {
    match self {
      Self::Status {
        message: Some(message),
        ..
      } if !message.trim().is_empty() => message.clone(),
      Self::Invalid { message, .. } => message.clone(),
      other => other.context().default_message(),
    }
  }
}

/// Map an HTTP status code to its error class.
pub fn classify_status(status: u16) -> ErrorKind {
  match status {
    408 | 429 => ErrorKind::Throttled,
    400..=499 => ErrorKind::Client,
    _ => ErrorKind::Server,
  }
}
