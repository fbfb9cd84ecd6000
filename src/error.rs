//! Fault taxonomy for everything the engine can get wrong.
//!
//! Every remote outcome is classified into exactly one of these variants so
//! the read/write policies can decide what to absorb and what to surface.

use std::collections::HashMap;

use thiserror::Error;

/// Classified failure of an engine operation.
#[derive(Debug, Error)]
pub enum Fault {
  /// No network attempt was made because the connectivity monitor reports
  /// the server as unreachable.
  #[error("offline - no connection to the server")]
  Offline,

  /// An attempt was made but failed at the transport layer. Timeouts land
  /// here too.
  #[error("network error: {0}")]
  Network(String),

  /// The server responded with a non-2xx status. Carries the structured
  /// field-level error map when the server sent one.
  #[error("api error ({status}): {message}")]
  Api {
    status: u16,
    message: String,
    errors: Option<HashMap<String, Vec<String>>>,
  },

  /// A response body was present but malformed. Read paths degrade this to
  /// "no body" before it reaches a caller.
  #[error("unparseable response body: {0}")]
  Parse(String),

  /// The local database or credential storage failed.
  #[error("storage error: {0}")]
  Storage(String),
}

impl Fault {
  pub fn api(status: u16, message: impl Into<String>) -> Self {
    Fault::Api {
      status,
      message: message.into(),
      errors: None,
    }
  }

  pub fn storage(report: color_eyre::Report) -> Self {
    Fault::Storage(format!("{report:#}"))
  }

  /// True for the faults that mean "the server was never reached" - the
  /// write path converts exactly these into queued optimistic results.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Fault::Offline | Fault::Network(_))
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      Fault::Api { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Human-readable fallback when a non-2xx response carries no structured
  /// error body.
  pub fn fallback_message(status: u16) -> &'static str {
    match status {
      400 => "Validation failed",
      401 => "Invalid credentials",
      403 => "Access denied",
      404 => "Resource not found",
      500 => "An unexpected error occurred. Please try again later.",
      s if (400..500).contains(&s) => "Request failed",
      s if s >= 500 => "Server error",
      _ => "An error occurred",
    }
  }
}

impl From<reqwest::Error> for Fault {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      Fault::Network("request timed out".to_string())
    } else {
      Fault::Network(err.to_string())
    }
  }
}
