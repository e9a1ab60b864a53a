// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{backtrace::Backtrace, fmt, panic::Location, sync::Arc, time::Duration};

use crate::common::netns::ResolveError;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Where an error crossed a delegation boundary, with a backtrace when capture is enabled
#[derive(Clone)]
pub struct Provenance {
  location: &'static Location<'static>,
  backtrace: Arc<Backtrace>,
}

impl Provenance {
  #[track_caller]
  pub fn capture() -> Self {
    Self {
      location: Location::caller(),
      backtrace: Arc::new(Backtrace::capture()),
    }
  }

  pub fn location(&self) -> &'static Location<'static> {
    self.location
  }

  pub fn backtrace(&self) -> &Backtrace {
    &self.backtrace
  }
}

impl fmt::Debug for Provenance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Provenance")
      .field("location", &format_args!("{}", self.location))
      .finish_non_exhaustive()
  }
}

impl fmt::Display for Provenance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self.location, f)
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ChainError {
  #[error("Request denied by authorization policy: {reason}")]
  PolicyDenied { reason: String },
  #[error("Authorization policy could not be evaluated")]
  Authorization(#[source] BoxedError),
  #[error("No supported mechanism among offered preferences {offered:?}")]
  NegotiationFailed { offered: Vec<String> },
  #[error("Network namespace {identity:?} could not be resolved")]
  ResolutionFailed {
    identity: String,
    #[source]
    source: ResolveError,
  },
  #[error("Delegated call failed (observed at {provenance})")]
  DelegationFailed {
    provenance: Provenance,
    #[source]
    source: Box<ChainError>,
  },
  #[error("Dataplane agent rejected configuration")]
  Commit(#[source] BoxedError),
  #[error("Initial dataplane configuration failed")]
  Initialization(#[source] BoxedError),
  #[error("Transport to {url} failed")]
  Transport {
    url: String,
    #[source]
    source: BoxedError,
  },
  #[error("Call was cancelled")]
  Cancelled,
  #[error("Call timed out after {0:?}")]
  TimedOut(Duration),
  #[error("Required context value {0} was not present")]
  MissingContext(&'static str),
  #[error("Chain target is no longer available")]
  Unavailable,
}

impl ChainError {
  /// Wraps an error returned by a delegated call, recording the caller's location
  ///
  /// Errors already wrapped further down the chain are returned unchanged, so the
  /// recorded provenance is always the hop closest to the failure.
  #[track_caller]
  pub fn delegation(source: ChainError) -> Self {
    match source {
      wrapped @ ChainError::DelegationFailed { .. } => wrapped,
      source => ChainError::DelegationFailed {
        provenance: Provenance::capture(),
        source: Box::new(source),
      },
    }
  }

  pub fn root_cause(&self) -> &ChainError {
    match self {
      ChainError::DelegationFailed { source, .. } => source.root_cause(),
      other => other,
    }
  }

  pub fn provenance(&self) -> Option<&Provenance> {
    match self {
      ChainError::DelegationFailed { provenance, .. } => Some(provenance),
      _ => None,
    }
  }

  pub fn is_policy_denied(&self) -> bool {
    matches!(self.root_cause(), ChainError::PolicyDenied { .. })
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self.root_cause(), ChainError::Cancelled)
  }

  /// Whether repeating the same request may succeed without the caller changing it
  pub fn is_retryable(&self) -> bool {
    match self.root_cause() {
      ChainError::TimedOut(_)
      | ChainError::Transport { .. }
      | ChainError::Unavailable
      | ChainError::Commit(_)
      | ChainError::Initialization(_)
      | ChainError::ResolutionFailed { .. } => true,
      ChainError::PolicyDenied { .. }
      | ChainError::Authorization(_)
      | ChainError::NegotiationFailed { .. }
      | ChainError::Cancelled
      | ChainError::MissingContext(_)
      | ChainError::DelegationFailed { .. } => false,
    }
  }
}
