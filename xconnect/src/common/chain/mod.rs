// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Chain-of-responsibility plumbing shared by inbound and outbound handlers
//!
//! Every handler receives the call alongside a [`Next`] continuation; it may act before
//! delegating, after delegating, or instead of delegating. Request phases stop at the first
//! handler which fails or declines to delegate. Close phases always reach every handler.
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::common::protocol::{Connection, NetworkServiceRequest};

pub mod adapters;
pub mod context;
mod dispatch;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{Context, ContextValue};
pub use dispatch::{Chain, ClientChain, ClientNext, Element, Next, ServerChain, ServerNext};
pub use error::ChainError;

pub type ChainFuture<'a, T> = BoxFuture<'a, Result<T, ChainError>>;

/// Outcome of a successful close, carrying cleanup failures which did not fail the close
#[derive(Debug, Clone, Default)]
pub struct CloseAck {
  warnings: Vec<Arc<ChainError>>,
}

impl CloseAck {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_warning(mut self, warning: ChainError) -> Self {
    self.warnings.push(Arc::new(warning));
    self
  }

  pub fn merge(mut self, other: CloseAck) -> Self {
    self.warnings.extend(other.warnings);
    self
  }

  pub fn warnings(&self) -> &[Arc<ChainError>] {
    &self.warnings
  }

  pub fn is_clean(&self) -> bool {
    self.warnings.is_empty()
  }
}

/// Combines two close outcomes in the order they completed; the earlier error wins
pub fn merge_close(
  first: Result<CloseAck, ChainError>,
  second: Result<CloseAck, ChainError>,
) -> Result<CloseAck, ChainError> {
  match (first, second) {
    (Ok(first), Ok(second)) => Ok(first.merge(second)),
    (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
    (Err(e), Err(suppressed)) => {
      tracing::warn!(error = %suppressed, "Suppressing later close failure");
      Err(e)
    }
  }
}

/// Applies the cleanup policy for handlers which release local state around a delegated close
///
/// A delegation error is reported as the close's error; a cleanup error alongside a
/// successful delegation is demoted to a warning on the acknowledgement.
pub fn close_with_cleanup(
  delegated: Result<CloseAck, ChainError>,
  cleanup: Result<(), ChainError>,
) -> Result<CloseAck, ChainError> {
  match (delegated, cleanup) {
    (delegated, Ok(())) => delegated,
    (Ok(ack), Err(cleanup)) => {
      tracing::warn!(error = %cleanup, "Local cleanup failed during close");
      Ok(ack.with_warning(cleanup))
    }
    (Err(e), Err(cleanup)) => {
      tracing::warn!(error = %cleanup, delegation_error = %e, "Local cleanup failed during failed close");
      Err(e)
    }
  }
}

/// An inbound handler, invoked by callers requesting a network service from this process
pub trait NetworkServiceServer: Send + Sync {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection>;

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck>;
}

/// An outbound handler, invoked on the way to the next hop
pub trait NetworkServiceClient: Send + Sync {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection>;

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, CloseAck>;
}

/// Entry points for invoking a server as the outermost element of a call
pub trait NetworkServiceServerExt: NetworkServiceServer {
  fn call_request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
  ) -> ChainFuture<'a, Connection> {
    self.request(ctx, request, Next::end())
  }

  fn call_close<'a>(&'a self, ctx: &'a Context, connection: Connection) -> ChainFuture<'a, CloseAck> {
    self.close(ctx, connection, Next::end())
  }
}

impl<T: NetworkServiceServer + ?Sized> NetworkServiceServerExt for T {}

/// Entry points for invoking a client as the outermost element of a call
pub trait NetworkServiceClientExt: NetworkServiceClient {
  fn call_request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
  ) -> ChainFuture<'a, Connection> {
    self.request(ctx, request, Next::end())
  }

  fn call_close<'a>(&'a self, ctx: &'a Context, connection: Connection) -> ChainFuture<'a, CloseAck> {
    self.close(ctx, connection, Next::end())
  }
}

impl<T: NetworkServiceClient + ?Sized> NetworkServiceClientExt for T {}
