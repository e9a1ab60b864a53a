// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{self, FutureExt};
use std::{
  fmt,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use super::{
  merge_close, ChainFuture, CloseAck, Context, NetworkServiceClient, NetworkServiceServer,
};
use crate::common::protocol::{Connection, NetworkServiceRequest};

/// Uniform invocation over the handler trait objects a [`Chain`] may hold
pub trait Element: Send + Sync + 'static {
  fn element_request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: Next<'a, Self>,
  ) -> ChainFuture<'a, Connection>;

  fn element_close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: Next<'a, Self>,
  ) -> ChainFuture<'a, CloseAck>;
}

impl Element for dyn NetworkServiceServer {
  fn element_request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    self.request(ctx, request, next)
  }

  fn element_close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    self.close(ctx, connection, next)
  }
}

impl Element for dyn NetworkServiceClient {
  fn element_request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    self.request(ctx, request, next)
  }

  fn element_close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    self.close(ctx, connection, next)
  }
}

/// Continuation to the remainder of a chain
///
/// Holds the handlers after the current one, and when the chain is itself nested inside
/// another chain, the continuation of that outer chain. Reaching the end of the outermost
/// chain returns the request's connection unchanged, or a clean acknowledgement for close.
pub struct Next<'a, E: ?Sized> {
  elements: &'a [Arc<E>],
  outer: Option<&'a Next<'a, E>>,
  delegated: Option<&'a AtomicBool>,
}

pub type ServerNext<'a> = Next<'a, dyn NetworkServiceServer>;
pub type ClientNext<'a> = Next<'a, dyn NetworkServiceClient>;

impl<'a, E: ?Sized> Clone for Next<'a, E> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<'a, E: ?Sized> Copy for Next<'a, E> {}

impl<'a, E: ?Sized> fmt::Debug for Next<'a, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Next")
      .field("remaining", &self.elements.len())
      .field("nested", &self.outer.is_some())
      .finish()
  }
}

impl<'a, E: Element + ?Sized> Next<'a, E> {
  /// A continuation with nothing after it
  pub fn end() -> Self {
    Self {
      elements: &[],
      outer: None,
      delegated: None,
    }
  }

  fn mark_delegated(&self) {
    if let Some(flag) = self.delegated {
      flag.store(true, Ordering::Release);
    }
  }

  pub fn request(self, ctx: &'a Context, request: NetworkServiceRequest) -> ChainFuture<'a, Connection> {
    self.mark_delegated();
    match self.elements.split_first() {
      Some((head, rest)) => head.element_request(
        ctx,
        request,
        Next {
          elements: rest,
          outer: self.outer,
          delegated: None,
        },
      ),
      None => match self.outer {
        Some(outer) => outer.request(ctx, request),
        None => future::ready(Ok(request.connection)).boxed(),
      },
    }
  }

  /// Continues a close through every remaining handler
  ///
  /// A handler which returns without delegating has its result kept, and the handlers
  /// after it are still closed; the first error observed becomes the result.
  pub fn close(self, ctx: &'a Context, connection: Connection) -> ChainFuture<'a, CloseAck> {
    self.mark_delegated();
    let Next {
      elements, outer, ..
    } = self;
    async move {
      let (head, rest) = match elements.split_first() {
        Some(split) => split,
        None => {
          return match outer {
            Some(outer) => outer.close(ctx, connection).await,
            None => Ok(CloseAck::default()),
          }
        }
      };
      let delegated = AtomicBool::new(false);
      let result = head
        .element_close(
          ctx,
          connection.clone(),
          Next {
            elements: rest,
            outer,
            delegated: Some(&delegated),
          },
        )
        .await;
      if delegated.load(Ordering::Acquire) {
        return result;
      }
      tracing::trace!(
        remaining = rest.len(),
        "Close was not delegated; continuing with remaining handlers"
      );
      let remainder = Next {
        elements: rest,
        outer,
        delegated: None,
      }
      .close(ctx, connection)
      .await;
      merge_close(result, remainder)
    }
    .boxed()
  }
}

/// An ordered sequence of handlers, itself usable as a handler of the same kind
pub struct Chain<E: ?Sized> {
  elements: Vec<Arc<E>>,
}

pub type ServerChain = Chain<dyn NetworkServiceServer>;
pub type ClientChain = Chain<dyn NetworkServiceClient>;

impl<E: ?Sized> Chain<E> {
  pub fn new(elements: Vec<Arc<E>>) -> Self {
    Self { elements }
  }

  pub fn len(&self) -> usize {
    self.elements.len()
  }

  pub fn is_empty(&self) -> bool {
    self.elements.is_empty()
  }
}

impl<E: Element + ?Sized> Chain<E> {
  fn dispatch_request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: Next<'a, E>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let inner = Next {
        elements: &self.elements,
        outer: Some(&next),
        delegated: None,
      };
      inner.request(ctx, request).await
    }
    .boxed()
  }

  fn dispatch_close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: Next<'a, E>,
  ) -> ChainFuture<'a, CloseAck> {
    async move {
      let inner = Next {
        elements: &self.elements,
        outer: Some(&next),
        delegated: None,
      };
      inner.close(ctx, connection).await
    }
    .boxed()
  }
}

impl<E: ?Sized> fmt::Debug for Chain<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Chain")
      .field("len", &self.elements.len())
      .finish()
  }
}

impl NetworkServiceServer for ServerChain {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    self.dispatch_request(ctx, request, next)
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    self.dispatch_close(ctx, connection, next)
  }
}

impl NetworkServiceClient for ClientChain {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    self.dispatch_request(ctx, request, next)
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    self.dispatch_close(ctx, connection, next)
  }
}
