// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Adapters presenting an inbound server as an outbound client
use futures::future::FutureExt;
use std::sync::{Arc, Weak};

use super::{
  merge_close, ChainError, ChainFuture, ClientNext, CloseAck, Context, NetworkServiceClient,
  NetworkServiceServer, NetworkServiceServerExt,
};
use crate::common::protocol::{Connection, NetworkServiceRequest};

async fn request_through(
  server: &dyn NetworkServiceServer,
  ctx: &Context,
  request: NetworkServiceRequest,
  next: ClientNext<'_>,
) -> Result<Connection, ChainError> {
  let preferences = request.mechanism_preferences.clone();
  let connection = server.call_request(ctx, request).await?;
  next
    .request(
      ctx,
      NetworkServiceRequest {
        connection,
        mechanism_preferences: preferences,
      },
    )
    .await
}

async fn close_through(
  server: &dyn NetworkServiceServer,
  ctx: &Context,
  connection: Connection,
  next: ClientNext<'_>,
) -> Result<CloseAck, ChainError> {
  let closed = server.call_close(ctx, connection.clone()).await;
  merge_close(closed, next.close(ctx, connection).await)
}

/// Enters a server's chain from the beginning, then continues with the client chain
pub struct ServerToClient {
  server: Arc<dyn NetworkServiceServer>,
}

impl ServerToClient {
  pub fn new(server: Arc<dyn NetworkServiceServer>) -> Self {
    Self { server }
  }
}

impl NetworkServiceClient for ServerToClient {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    request_through(self.server.as_ref(), ctx, request, next).boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    close_through(self.server.as_ref(), ctx, connection, next).boxed()
  }
}

/// A [`ServerToClient`] which does not keep its server alive
///
/// Outbound chains built by a server hold this to re-enter that same server when healing;
/// once the server has been dropped, calls fail with [`ChainError::Unavailable`].
#[derive(Clone)]
pub struct WeakServerToClient {
  server: Weak<dyn NetworkServiceServer>,
}

impl WeakServerToClient {
  pub fn new(server: Weak<dyn NetworkServiceServer>) -> Self {
    Self { server }
  }

  fn upgrade(&self) -> Result<Arc<dyn NetworkServiceServer>, ChainError> {
    self.server.upgrade().ok_or(ChainError::Unavailable)
  }
}

impl NetworkServiceClient for WeakServerToClient {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let server = self.upgrade()?;
      request_through(server.as_ref(), ctx, request, next).await
    }
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    async move {
      let server = self.upgrade()?;
      close_through(server.as_ref(), ctx, connection, next).await
    }
    .boxed()
  }
}
