// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::FutureExt;
use std::sync::Arc;
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::common::{
  authorization::{AuthorizeServer, Authorizer},
  chain::{ChainFuture, CloseAck, Context, NetworkServiceServer, ServerChain, ServerNext},
  protocol::{Connection, NetworkServiceRequest},
};

/// Assigns a fresh id to connections which arrive without one
#[derive(Debug, Default, Clone, Copy)]
pub struct SetIdServer;

impl NetworkServiceServer for SetIdServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    mut request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    if request.connection.id.is_empty() {
      request.connection.id = Uuid::new_v4().to_string();
      tracing::trace!(connection_id = %request.connection.id, "Assigned connection id");
    }
    next.request(ctx, request)
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    next.close(ctx, connection)
  }
}

/// A named server chain behind the standard prologue of authorization and id assignment
pub struct Endpoint {
  name: String,
  chain: ServerChain,
}

impl Endpoint {
  pub fn new<S: Into<String>>(
    name: S,
    authorizer: Arc<dyn Authorizer>,
    functionality: Vec<Arc<dyn NetworkServiceServer>>,
  ) -> Self {
    let mut elements: Vec<Arc<dyn NetworkServiceServer>> = Vec::with_capacity(functionality.len() + 2);
    elements.push(Arc::new(AuthorizeServer::new(authorizer)));
    elements.push(Arc::new(SetIdServer));
    elements.extend(functionality);
    Self {
      name: name.into(),
      chain: ServerChain::new(elements),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl NetworkServiceServer for Endpoint {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    let span = tracing::debug_span!(
      "request",
      endpoint = %self.name,
      connection_id = %request.connection.id
    );
    self.chain.request(ctx, request, next).instrument(span).boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    let span = tracing::debug_span!("close", endpoint = %self.name, connection_id = %connection.id);
    self.chain.close(ctx, connection, next).instrument(span).boxed()
  }
}
