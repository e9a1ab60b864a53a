// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;

use crate::common::{
  chain::{ChainError, ChainFuture, CloseAck, Context, NetworkServiceServer, ServerNext},
  protocol::{Connection, NetworkServiceRequest},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
  Allow,
  Deny(String),
}

/// Policy deciding whether a request may proceed
#[cfg_attr(test, mockall::automock)]
pub trait Authorizer: Send + Sync {
  fn authorize(&self, request: &NetworkServiceRequest) -> BoxFuture<'static, anyhow::Result<Decision>>;
}

impl<F> Authorizer for F
where
  F: Fn(&NetworkServiceRequest) -> Decision + Send + Sync,
{
  fn authorize(&self, request: &NetworkServiceRequest) -> BoxFuture<'static, anyhow::Result<Decision>> {
    future::ready(Ok(self(request))).boxed()
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
  fn authorize(&self, _request: &NetworkServiceRequest) -> BoxFuture<'static, anyhow::Result<Decision>> {
    future::ready(Ok(Decision::Allow)).boxed()
  }
}

/// Rejects denied requests before any other handler runs; closes always pass
pub struct AuthorizeServer {
  authorizer: Arc<dyn Authorizer>,
}

impl AuthorizeServer {
  pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
    Self { authorizer }
  }
}

impl NetworkServiceServer for AuthorizeServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      match self.authorizer.authorize(&request).await {
        Ok(Decision::Allow) => next.request(ctx, request).await,
        Ok(Decision::Deny(reason)) => {
          tracing::info!(connection_id = %request.connection.id, %reason, "Request denied by policy");
          Err(ChainError::PolicyDenied { reason })
        }
        Err(e) => Err(ChainError::Authorization(e.into())),
      }
    }
    .boxed()
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
