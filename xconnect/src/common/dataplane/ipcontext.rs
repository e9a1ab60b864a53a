// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::FutureExt;

use super::DataplaneConfig;
use crate::common::{
  chain::{ChainFuture, CloseAck, Context, NetworkServiceServer, ServerNext},
  mechanisms::{interface_key, Role},
  protocol::{Connection, NetworkServiceRequest},
};

/// Assigns the requester-side address from the connection's ip context to its kernel interface
#[derive(Debug, Default, Clone, Copy)]
pub struct IpAddressServer;

impl NetworkServiceServer for IpAddressServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let config = DataplaneConfig::from_context(ctx)?;
      let connection = &request.connection;
      if let Some(address) = connection.context.ip_context.src_ip_addr.as_ref() {
        let key = interface_key(Role::Server, &connection.id);
        if config.update_linux_interface(&key, |iface| iface.ip_addresses = vec![address.clone()]) {
          tracing::trace!(interface = %key, %address, "Assigned interface address");
        }
      }
      next.request(ctx, request).await
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

/// Installs the requester-side routes from the connection's ip context
#[derive(Debug, Default, Clone, Copy)]
pub struct RoutesServer;

impl NetworkServiceServer for RoutesServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let config = DataplaneConfig::from_context(ctx)?;
      let connection = &request.connection;
      let routes = &connection.context.ip_context.src_routes;
      if !routes.is_empty() {
        let key = interface_key(Role::Server, &connection.id);
        config.update_linux_interface(&key, |iface| iface.routes = routes.clone());
      }
      next.request(ctx, request).await
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
