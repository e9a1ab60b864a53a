// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Joining memif connections socket-to-socket when both sides negotiated memif
use futures::future::FutureExt;

use super::{DataplaneConfig, DirectMemif};
use crate::common::{
  chain::{
    ChainError, ChainFuture, CloseAck, Context, ContextValue, NetworkServiceServer, ServerNext,
  },
  mechanisms::{interface_key, Role},
  protocol::{mechanism::MEMIF, Connection, NetworkServiceRequest},
};

/// Present in a call's context when memif pairs may bypass vpp
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectMemifEnabled;

impl ContextValue for DirectMemifEnabled {}

/// Permits direct memif pairing for everything downstream
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectMemifServer;

impl NetworkServiceServer for DirectMemifServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let ctx = ctx.with_value(DirectMemifEnabled);
      next.request(&ctx, request).await
    }
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    async move {
      let ctx = ctx.with_value(DirectMemifEnabled);
      next.close(&ctx, connection).await
    }
    .boxed()
  }
}

/// Records a direct pairing when permitted and both connections selected memif
///
/// Returns whether the pair was joined directly; the requester-side vpp interface written
/// during selection is withdrawn, and the next-hop side is never written.
pub(crate) fn pair_direct(
  ctx: &Context,
  config: &DataplaneConfig,
  inbound: &Connection,
  outbound: &Connection,
) -> Result<bool, ChainError> {
  if ctx.value::<DirectMemifEnabled>().is_none() {
    return Ok(false);
  }
  let (server, client) = match (&inbound.mechanism, &outbound.mechanism) {
    (Some(server), Some(client)) if server.mechanism_type == MEMIF && client.mechanism_type == MEMIF => {
      (server, client)
    }
    _ => return Ok(false),
  };
  let name = interface_key(Role::Server, &inbound.id);
  config.remove_vpp_interface(&name);
  tracing::debug!(connection_id = %inbound.id, "Joining memif sockets directly");
  config.put_direct_memif(DirectMemif {
    name,
    peer: interface_key(Role::Client, &outbound.id),
    server_parameters: server.parameters.clone(),
    client_parameters: client.parameters.clone(),
  });
  Ok(true)
}
