// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::FutureExt;

use super::{directmemif::pair_direct, DataplaneConfig, L2XConnect};
use crate::common::{
  chain::{
    close_with_cleanup, ChainError, ChainFuture, ClientNext, CloseAck, Context,
    NetworkServiceClient,
  },
  connect::InboundRequest,
  mechanisms::{interface_key, Role},
  protocol::{Connection, NetworkServiceRequest},
};

/// Binds the inbound connection's interface to the outbound connection's, in both directions
///
/// Memif pairs joined directly are left unbound.
#[derive(Debug, Default, Clone, Copy)]
pub struct L2XConnectClient;

impl L2XConnectClient {
  fn bind(ctx: &Context, outbound: &Connection) -> Result<(), ChainError> {
    let inbound = ctx.require::<InboundRequest>()?;
    let config = DataplaneConfig::from_context(ctx)?;
    if pair_direct(ctx, config, inbound.connection(), outbound)? {
      return Ok(());
    }
    let server_side = interface_key(Role::Server, &inbound.connection().id);
    let client_side = interface_key(Role::Client, &outbound.id);
    config.put_xconnect(L2XConnect {
      receive: server_side.clone(),
      transmit: client_side.clone(),
    });
    config.put_xconnect(L2XConnect {
      receive: client_side,
      transmit: server_side,
    });
    Ok(())
  }
}

impl NetworkServiceClient for L2XConnectClient {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let connection = next.request(ctx, request).await?;
      Self::bind(ctx, &connection)?;
      Ok(connection)
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
      let delegated = next.close(ctx, connection.clone()).await;
      close_with_cleanup(delegated, Self::bind(ctx, &connection))
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::common::chain::{testing::CapturingClient, ClientChain, NetworkServiceClientExt};

  #[tokio::test]
  async fn binds_both_directions_after_delegation() {
    let config = Arc::new(DataplaneConfig::new());
    let ctx = Context::new()
      .with_shared_value(config.clone())
      .with_value(InboundRequest::new(NetworkServiceRequest::new(
        Connection::new("in"),
      )));
    let chain = ClientChain::new(vec![
      Arc::new(L2XConnectClient),
      Arc::new(CapturingClient::echo()),
    ]);
    chain
      .call_request(&ctx, NetworkServiceRequest::new(Connection::new("out")))
      .await
      .unwrap();
    let snapshot = config.snapshot();
    assert_eq!(snapshot.xconnects["server-in"].transmit, "client-out");
    assert_eq!(snapshot.xconnects["client-out"].transmit, "server-in");
  }

  #[tokio::test]
  async fn direct_memif_pairs_are_not_cross_connected() {
    use crate::common::{
      dataplane::DirectMemifEnabled,
      protocol::{
        mechanism::{cls, MEMIF},
        Mechanism,
      },
    };

    let memif = Mechanism::new(cls::LOCAL, MEMIF);
    let config = Arc::new(DataplaneConfig::new());
    let ctx = Context::new()
      .with_shared_value(config.clone())
      .with_value(DirectMemifEnabled)
      .with_value(InboundRequest::new(NetworkServiceRequest::new(
        Connection::new("in").with_mechanism(memif.clone()),
      )));
    let chain = ClientChain::new(vec![
      Arc::new(L2XConnectClient),
      Arc::new(CapturingClient::responding(move |request| {
        Ok(request.connection.clone().with_mechanism(memif.clone()))
      })),
    ]);
    chain
      .call_request(&ctx, NetworkServiceRequest::new(Connection::new("out")))
      .await
      .unwrap();
    let snapshot = config.snapshot();
    assert!(snapshot.xconnects.is_empty());
    assert_eq!(snapshot.direct_memifs["server-in"].peer, "client-out");
  }

  #[tokio::test]
  async fn missing_inbound_request_fails_the_request() {
    let ctx = Context::new().with_value(DataplaneConfig::new());
    let err = L2XConnectClient
      .call_request(&ctx, NetworkServiceRequest::new(Connection::new("out")))
      .await
      .unwrap_err();
    assert!(matches!(err, ChainError::MissingContext(_)));
  }
}
