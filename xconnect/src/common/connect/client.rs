// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::FutureExt;
use std::sync::Arc;
use tracing_futures::Instrument;

use super::{ClientUrl, HealAttempt};
use crate::common::{
  chain::{
    merge_close, ChainError, ChainFuture, ClientChain, ClientNext, CloseAck, Context,
    NetworkServiceClient, NetworkServiceClientExt,
  },
  dataplane::L2XConnectClient,
  mechanisms::PreferenceRegistry,
  protocol::{Connection, NetworkServiceRequest},
};

/// Forwards calls to the next hop's client, leaving in-process context values behind
pub struct TransportClient {
  url: ClientUrl,
  peer: Arc<dyn NetworkServiceClient>,
}

impl TransportClient {
  pub fn new(url: ClientUrl, peer: Arc<dyn NetworkServiceClient>) -> Self {
    Self { url, peer }
  }
}

impl NetworkServiceClient for TransportClient {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let preferences = request.mechanism_preferences.clone();
      let remote_ctx = ctx.detached();
      let connection = tokio::select! {
        biased;
        _ = ctx.cancelled() => return Err(ChainError::Cancelled),
        result = self.peer.call_request(&remote_ctx, request) => {
          result.map_err(|e| ChainError::delegation(e))?
        }
      };
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
    .instrument(tracing::trace_span!("transport", url = %self.url))
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    async move {
      let remote_ctx = ctx.detached();
      let closed = self
        .peer
        .call_close(&remote_ctx, connection.clone())
        .await
        .map_err(|e| ChainError::delegation(e));
      merge_close(closed, next.close(ctx, connection).await)
    }
    .instrument(tracing::trace_span!("transport", url = %self.url))
    .boxed()
  }
}

/// Starts a heal through the inbound chain when refreshing an established connection fails
///
/// Built per outbound call, knowing whether the call refreshes an established connection
/// and the inbound request it serves. Heal calls are marked with [`HealAttempt`], and a
/// failure during one never starts another.
pub struct HealClient {
  on_heal: Arc<dyn NetworkServiceClient>,
  inbound: NetworkServiceRequest,
  established: bool,
}

impl HealClient {
  pub fn new(
    on_heal: Arc<dyn NetworkServiceClient>,
    inbound: NetworkServiceRequest,
    established: bool,
  ) -> Self {
    Self {
      on_heal,
      inbound,
      established,
    }
  }

  fn start_heal(&self, cause: &ChainError) {
    let on_heal = self.on_heal.clone();
    let mut request = self.inbound.clone();
    request.connection.mechanism = None;
    let connection_id = request.connection.id.clone();
    tracing::info!(%connection_id, error = %cause, "Refresh failed; healing connection");
    let span = tracing::info_span!("heal", %connection_id);
    tokio::spawn(
      async move {
        let ctx = Context::new().with_value(HealAttempt {
          connection_id: connection_id.clone(),
        });
        match on_heal.call_request(&ctx, request).await {
          Ok(_) => tracing::debug!("Heal succeeded"),
          Err(error) => tracing::error!(%error, "Heal failed"),
        }
      }
      .instrument(span),
    );
  }
}

impl NetworkServiceClient for HealClient {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let result = next.request(ctx, request).await;
      if let Err(e) = &result {
        if self.established && ctx.value::<HealAttempt>().is_none() && !e.is_cancelled() {
          self.start_heal(e);
        }
      }
      result
    }
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    next.close(ctx, connection)
  }
}

/// Builds the outbound chain for each inbound call
///
/// The chain is, in order: healing, the outbound mechanism originators, the
/// cross-connect binding, and the transport to the next hop.
pub struct ClientFactory {
  name: String,
  on_heal: Arc<dyn NetworkServiceClient>,
  mechanisms: PreferenceRegistry,
  xconnect: Arc<dyn NetworkServiceClient>,
}

impl ClientFactory {
  pub fn new<S: Into<String>>(
    name: S,
    on_heal: Arc<dyn NetworkServiceClient>,
    mechanisms: PreferenceRegistry,
  ) -> Self {
    Self {
      name: name.into(),
      on_heal,
      mechanisms,
      xconnect: Arc::new(L2XConnectClient),
    }
  }

  pub fn with_cross_connect(mut self, xconnect: Arc<dyn NetworkServiceClient>) -> Self {
    self.xconnect = xconnect;
    self
  }

  pub fn build(
    &self,
    url: &ClientUrl,
    peer: Arc<dyn NetworkServiceClient>,
    inbound: NetworkServiceRequest,
    established: bool,
  ) -> ClientChain {
    let mut elements: Vec<Arc<dyn NetworkServiceClient>> =
      Vec::with_capacity(self.mechanisms.len() + 3);
    elements.push(Arc::new(HealClient::new(
      self.on_heal.clone(),
      inbound,
      established,
    )));
    elements.extend(self.mechanisms.originators());
    elements.push(self.xconnect.clone());
    elements.push(Arc::new(TransportClient::new(url.clone(), peer)));
    tracing::trace!(forwarder = %self.name, %url, established, "Built outbound chain");
    ClientChain::new(elements)
  }
}
