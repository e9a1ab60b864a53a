// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Opening and tracking the outbound connection which serves each inbound connection
use dashmap::DashMap;
use futures::future::FutureExt;
use std::{fmt, sync::Arc, time::Duration};
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::common::{
  chain::{
    merge_close, ChainError, ChainFuture, CloseAck, Context, ContextValue, NetworkServiceClient,
    NetworkServiceClientExt, NetworkServiceServer, ServerNext,
  },
  protocol::{Connection, NetworkServiceRequest},
};

pub mod client;
pub mod dialer;

pub use client::{ClientFactory, HealClient, TransportClient};
pub use dialer::{DialOptions, Dialer, LocalDialer};

/// Address of the next hop, published for [`ConnectServer`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientUrl(String);

impl ClientUrl {
  pub fn new<S: Into<String>>(url: S) -> Self {
    Self(url.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ClientUrl {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl ContextValue for ClientUrl {}

/// The inbound request an outbound call is being made on behalf of
#[derive(Debug, Clone)]
pub struct InboundRequest(NetworkServiceRequest);

impl InboundRequest {
  pub fn new(request: NetworkServiceRequest) -> Self {
    Self(request)
  }

  pub fn request(&self) -> &NetworkServiceRequest {
    &self.0
  }

  pub fn connection(&self) -> &Connection {
    &self.0.connection
  }
}

impl ContextValue for InboundRequest {}

/// Marks calls made while healing a connection
#[derive(Debug, Clone)]
pub struct HealAttempt {
  pub connection_id: String,
}

impl ContextValue for HealAttempt {}

/// Publishes a fixed next-hop URL into the context
pub struct ClientUrlServer {
  url: ClientUrl,
}

impl ClientUrlServer {
  pub fn new(url: ClientUrl) -> Self {
    Self { url }
  }
}

impl NetworkServiceServer for ClientUrlServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let ctx = ctx.with_value(self.url.clone());
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
      let ctx = ctx.with_value(self.url.clone());
      next.close(&ctx, connection).await
    }
    .boxed()
  }
}

/// Opens, refreshes, and closes the outbound connection paired with each inbound one
///
/// The outbound id is derived from the forwarder name and the inbound id, so a refresh
/// after losing the record still addresses the same outbound connection.
pub struct ConnectServer {
  name: String,
  factory: ClientFactory,
  dialer: Arc<dyn Dialer>,
  dial_options: DialOptions,
  request_timeout: Duration,
  outbound: DashMap<String, Connection>,
}

impl ConnectServer {
  pub fn new<S: Into<String>>(
    name: S,
    factory: ClientFactory,
    dialer: Arc<dyn Dialer>,
    dial_options: DialOptions,
    request_timeout: Duration,
  ) -> Self {
    Self {
      name: name.into(),
      factory,
      dialer,
      dial_options,
      request_timeout,
      outbound: DashMap::new(),
    }
  }

  pub fn outbound_id(&self, inbound_id: &str) -> String {
    Uuid::new_v5(
      &Uuid::NAMESPACE_OID,
      format!("{}/{}", self.name, inbound_id).as_bytes(),
    )
    .to_string()
  }

  pub fn outbound_connection(&self, inbound_id: &str) -> Option<Connection> {
    self.outbound.get(inbound_id).map(|c| c.value().clone())
  }

  pub fn len(&self) -> usize {
    self.outbound.len()
  }

  pub fn is_empty(&self) -> bool {
    self.outbound.is_empty()
  }

  /// The outbound request for an inbound one, and whether it refreshes an established connection
  ///
  /// While healing, the recorded mechanism is dropped so the next hop selects one afresh.
  fn outbound_request(&self, inbound: &Connection, healing: bool) -> (NetworkServiceRequest, bool) {
    let (mut connection, established) = match self.outbound_connection(&inbound.id) {
      Some(existing) => (existing, true),
      None => (Connection::new(self.outbound_id(&inbound.id)), false),
    };
    if healing {
      connection.mechanism = None;
    }
    connection.network_service = inbound.network_service.clone();
    connection.labels = inbound.labels.clone();
    if !established {
      connection.context = inbound.context.clone();
    }
    (NetworkServiceRequest::new(connection), established)
  }

  async fn dial(
    &self,
    ctx: &Context,
    url: &ClientUrl,
  ) -> Result<Arc<dyn NetworkServiceClient>, ChainError> {
    let limit = self.dial_options.connect_timeout();
    match tokio::time::timeout(limit, self.dialer.dial(ctx, url, &self.dial_options)).await {
      Ok(dialed) => dialed,
      Err(_) => Err(ChainError::TimedOut(limit)),
    }
  }

  async fn open(&self, ctx: &Context, request: &NetworkServiceRequest) -> Result<Connection, ChainError> {
    let url = ctx.require::<ClientUrl>()?;
    let healing = ctx.value::<HealAttempt>().is_some();
    let (outbound, established) = self.outbound_request(&request.connection, healing);
    let peer = self.dial(ctx, url).await?;
    let client = self
      .factory
      .build(url, peer, request.clone(), established);
    let outbound_ctx = ctx.with_value(InboundRequest::new(request.clone()));
    tracing::debug!(
      outbound_id = %outbound.connection.id,
      established,
      healing,
      "Requesting outbound connection"
    );
    match tokio::time::timeout(self.request_timeout, client.call_request(&outbound_ctx, outbound)).await {
      Ok(result) => result,
      Err(_) => Err(ChainError::TimedOut(self.request_timeout)),
    }
  }

  async fn shut(&self, ctx: &Context, inbound: &Connection) -> Result<CloseAck, ChainError> {
    let url = ctx.require::<ClientUrl>()?;
    let outbound = self
      .outbound_connection(&inbound.id)
      .unwrap_or_else(|| Connection::new(self.outbound_id(&inbound.id)));
    let peer = self.dial(ctx, url).await?;
    let inbound_request = NetworkServiceRequest::new(inbound.clone());
    let client = self
      .factory
      .build(url, peer, inbound_request.clone(), false);
    let outbound_ctx = ctx.with_value(InboundRequest::new(inbound_request));
    match tokio::time::timeout(self.request_timeout, client.call_close(&outbound_ctx, outbound)).await {
      Ok(result) => result,
      Err(_) => Err(ChainError::TimedOut(self.request_timeout)),
    }
  }
}

impl NetworkServiceServer for ConnectServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    mut request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    let span = tracing::debug_span!("connect", connection_id = %request.connection.id);
    async move {
      let outbound = self.open(ctx, &request).await?;
      request.connection.context = outbound.context.clone();
      self
        .outbound
        .insert(request.connection.id.clone(), outbound);
      next.request(ctx, request).await
    }
    .instrument(span)
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    let span = tracing::debug_span!("connect", connection_id = %connection.id);
    async move {
      let closed = self.shut(ctx, &connection).await;
      self.outbound.remove(&connection.id);
      merge_close(closed, next.close(ctx, connection).await)
    }
    .instrument(span)
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::{
    chain::{
      adapters::ServerToClient,
      testing::{CapturingClient, CapturingServer},
      NetworkServiceServerExt, ServerChain,
    },
    dataplane::DataplaneConfigServer,
    mechanisms::PreferenceRegistry,
    protocol::{
      mechanism::{cls, KERNEL},
      Mechanism,
    },
  };

  const URL: &str = "inproc://next";

  fn connect_chain(peer: Arc<dyn NetworkServiceClient>, timeout: Duration) -> (ServerChain, Arc<ConnectServer>) {
    let dialer = LocalDialer::new();
    dialer.register(ClientUrl::new(URL), peer);
    let factory = ClientFactory::new(
      "fwd",
      Arc::new(CapturingClient::echo()),
      PreferenceRegistry::new(Vec::new()),
    );
    let connect = Arc::new(ConnectServer::new(
      "fwd",
      factory,
      Arc::new(dialer),
      DialOptions::default(),
      timeout,
    ));
    let chain = ServerChain::new(vec![
      Arc::new(DataplaneConfigServer),
      Arc::new(ClientUrlServer::new(ClientUrl::new(URL))),
      connect.clone(),
    ]);
    (chain, connect)
  }

  #[tokio::test]
  async fn outbound_ids_are_stable_and_distinct() {
    let (_, connect) = connect_chain(Arc::new(CapturingClient::echo()), Duration::from_secs(1));
    assert_eq!(connect.outbound_id("a"), connect.outbound_id("a"));
    assert_ne!(connect.outbound_id("a"), connect.outbound_id("b"));
  }

  #[tokio::test]
  async fn request_records_outbound_and_copies_context_back() {
    let peer = Arc::new(CapturingClient::responding(|request| {
      let mut connection = request.connection.clone();
      connection.context.ip_context.src_ip_addr = Some("10.1.0.2/32".into());
      Ok(connection)
    }));
    let (chain, connect) = connect_chain(peer.clone(), Duration::from_secs(1));
    let ctx = Context::new();
    let inbound = NetworkServiceRequest::new(Connection::new("in-1").with_network_service("svc"));

    let conn = chain.call_request(&ctx, inbound.clone()).await.unwrap();
    assert_eq!(conn.context.ip_context.src_ip_addr.as_deref(), Some("10.1.0.2/32"));
    let outbound = connect.outbound_connection("in-1").unwrap();
    assert_eq!(outbound.id, connect.outbound_id("in-1"));
    assert_eq!(outbound.network_service, "svc");

    chain.call_request(&ctx, inbound).await.unwrap();
    let requests = peer.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].connection.id, requests[1].connection.id);

    chain.call_close(&ctx, conn).await.unwrap();
    assert!(connect.is_empty());
    assert_eq!(peer.closes()[0].id, outbound.id);
  }

  #[tokio::test]
  async fn healing_requests_drop_the_recorded_outbound_mechanism() {
    let peer = Arc::new(CapturingClient::responding(|request| {
      Ok(
        request
          .connection
          .clone()
          .with_mechanism(Mechanism::new(cls::LOCAL, KERNEL)),
      )
    }));
    let (chain, connect) = connect_chain(peer.clone(), Duration::from_secs(1));
    let inbound = NetworkServiceRequest::new(Connection::new("in-h"));
    chain.call_request(&Context::new(), inbound.clone()).await.unwrap();
    assert_eq!(
      connect.outbound_connection("in-h").unwrap().mechanism_type(),
      Some(KERNEL)
    );

    chain.call_request(&Context::new(), inbound.clone()).await.unwrap();
    let healing = Context::new().with_value(HealAttempt {
      connection_id: "in-h".into(),
    });
    chain.call_request(&healing, inbound).await.unwrap();

    let requests = peer.requests();
    assert_eq!(requests[1].connection.mechanism_type(), Some(KERNEL));
    assert!(requests[2].connection.mechanism.is_none());
    assert_eq!(requests[2].connection.id, connect.outbound_id("in-h"));
  }

  #[tokio::test]
  async fn close_without_request_still_reaches_next_hop() {
    let peer = Arc::new(CapturingClient::echo());
    let (chain, connect) = connect_chain(peer.clone(), Duration::from_secs(1));
    let ack = chain
      .call_close(&Context::new(), Connection::new("unknown"))
      .await
      .unwrap();
    assert!(ack.is_clean());
    assert_eq!(peer.closes()[0].id, connect.outbound_id("unknown"));
  }

  #[tokio::test]
  async fn slow_next_hops_time_out() {
    struct Stalled;
    impl NetworkServiceServer for Stalled {
      fn request<'a>(
        &'a self,
        _ctx: &'a Context,
        _request: NetworkServiceRequest,
        _next: ServerNext<'a>,
      ) -> ChainFuture<'a, Connection> {
        futures::future::pending().boxed()
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

    let peer = Arc::new(ServerToClient::new(Arc::new(Stalled)));
    let (chain, connect) = connect_chain(peer, Duration::from_millis(20));
    let err = chain
      .call_request(&Context::new(), NetworkServiceRequest::new(Connection::new("in")))
      .await
      .unwrap_err();
    assert!(matches!(err, ChainError::TimedOut(_)));
    assert!(err.is_retryable());
    assert!(connect.is_empty());
  }

  #[tokio::test]
  async fn missing_url_is_reported() {
    let (_, connect) = connect_chain(Arc::new(CapturingClient::echo()), Duration::from_secs(1));
    let chain = ServerChain::new(vec![
      Arc::new(DataplaneConfigServer),
      connect,
      Arc::new(CapturingServer::new()),
    ]);
    let err = chain
      .call_request(&Context::new(), NetworkServiceRequest::new(Connection::new("in")))
      .await
      .unwrap_err();
    assert!(matches!(err, ChainError::MissingContext(_)));
  }
}
