// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The cross-connecting forwarder: an endpoint which serves each inbound connection by
//! opening an outbound one and binding the two together in the dataplane
use std::sync::{Arc, Weak};

use super::{
  config::{ConfigError, ForwarderConfig},
  endpoint::Endpoint,
};
use crate::common::{
  authorization::{AllowAll, Authorizer},
  chain::{
    adapters::WeakServerToClient, ChainFuture, CloseAck, Context, NetworkServiceServer,
    ServerNext,
  },
  connect::{ClientFactory, ClientUrl, ClientUrlServer, ConnectServer, Dialer, LocalDialer},
  dataplane::{
    CommitServer, ConfigSink, DataplaneConfig, DataplaneConfigServer, DirectMemifServer,
    InMemoryAgent, IpAddressServer, RoutesServer,
  },
  mechanisms::{GenericMechanism, InitOnce, KernelVethPair, MechanismHandler, PreferenceRegistry},
  netns::{NetNsResolver, ProcfsNetNsResolver},
  protocol::{Connection, NetworkServiceRequest},
};

pub struct Forwarder {
  endpoint: Endpoint,
  connect: Arc<ConnectServer>,
  inbound: PreferenceRegistry,
  outbound: PreferenceRegistry,
  heal: WeakServerToClient,
}

impl Forwarder {
  pub fn builder(config: ForwarderConfig) -> ForwarderBuilder {
    ForwarderBuilder::new(config)
  }

  pub fn name(&self) -> &str {
    self.endpoint.name()
  }

  /// A client which re-enters this forwarder's inbound chain without keeping it alive
  pub fn heal_adapter(&self) -> WeakServerToClient {
    self.heal.clone()
  }

  pub fn inbound_mechanisms(&self) -> &PreferenceRegistry {
    &self.inbound
  }

  pub fn outbound_mechanisms(&self) -> &PreferenceRegistry {
    &self.outbound
  }

  pub fn outbound_connection(&self, inbound_id: &str) -> Option<Connection> {
    self.connect.outbound_connection(inbound_id)
  }
}

impl NetworkServiceServer for Forwarder {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    self.endpoint.request(ctx, request, next)
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    self.endpoint.close(ctx, connection, next)
  }
}

/// Collaborators for a [`Forwarder`]; unset ones fall back to permissive, in-process defaults
pub struct ForwarderBuilder {
  config: ForwarderConfig,
  authorizer: Arc<dyn Authorizer>,
  sink: Arc<dyn ConfigSink>,
  dialer: Arc<dyn Dialer>,
  resolver: Arc<dyn NetNsResolver>,
  vxlan_init: Option<Arc<InitOnce>>,
}

impl ForwarderBuilder {
  pub fn new(config: ForwarderConfig) -> Self {
    Self {
      config,
      authorizer: Arc::new(AllowAll),
      sink: Arc::new(InMemoryAgent::new()),
      dialer: Arc::new(LocalDialer::new()),
      resolver: Arc::new(ProcfsNetNsResolver::default()),
      vxlan_init: None,
    }
  }

  pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
    self.authorizer = authorizer;
    self
  }

  pub fn sink(mut self, sink: Arc<dyn ConfigSink>) -> Self {
    self.sink = sink;
    self
  }

  pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
    self.dialer = dialer;
    self
  }

  pub fn resolver(mut self, resolver: Arc<dyn NetNsResolver>) -> Self {
    self.resolver = resolver;
    self
  }

  /// Agent configuration written once, by the first connection selecting vxlan on either side
  pub fn vxlan_init<F>(mut self, init: F) -> Self
  where
    F: Fn(&DataplaneConfig) -> anyhow::Result<()> + Send + Sync + 'static,
  {
    self.vxlan_init = Some(Arc::new(InitOnce::new(init)));
    self
  }

  fn mechanisms(&self) -> PreferenceRegistry {
    let mut vxlan = GenericMechanism::vxlan(self.config.tunnel_ip);
    if let Some(init) = &self.vxlan_init {
      vxlan = vxlan.with_init(init.clone());
    }
    let handlers: Vec<Arc<dyn MechanismHandler>> = vec![
      Arc::new(GenericMechanism::memif(&self.config.base_dir)),
      Arc::new(KernelVethPair::with_shared_resolver(self.resolver.clone())),
      Arc::new(vxlan),
      Arc::new(GenericMechanism::srv6(self.config.tunnel_ip)),
    ];
    PreferenceRegistry::new(handlers)
  }

  pub fn build(self) -> Result<Arc<Forwarder>, ConfigError> {
    self.config.validate()?;
    Ok(Arc::new_cyclic(|this: &Weak<Forwarder>| self.assemble(this)))
  }

  fn assemble(self, this: &Weak<Forwarder>) -> Forwarder {
    let weak_self: Weak<dyn NetworkServiceServer> = this.clone();
    let heal = WeakServerToClient::new(weak_self);
    let inbound = self.mechanisms();
    let outbound = self.mechanisms();
    let name = self.config.name.clone();

    let factory = ClientFactory::new(name.clone(), Arc::new(heal.clone()), outbound.clone());
    let connect = Arc::new(ConnectServer::new(
      name.clone(),
      factory,
      self.dialer,
      self.config.dial.clone(),
      self.config.request_timeout(),
    ));

    let mut functionality: Vec<Arc<dyn NetworkServiceServer>> =
      vec![Arc::new(DataplaneConfigServer), Arc::new(DirectMemifServer)];
    functionality.extend(inbound.selectors());
    functionality.push(Arc::new(ClientUrlServer::new(ClientUrl::new(
      self.config.client_url.clone(),
    ))));
    functionality.push(connect.clone());
    functionality.push(Arc::new(IpAddressServer));
    functionality.push(Arc::new(RoutesServer));
    functionality.push(Arc::new(CommitServer::new(self.sink)));

    tracing::debug!(
      forwarder = %name,
      inbound = ?inbound,
      outbound = ?outbound,
      "Assembled forwarder chain"
    );
    Forwarder {
      endpoint: Endpoint::new(name, self.authorizer, functionality),
      connect,
      inbound,
      outbound,
      heal,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::HashSet,
    sync::{
      atomic::{AtomicUsize, Ordering},
      Mutex,
    },
    time::Duration,
  };

  use futures::future::FutureExt;
  use tokio::sync::Notify;

  use super::*;
  use crate::{
    common::{
      authorization::Decision,
      chain::{
        adapters::ServerToClient, ChainError, NetworkServiceClientExt, NetworkServiceServerExt,
      },
      dataplane::{VppInterface, VppLink},
      netns::ResolveError,
      protocol::{
        mechanism::{cls, KERNEL, MEMIF, NETNS_INODE_KEY, VXLAN},
        Mechanism,
      },
    },
    util::test_logging,
  };

  const URL: &str = "inproc://next-hop";
  const CONSUMER_INODE: &str = "4026532100";
  const PROVIDER_INODE: &str = "4026532200";

  fn stub_resolver(identity: &str) -> Result<String, ResolveError> {
    match identity {
      CONSUMER_INODE => Ok("/proc/100/ns/net".into()),
      PROVIDER_INODE => Ok("/proc/200/ns/net".into()),
      _ => Err(ResolveError::NotFound(0)),
    }
  }

  /// The next hop: accepts one mechanism type only, and fails any call numbered in `failing`
  struct NextHop {
    accepts: &'static str,
    calls: AtomicUsize,
    failing: Mutex<HashSet<usize>>,
    requests: Mutex<Vec<NetworkServiceRequest>>,
    notify: Notify,
  }

  impl NextHop {
    fn new() -> Arc<Self> {
      Self::selecting(KERNEL)
    }

    fn selecting(accepts: &'static str) -> Arc<Self> {
      Arc::new(Self {
        accepts,
        calls: AtomicUsize::new(0),
        failing: Mutex::new(HashSet::new()),
        requests: Mutex::new(Vec::new()),
        notify: Notify::new(),
      })
    }

    fn fail_call(&self, call: usize) {
      self.failing.lock().unwrap().insert(call);
    }

    fn requests(&self) -> Vec<NetworkServiceRequest> {
      self.requests.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    async fn wait_for_calls(&self, count: usize) {
      tokio::time::timeout(Duration::from_secs(5), async {
        while self.calls() < count {
          self.notify.notified().await;
        }
      })
      .await
      .expect("next hop did not see the expected calls");
    }

    fn respond(&self, request: &NetworkServiceRequest) -> Result<Connection, ChainError> {
      self.requests.lock().unwrap().push(request.clone());
      let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      if self.failing.lock().unwrap().contains(&call) {
        return Err(ChainError::Unavailable);
      }
      let selected = request
        .mechanism_preferences
        .iter()
        .find(|m| m.mechanism_type == self.accepts)
        .ok_or_else(|| ChainError::NegotiationFailed {
          offered: request.preference_types(),
        })?;
      let mut selected = selected.clone();
      if self.accepts == KERNEL {
        selected = selected.with_parameter(NETNS_INODE_KEY, PROVIDER_INODE);
      }
      let mut connection = request.connection.clone();
      connection.mechanism = Some(selected);
      connection.context.ip_context.src_ip_addr = Some("172.16.1.2/32".into());
      connection.context.ip_context.src_routes = vec!["172.16.1.1/32".into()];
      Ok(connection)
    }
  }

  impl NetworkServiceServer for NextHop {
    fn request<'a>(
      &'a self,
      ctx: &'a Context,
      request: NetworkServiceRequest,
      next: ServerNext<'a>,
    ) -> ChainFuture<'a, Connection> {
      let response = self.respond(&request);
      self.notify.notify_one();
      async move {
        let connection = response?;
        next
          .request(ctx, NetworkServiceRequest::new(connection))
          .await
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

  struct Harness {
    forwarder: Arc<Forwarder>,
    agent: InMemoryAgent,
    next_hop: Arc<NextHop>,
  }

  fn harness_with(authorizer: Arc<dyn Authorizer>) -> Harness {
    harness_for(NextHop::new(), |builder| builder.authorizer(authorizer))
  }

  fn harness_for(
    next_hop: Arc<NextHop>,
    customize: impl FnOnce(ForwarderBuilder) -> ForwarderBuilder,
  ) -> Harness {
    test_logging::init();
    let dialer = LocalDialer::new();
    dialer.register(
      ClientUrl::new(URL),
      Arc::new(ServerToClient::new(next_hop.clone())),
    );
    let agent = InMemoryAgent::new();
    let config = ForwarderConfig {
      name: "fwd-test".into(),
      client_url: URL.into(),
      request_timeout_ms: 2_000,
      ..Default::default()
    };
    let builder = Forwarder::builder(config)
      .sink(Arc::new(agent.clone()))
      .dialer(Arc::new(dialer))
      .resolver(Arc::new(stub_resolver));
    let forwarder = customize(builder).build().unwrap();
    Harness {
      forwarder,
      agent,
      next_hop,
    }
  }

  fn harness() -> Harness {
    harness_with(Arc::new(AllowAll))
  }

  fn inbound(id: &str) -> NetworkServiceRequest {
    NetworkServiceRequest::new(Connection::new(id).with_network_service("icmp-responder"))
      .with_preference(
        Mechanism::new(cls::LOCAL, KERNEL).with_parameter(NETNS_INODE_KEY, CONSUMER_INODE),
      )
  }

  fn client_key(h: &Harness, inbound_id: &str) -> String {
    format!("client-{}", h.forwarder.outbound_connection(inbound_id).unwrap().id)
  }

  #[tokio::test]
  async fn request_cross_connects_both_sides() {
    let h = harness();
    let conn = h
      .forwarder
      .call_request(&Context::new(), inbound("in-1"))
      .await
      .unwrap();
    assert_eq!(conn.mechanism_type(), Some(KERNEL));
    assert_eq!(
      conn.context.ip_context.src_ip_addr.as_deref(),
      Some("172.16.1.2/32")
    );

    let offered = &h.next_hop.requests()[0];
    assert_eq!(
      offered.mechanism_preferences,
      h.forwarder.outbound_mechanisms().preferences()
    );

    let server_side = h.agent.linux_interface("server-in-1").unwrap();
    assert_eq!(server_side.namespace.as_deref(), Some("/proc/100/ns/net"));
    assert_eq!(server_side.ip_addresses, vec!["172.16.1.2/32".to_string()]);
    assert_eq!(server_side.routes, vec!["172.16.1.1/32".to_string()]);

    let client = client_key(&h, "in-1");
    let client_side = h.agent.linux_interface(&client).unwrap();
    assert_eq!(client_side.namespace.as_deref(), Some("/proc/200/ns/net"));
    assert_eq!(h.agent.xconnect("server-in-1").unwrap().transmit, client);
    assert_eq!(h.agent.xconnect(&client).unwrap().transmit, "server-in-1");
  }

  #[tokio::test]
  async fn close_removes_everything_and_can_repeat() {
    let h = harness();
    let ctx = Context::new();
    let conn = h.forwarder.call_request(&ctx, inbound("in-2")).await.unwrap();
    assert!(!h.agent.is_empty());

    let ack = h.forwarder.call_close(&ctx, conn.clone()).await.unwrap();
    assert!(ack.is_clean(), "unexpected warnings {:?}", ack.warnings());
    assert!(h.agent.is_empty(), "left behind {:?}", h.agent.applied());
    assert!(h.forwarder.outbound_connection("in-2").is_none());

    let again = h.forwarder.call_close(&ctx, conn).await.unwrap();
    assert!(again.is_clean());
    assert!(h.agent.is_empty());
  }

  #[tokio::test]
  async fn denied_requests_have_no_effects() {
    let deny_all = |_: &NetworkServiceRequest| Decision::Deny("closed for maintenance".into());
    let h = harness_with(Arc::new(deny_all));
    let err = h
      .forwarder
      .call_request(&Context::new(), inbound("in-3"))
      .await
      .unwrap_err();
    assert!(err.is_policy_denied());
    assert_eq!(h.next_hop.calls(), 0);
    assert!(h.agent.is_empty());
  }

  #[tokio::test]
  async fn unsupported_inbound_preferences_fail_negotiation() {
    let h = harness();
    let wireguard = Mechanism::new(cls::REMOTE, "WIREGUARD");
    assert!(!h.forwarder.inbound_mechanisms().supports(&wireguard));
    let request = NetworkServiceRequest::new(Connection::new("in-4")).with_preference(wireguard);
    let err = h
      .forwarder
      .call_request(&Context::new(), request)
      .await
      .unwrap_err();
    assert!(matches!(err, ChainError::NegotiationFailed { .. }));
    assert_eq!(h.next_hop.calls(), 0);
  }

  #[tokio::test]
  async fn heal_adapter_behaves_like_a_direct_request() {
    let h = harness();
    let ctx = Context::new();
    let direct = h.forwarder.call_request(&ctx, inbound("in-5")).await.unwrap();
    let adapted = h
      .forwarder
      .heal_adapter()
      .call_request(&ctx, inbound("in-5"))
      .await
      .unwrap();
    assert_eq!(direct, adapted);
    let seen = h.next_hop.requests();
    assert_eq!(seen[0].connection.id, seen[1].connection.id);
  }

  #[tokio::test]
  async fn failed_refresh_heals_through_the_inbound_chain() {
    let h = harness();
    let ctx = Context::new();
    let conn = h.forwarder.call_request(&ctx, inbound("in-6")).await.unwrap();
    h.next_hop.fail_call(2);

    let mut refresh = inbound("in-6");
    refresh.connection = conn;
    let err = h.forwarder.call_request(&ctx, refresh).await.unwrap_err();
    assert!(matches!(err.root_cause(), ChainError::Unavailable));

    h.next_hop.wait_for_calls(3).await;
    let healed = h.next_hop.requests()[2].clone();
    assert_eq!(h.next_hop.requests()[1].connection.mechanism_type(), Some(KERNEL));
    assert!(healed.connection.mechanism.is_none());
    assert_eq!(
      healed.connection.id,
      h.forwarder.outbound_connection("in-6").unwrap().id
    );
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_connections_write_disjoint_keys() {
    let h = harness();
    let ids: Vec<String> = (0..16).map(|i| format!("in-c{}", i)).collect();
    let tasks = ids.iter().map(|id| {
      let forwarder = h.forwarder.clone();
      let request = inbound(id);
      tokio::spawn(async move { forwarder.call_request(&Context::new(), request).await })
    });
    for result in futures::future::join_all(tasks).await {
      result.expect("request task panicked").unwrap();
    }

    let mut seen = HashSet::new();
    for id in &ids {
      let server = format!("server-{}", id);
      let client = client_key(&h, id);
      assert!(h.agent.linux_interface(&server).is_some());
      assert!(h.agent.linux_interface(&client).is_some());
      assert!(seen.insert(server));
      assert!(seen.insert(client));
    }
    assert_eq!(h.agent.applied().xconnects.len(), ids.len() * 2);
  }

  #[tokio::test]
  async fn memif_on_both_sides_is_joined_directly() {
    let h = harness_for(NextHop::selecting(MEMIF), |builder| builder);
    let ctx = Context::new();
    let request = NetworkServiceRequest::new(Connection::new("in-m"))
      .with_preference(Mechanism::new(cls::LOCAL, MEMIF));
    let conn = h.forwarder.call_request(&ctx, request).await.unwrap();
    assert_eq!(conn.mechanism_type(), Some(MEMIF));

    let direct = h.agent.direct_memif("server-in-m").unwrap();
    assert_eq!(direct.peer, client_key(&h, "in-m"));
    let applied = h.agent.applied();
    assert!(applied.xconnects.is_empty());
    assert!(applied.vpp_interfaces.is_empty());

    let ack = h.forwarder.call_close(&ctx, conn).await.unwrap();
    assert!(ack.is_clean(), "unexpected warnings {:?}", ack.warnings());
    assert!(h.agent.is_empty(), "left behind {:?}", h.agent.applied());
  }

  #[tokio::test]
  async fn vxlan_initialization_runs_once_across_connections() {
    let runs = Arc::new(AtomicUsize::new(0));
    let h = harness_for(NextHop::selecting(VXLAN), {
      let runs = runs.clone();
      move |builder| {
        builder.vxlan_init(move |config: &DataplaneConfig| {
          runs.fetch_add(1, Ordering::SeqCst);
          config.put_vpp_interface(VppInterface {
            name: "vxlan-loopback".into(),
            enabled: true,
            link: VppLink::AfPacket {
              host_if_name: "lo".into(),
            },
          });
          Ok(())
        })
      }
    });
    let ctx = Context::new();
    for id in ["in-v1", "in-v2"] {
      h.forwarder.call_request(&ctx, inbound(id)).await.unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(h.agent.applied().vpp_interfaces.contains_key("vxlan-loopback"));
    let client = client_key(&h, "in-v2");
    assert!(h.agent.applied().vpp_interfaces.contains_key(&client));
    assert_eq!(h.agent.xconnect("server-in-v2").unwrap().transmit, client);
  }

  #[tokio::test]
  async fn heal_adapter_does_not_outlive_the_forwarder() {
    let h = harness();
    let adapter = h.forwarder.heal_adapter();
    drop(h);
    let err = adapter
      .call_request(&Context::new(), inbound("in-7"))
      .await
      .unwrap_err();
    assert!(matches!(err, ChainError::Unavailable));
  }

  #[test]
  fn invalid_configuration_is_rejected_at_build() {
    let config = ForwarderConfig {
      client_url: "not a url".into(),
      ..Default::default()
    };
    assert!(matches!(
      Forwarder::builder(config).build(),
      Err(ConfigError::InvalidClientUrl { .. })
    ));
  }
}
