// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-call dataplane configuration, accumulated by handlers and applied at commit
use dashmap::DashMap;
use futures::future::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::common::{
  chain::{
    ChainError, ChainFuture, CloseAck, Context, ContextValue, NetworkServiceServer, ServerNext,
  },
  protocol::{Connection, NetworkServiceRequest},
};

pub mod commit;
pub mod directmemif;
pub mod ipcontext;
pub mod xconnect;

pub use commit::{CommitServer, ConfigSink, InMemoryAgent};
pub use directmemif::{DirectMemifEnabled, DirectMemifServer};
pub use ipcontext::{IpAddressServer, RoutesServer};
pub use xconnect::L2XConnectClient;

/// One end of a veth pair in the kernel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxInterface {
  pub name: String,
  pub host_if_name: String,
  /// Namespace handle; `None` places the interface in the forwarder's own namespace
  pub namespace: Option<String>,
  pub veth_peer: String,
  pub enabled: bool,
  pub ip_addresses: Vec<String>,
  pub routes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VppLink {
  AfPacket {
    host_if_name: String,
  },
  Mechanism {
    mechanism_type: String,
    parameters: BTreeMap<String, String>,
  },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VppInterface {
  pub name: String,
  pub enabled: bool,
  pub link: VppLink,
}

/// Forwards frames received on one interface out of another
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2XConnect {
  pub receive: String,
  pub transmit: String,
}

/// A requester's memif socket joined straight to the next hop's, with no vpp interfaces between
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMemif {
  /// Key of the requester-side connection
  pub name: String,
  /// Key of the next-hop-side connection
  pub peer: String,
  pub server_parameters: BTreeMap<String, String>,
  pub client_parameters: BTreeMap<String, String>,
}

/// Configuration accumulated over the course of one call
///
/// Entries are keyed by name; handlers running concurrently for distinct connections write
/// disjoint keys, and a handler writing the same key twice replaces its earlier entry.
#[derive(Debug, Default)]
pub struct DataplaneConfig {
  linux_interfaces: DashMap<String, LinuxInterface>,
  vpp_interfaces: DashMap<String, VppInterface>,
  xconnects: DashMap<String, L2XConnect>,
  direct_memifs: DashMap<String, DirectMemif>,
}

impl ContextValue for DataplaneConfig {}

impl DataplaneConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_context(ctx: &Context) -> Result<&Self, ChainError> {
    ctx.require::<Self>()
  }

  pub fn put_linux_interface(&self, interface: LinuxInterface) -> Option<LinuxInterface> {
    self
      .linux_interfaces
      .insert(interface.name.clone(), interface)
  }

  pub fn put_vpp_interface(&self, interface: VppInterface) -> Option<VppInterface> {
    self.vpp_interfaces.insert(interface.name.clone(), interface)
  }

  pub fn put_xconnect(&self, xconnect: L2XConnect) -> Option<L2XConnect> {
    self.xconnects.insert(xconnect.receive.clone(), xconnect)
  }

  pub fn put_direct_memif(&self, direct: DirectMemif) -> Option<DirectMemif> {
    self.direct_memifs.insert(direct.name.clone(), direct)
  }

  pub fn remove_vpp_interface(&self, name: &str) -> Option<VppInterface> {
    self.vpp_interfaces.remove(name).map(|(_, interface)| interface)
  }

  /// Whether either side of a direct memif pairing uses this key
  pub fn is_direct_memif(&self, key: &str) -> bool {
    self.direct_memifs.contains_key(key)
      || self.direct_memifs.iter().any(|e| e.value().peer == key)
  }

  /// Applies `update` to an existing linux interface, returning whether it was present
  pub fn update_linux_interface<F: FnOnce(&mut LinuxInterface)>(&self, name: &str, update: F) -> bool {
    match self.linux_interfaces.get_mut(name) {
      Some(mut entry) => {
        update(entry.value_mut());
        true
      }
      None => false,
    }
  }

  pub fn linux_interface(&self, name: &str) -> Option<LinuxInterface> {
    self.linux_interfaces.get(name).map(|e| e.value().clone())
  }

  pub fn vpp_interface(&self, name: &str) -> Option<VppInterface> {
    self.vpp_interfaces.get(name).map(|e| e.value().clone())
  }

  pub fn is_empty(&self) -> bool {
    self.linux_interfaces.is_empty()
      && self.vpp_interfaces.is_empty()
      && self.xconnects.is_empty()
      && self.direct_memifs.is_empty()
  }

  pub fn snapshot(&self) -> DataplaneSnapshot {
    fn collect<T: Clone>(map: &DashMap<String, T>) -> BTreeMap<String, T> {
      map
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect()
    }
    DataplaneSnapshot {
      linux_interfaces: collect(&self.linux_interfaces),
      vpp_interfaces: collect(&self.vpp_interfaces),
      xconnects: collect(&self.xconnects),
      direct_memifs: collect(&self.direct_memifs),
    }
  }
}

/// A point-in-time copy of a [`DataplaneConfig`], as handed to the dataplane agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataplaneSnapshot {
  pub linux_interfaces: BTreeMap<String, LinuxInterface>,
  pub vpp_interfaces: BTreeMap<String, VppInterface>,
  pub xconnects: BTreeMap<String, L2XConnect>,
  #[serde(default)]
  pub direct_memifs: BTreeMap<String, DirectMemif>,
}

impl DataplaneSnapshot {
  pub fn is_empty(&self) -> bool {
    self.linux_interfaces.is_empty()
      && self.vpp_interfaces.is_empty()
      && self.xconnects.is_empty()
      && self.direct_memifs.is_empty()
  }

  /// Names of every interface, kernel or vpp, in the snapshot
  pub fn interface_names(&self) -> BTreeSet<String> {
    self
      .linux_interfaces
      .keys()
      .chain(self.vpp_interfaces.keys())
      .cloned()
      .collect()
  }
}

/// Gives everything downstream a fresh [`DataplaneConfig`] for this call
#[derive(Debug, Default, Clone, Copy)]
pub struct DataplaneConfigServer;

impl NetworkServiceServer for DataplaneConfigServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let ctx = ctx.with_value(DataplaneConfig::new());
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
      let ctx = ctx.with_value(DataplaneConfig::new());
      next.close(&ctx, connection).await
    }
    .boxed()
  }
}
