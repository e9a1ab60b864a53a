// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, TryFutureExt};
use std::sync::Arc;

use super::{
  DataplaneConfig, DataplaneSnapshot, DirectMemif, L2XConnect, LinuxInterface, VppInterface,
};
use crate::common::{
  chain::{
    close_with_cleanup, ChainError, ChainFuture, CloseAck, Context, NetworkServiceServer,
    ServerNext,
  },
  protocol::{Connection, NetworkServiceRequest},
};

/// The dataplane agent which receives committed configuration
#[cfg_attr(test, mockall::automock)]
pub trait ConfigSink: Send + Sync {
  /// Creates or replaces every entry in the snapshot
  fn update(&self, snapshot: DataplaneSnapshot) -> BoxFuture<'static, anyhow::Result<()>>;

  /// Removes every entry named in the snapshot; entries already absent are ignored
  fn delete(&self, snapshot: DataplaneSnapshot) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// A [`ConfigSink`] holding applied configuration in memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryAgent {
  linux_interfaces: Arc<DashMap<String, LinuxInterface>>,
  vpp_interfaces: Arc<DashMap<String, VppInterface>>,
  xconnects: Arc<DashMap<String, L2XConnect>>,
  direct_memifs: Arc<DashMap<String, DirectMemif>>,
}

impl InMemoryAgent {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn linux_interface(&self, name: &str) -> Option<LinuxInterface> {
    self.linux_interfaces.get(name).map(|e| e.value().clone())
  }

  pub fn vpp_interface(&self, name: &str) -> Option<VppInterface> {
    self.vpp_interfaces.get(name).map(|e| e.value().clone())
  }

  pub fn xconnect(&self, receive: &str) -> Option<L2XConnect> {
    self.xconnects.get(receive).map(|e| e.value().clone())
  }

  pub fn direct_memif(&self, name: &str) -> Option<DirectMemif> {
    self.direct_memifs.get(name).map(|e| e.value().clone())
  }

  pub fn len(&self) -> usize {
    self.linux_interfaces.len()
      + self.vpp_interfaces.len()
      + self.xconnects.len()
      + self.direct_memifs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn applied(&self) -> DataplaneSnapshot {
    let config = DataplaneConfig::new();
    for e in self.linux_interfaces.iter() {
      config.put_linux_interface(e.value().clone());
    }
    for e in self.vpp_interfaces.iter() {
      config.put_vpp_interface(e.value().clone());
    }
    for e in self.xconnects.iter() {
      config.put_xconnect(e.value().clone());
    }
    for e in self.direct_memifs.iter() {
      config.put_direct_memif(e.value().clone());
    }
    config.snapshot()
  }
}

impl ConfigSink for InMemoryAgent {
  fn update(&self, snapshot: DataplaneSnapshot) -> BoxFuture<'static, anyhow::Result<()>> {
    let agent = self.clone();
    tokio::task::spawn_blocking(move || {
      for (name, interface) in snapshot.linux_interfaces {
        agent.linux_interfaces.insert(name, interface);
      }
      for (name, interface) in snapshot.vpp_interfaces {
        agent.vpp_interfaces.insert(name, interface);
      }
      for (receive, xconnect) in snapshot.xconnects {
        agent.xconnects.insert(receive, xconnect);
      }
      for (name, direct) in snapshot.direct_memifs {
        agent.direct_memifs.insert(name, direct);
      }
    })
    .map_err(|e| anyhow::Error::new(e).context("Agent update task failed to rejoin"))
    .boxed()
  }

  fn delete(&self, snapshot: DataplaneSnapshot) -> BoxFuture<'static, anyhow::Result<()>> {
    let agent = self.clone();
    tokio::task::spawn_blocking(move || {
      for name in snapshot.linux_interfaces.keys() {
        agent.linux_interfaces.remove(name);
      }
      for name in snapshot.vpp_interfaces.keys() {
        agent.vpp_interfaces.remove(name);
      }
      for receive in snapshot.xconnects.keys() {
        agent.xconnects.remove(receive);
      }
      for name in snapshot.direct_memifs.keys() {
        agent.direct_memifs.remove(name);
      }
    })
    .map_err(|e| anyhow::Error::new(e).context("Agent delete task failed to rejoin"))
    .boxed()
  }
}

/// Applies the call's accumulated configuration to the agent
///
/// Requests push the configuration before continuing; closes remove it, then continue
/// whether or not removal succeeded.
pub struct CommitServer {
  sink: Arc<dyn ConfigSink>,
}

impl CommitServer {
  pub fn new(sink: Arc<dyn ConfigSink>) -> Self {
    Self { sink }
  }
}

impl NetworkServiceServer for CommitServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      let snapshot = DataplaneConfig::from_context(ctx)?.snapshot();
      ctx.ensure_active()?;
      tracing::debug!(
        connection_id = %request.connection.id,
        interfaces = ?snapshot.interface_names(),
        "Committing dataplane configuration"
      );
      self
        .sink
        .update(snapshot)
        .await
        .map_err(|e| ChainError::Commit(e.into()))?;
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
    async move {
      let deleted = match DataplaneConfig::from_context(ctx) {
        Ok(config) => self
          .sink
          .delete(config.snapshot())
          .await
          .map_err(|e| ChainError::Commit(e.into())),
        Err(e) => Err(e),
      };
      let delegated = next.close(ctx, connection).await;
      close_with_cleanup(delegated, deleted)
    }
    .boxed()
  }
}
