// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Mechanisms the forwarder passes to vpp as opaque interface descriptions
use futures::future::FutureExt;
use std::{collections::BTreeMap, fmt, net::IpAddr, path::Path, sync::Arc};
use tokio::sync::OnceCell;

use super::{interface_key, MechanismHandler, Role};
use crate::common::{
  chain::{ChainError, ChainFuture, Context},
  dataplane::{DataplaneConfig, VppInterface, VppLink},
  protocol::{
    mechanism::{cls, MEMIF, SOCKET_DIR_KEY, SRC_IP_KEY, SRV6, VXLAN},
    Connection, Mechanism,
  },
};

type InitFn = dyn Fn(&DataplaneConfig) -> anyhow::Result<()> + Send + Sync;

/// Initial dataplane configuration for a mechanism, written by the first call selecting it
///
/// A failed initialization is retried by the next call.
pub struct InitOnce {
  init: Box<InitFn>,
  done: OnceCell<()>,
}

impl InitOnce {
  pub fn new<F>(init: F) -> Self
  where
    F: Fn(&DataplaneConfig) -> anyhow::Result<()> + Send + Sync + 'static,
  {
    Self {
      init: Box::new(init),
      done: OnceCell::new(),
    }
  }

  pub fn is_done(&self) -> bool {
    self.done.initialized()
  }

  async fn run(&self, config: &DataplaneConfig) -> Result<(), ChainError> {
    self
      .done
      .get_or_try_init(|| async {
        tracing::debug!("Writing initial mechanism configuration");
        (self.init)(config).map_err(|e| ChainError::Initialization(e.into()))
      })
      .await
      .map(|_| ())
  }
}

impl fmt::Debug for InitOnce {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InitOnce")
      .field("done", &self.is_done())
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Clone)]
pub struct GenericMechanism {
  class: String,
  mechanism_type: String,
  advertised: BTreeMap<String, String>,
  init: Option<Arc<InitOnce>>,
}

impl GenericMechanism {
  pub fn new<C: Into<String>, T: Into<String>>(class: C, mechanism_type: T) -> Self {
    Self {
      class: class.into(),
      mechanism_type: mechanism_type.into(),
      advertised: BTreeMap::new(),
      init: None,
    }
  }

  /// Adds a parameter to the preference this mechanism offers
  pub fn with_advertised<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
    self.advertised.insert(key.into(), value.into());
    self
  }

  /// Shares one initialization between every handler given the same [`InitOnce`]
  pub fn with_init(mut self, init: Arc<InitOnce>) -> Self {
    self.init = Some(init);
    self
  }

  pub fn memif(base_dir: &Path) -> Self {
    Self::new(cls::LOCAL, MEMIF).with_advertised(SOCKET_DIR_KEY, base_dir.display().to_string())
  }

  pub fn vxlan(tunnel_ip: IpAddr) -> Self {
    Self::new(cls::REMOTE, VXLAN).with_advertised(SRC_IP_KEY, tunnel_ip.to_string())
  }

  pub fn srv6(tunnel_ip: IpAddr) -> Self {
    Self::new(cls::REMOTE, SRV6).with_advertised(SRC_IP_KEY, tunnel_ip.to_string())
  }

  /// Records the vpp interface for a selected connection, unless it was joined directly
  fn record(
    &self,
    config: &DataplaneConfig,
    connection: &Connection,
    mechanism: &Mechanism,
    role: Role,
  ) {
    let name = interface_key(role, &connection.id);
    if config.is_direct_memif(&name) {
      return;
    }
    config.put_vpp_interface(VppInterface {
      name,
      enabled: true,
      link: VppLink::Mechanism {
        mechanism_type: mechanism.mechanism_type.clone(),
        parameters: mechanism.parameters.clone(),
      },
    });
  }

  fn selected<'c>(&self, connection: &'c Connection) -> Option<&'c Mechanism> {
    connection
      .mechanism
      .as_ref()
      .filter(|_| self.selected_by(connection))
  }
}

impl MechanismHandler for GenericMechanism {
  fn class(&self) -> &str {
    &self.class
  }

  fn mechanism_type(&self) -> &str {
    &self.mechanism_type
  }

  fn preference(&self) -> Mechanism {
    Mechanism {
      cls: self.class.clone(),
      mechanism_type: self.mechanism_type.clone(),
      parameters: self.advertised.clone(),
    }
  }

  fn configure<'a>(
    &'a self,
    ctx: &'a Context,
    connection: &'a Connection,
    role: Role,
  ) -> ChainFuture<'a, ()> {
    async move {
      let mechanism = match self.selected(connection) {
        Some(mechanism) => mechanism,
        None => return Ok(()),
      };
      let config = DataplaneConfig::from_context(ctx)?;
      if let Some(init) = &self.init {
        init.run(config).await?;
      }
      self.record(config, connection, mechanism, role);
      Ok(())
    }
    .boxed()
  }

  fn deconfigure<'a>(
    &'a self,
    ctx: &'a Context,
    connection: &'a Connection,
    role: Role,
  ) -> ChainFuture<'a, ()> {
    async move {
      let mechanism = match self.selected(connection) {
        Some(mechanism) => mechanism,
        None => return Ok(()),
      };
      self.record(DataplaneConfig::from_context(ctx)?, connection, mechanism, role);
      Ok(())
    }
    .boxed()
  }
}
