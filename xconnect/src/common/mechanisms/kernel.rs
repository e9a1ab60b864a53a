// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Kernel interfaces delivered as a veth pair, one end inside the peer's namespace
use futures::future::FutureExt;
use std::sync::Arc;

use super::{interface_key, MechanismHandler, Originator, Role, Selector};
use crate::common::{
  chain::{ChainError, ChainFuture, Context, NetworkServiceClient},
  dataplane::{DataplaneConfig, LinuxInterface, VppInterface, VppLink},
  netns::{NetNsResolver, ProcfsNetNsResolver, ResolveError},
  protocol::{
    mechanism::{cls, linux_interface_name, KernelMechanism, KERNEL},
    Connection, Mechanism,
  },
};

pub struct KernelVethPair {
  resolver: Arc<dyn NetNsResolver>,
}

impl Default for KernelVethPair {
  fn default() -> Self {
    Self::new()
  }
}

impl KernelVethPair {
  pub fn new() -> Self {
    Self::with_shared_resolver(Arc::new(ProcfsNetNsResolver::default()))
  }

  /// Substitutes namespace resolution, for callers without a procfs to scan
  pub fn with_resolver<R: NetNsResolver + 'static>(resolver: R) -> Self {
    Self::with_shared_resolver(Arc::new(resolver))
  }

  pub fn with_shared_resolver(resolver: Arc<dyn NetNsResolver>) -> Self {
    Self { resolver }
  }

  /// An outbound handler offering kernel interfaces, resolving namespaces via procfs
  pub fn client() -> Arc<dyn NetworkServiceClient> {
    Arc::new(Originator::new(Arc::new(Self::new())))
  }

  pub fn testable_client<R: NetNsResolver + 'static>(resolver: R) -> Arc<dyn NetworkServiceClient> {
    Arc::new(Originator::new(Arc::new(Self::with_resolver(resolver))))
  }

  /// An inbound handler accepting kernel interfaces, and only kernel interfaces
  pub fn selector<R: NetNsResolver + 'static>(resolver: R) -> Selector {
    let supported: Arc<[Mechanism]> = vec![Mechanism::new(cls::LOCAL, KERNEL)].into();
    Selector::new(Arc::new(Self::with_resolver(resolver)), supported)
  }

  async fn resolve(&self, ctx: &Context, identity: &str) -> Result<String, ChainError> {
    let resolver = self.resolver.clone();
    let lookup = tokio::task::spawn_blocking({
      let identity = identity.to_string();
      move || resolver.resolve(&identity)
    });
    tokio::select! {
      biased;
      _ = ctx.cancelled() => Err(ChainError::Cancelled),
      joined = lookup => match joined {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(source)) => Err(ChainError::ResolutionFailed {
          identity: identity.to_string(),
          source,
        }),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(ChainError::Cancelled),
      },
    }
  }

  /// Writes the veth pair and its vpp attachment, keyed by role and connection id
  fn append_interface_config(
    config: &DataplaneConfig,
    connection: &Connection,
    kernel: &KernelMechanism<'_>,
    role: Role,
    namespace: Option<String>,
  ) {
    let name = interface_key(role, &connection.id);
    let peer_name = format!("{}-veth", name);
    // Host-side names share one namespace; derive them from the id, which is unique
    let host_side = linux_interface_name(&format!("v{}{}", &role.as_str()[..1], connection.id));
    config.put_linux_interface(LinuxInterface {
      name: name.clone(),
      host_if_name: kernel.interface_name(),
      namespace,
      veth_peer: peer_name.clone(),
      enabled: true,
      ip_addresses: Vec::new(),
      routes: Vec::new(),
    });
    config.put_linux_interface(LinuxInterface {
      name: peer_name.clone(),
      host_if_name: host_side.clone(),
      namespace: None,
      veth_peer: name.clone(),
      enabled: true,
      ip_addresses: Vec::new(),
      routes: Vec::new(),
    });
    config.put_vpp_interface(VppInterface {
      name,
      enabled: true,
      link: VppLink::AfPacket {
        host_if_name: host_side,
      },
    });
  }
}

impl MechanismHandler for KernelVethPair {
  fn class(&self) -> &str {
    cls::LOCAL
  }

  fn mechanism_type(&self) -> &str {
    KERNEL
  }

  fn configure<'a>(
    &'a self,
    ctx: &'a Context,
    connection: &'a Connection,
    role: Role,
  ) -> ChainFuture<'a, ()> {
    async move {
      let kernel = match KernelMechanism::from_connection(connection) {
        Some(kernel) => kernel,
        None => return Ok(()),
      };
      let config = DataplaneConfig::from_context(ctx)?;
      let identity = kernel
        .netns_inode()
        .ok_or_else(|| ChainError::ResolutionFailed {
          identity: String::new(),
          source: ResolveError::MissingIdentity,
        })?;
      let namespace = self.resolve(ctx, identity).await?;
      tracing::debug!(
        connection_id = %connection.id,
        %role,
        %namespace,
        "Configuring kernel interface"
      );
      Self::append_interface_config(config, connection, &kernel, role, Some(namespace));
      Ok(())
    }
    .boxed()
  }

  /// Removal needs only the entry names, so the entries are written even when the
  /// namespace can no longer be resolved; the resolution failure is still reported
  fn deconfigure<'a>(
    &'a self,
    ctx: &'a Context,
    connection: &'a Connection,
    role: Role,
  ) -> ChainFuture<'a, ()> {
    async move {
      let kernel = match KernelMechanism::from_connection(connection) {
        Some(kernel) => kernel,
        None => return Ok(()),
      };
      let config = DataplaneConfig::from_context(ctx)?;
      let resolved = match kernel.netns_inode() {
        Some(identity) => self.resolve(ctx, identity).await,
        None => Err(ChainError::ResolutionFailed {
          identity: String::new(),
          source: ResolveError::MissingIdentity,
        }),
      };
      match resolved {
        Ok(namespace) => {
          Self::append_interface_config(config, connection, &kernel, role, Some(namespace));
          Ok(())
        }
        Err(e) => {
          Self::append_interface_config(config, connection, &kernel, role, None);
          Err(e)
        }
      }
    }
    .boxed()
  }
}
