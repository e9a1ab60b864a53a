// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Mechanism negotiation: originators offer, selectors choose, both configure
use futures::future::FutureExt;
use std::{fmt, sync::Arc};

use crate::common::{
  chain::{
    close_with_cleanup, ChainError, ChainFuture, ClientNext, CloseAck, Context,
    NetworkServiceClient, NetworkServiceServer, ServerNext,
  },
  protocol::{Connection, Mechanism, NetworkServiceRequest},
};

pub mod generic;
pub mod kernel;

pub use generic::{GenericMechanism, InitOnce};
pub use kernel::KernelVethPair;

/// Which side of the forwarder a connection is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
  /// The outbound connection, towards the next hop
  Client,
  /// The inbound connection, from the requester
  Server,
}

impl Role {
  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Client => "client",
      Role::Server => "server",
    }
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Configuration key for a connection's interface; distinct per role and connection id
pub fn interface_key(role: Role, connection_id: &str) -> String {
  format!("{}-{}", role, connection_id)
}

/// Mechanism-specific preference and configuration logic
///
/// `configure` runs once the mechanism is known: it must do nothing unless the
/// connection's selected mechanism is this handler's type, and must write only keys
/// derived from the role and connection id, so that repeating it is harmless.
pub trait MechanismHandler: Send + Sync {
  fn class(&self) -> &str;

  fn mechanism_type(&self) -> &str;

  /// The preference this handler offers, in the form appended to outbound requests
  fn preference(&self) -> Mechanism {
    Mechanism::new(self.class(), self.mechanism_type())
  }

  fn configure<'a>(
    &'a self,
    ctx: &'a Context,
    connection: &'a Connection,
    role: Role,
  ) -> ChainFuture<'a, ()>;

  /// Records the entries a close must remove
  fn deconfigure<'a>(
    &'a self,
    ctx: &'a Context,
    connection: &'a Connection,
    role: Role,
  ) -> ChainFuture<'a, ()> {
    self.configure(ctx, connection, role)
  }

  fn selected_by(&self, connection: &Connection) -> bool {
    connection
      .mechanism
      .as_ref()
      .map_or(false, |m| m.cls == self.class() && m.mechanism_type == self.mechanism_type())
  }
}

/// Outbound half of a mechanism: offers its preference, configures what the next hop chose
pub struct Originator {
  handler: Arc<dyn MechanismHandler>,
}

impl Originator {
  pub fn new(handler: Arc<dyn MechanismHandler>) -> Self {
    Self { handler }
  }
}

impl NetworkServiceClient for Originator {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    mut request: NetworkServiceRequest,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      request.mechanism_preferences.push(self.handler.preference());
      let connection = next
        .request(ctx, request)
        .await
        .map_err(|e| ChainError::delegation(e))?;
      if self.handler.selected_by(&connection) {
        ctx.ensure_active()?;
        self
          .handler
          .configure(ctx, &connection, Role::Client)
          .await?;
      }
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
      let delegated = next
        .close(ctx, connection.clone())
        .await
        .map_err(|e| ChainError::delegation(e));
      let cleanup = self
        .handler
        .deconfigure(ctx, &connection, Role::Client)
        .await;
      close_with_cleanup(delegated, cleanup)
    }
    .boxed()
  }
}

/// Inbound half of a mechanism: picks the requester's first preference any sibling
/// selector supports, then configures if the pick is its own type
///
/// A mechanism already set on the connection is kept as-is.
pub struct Selector {
  handler: Arc<dyn MechanismHandler>,
  supported: Arc<[Mechanism]>,
}

impl Selector {
  pub fn new(handler: Arc<dyn MechanismHandler>, supported: Arc<[Mechanism]>) -> Self {
    Self { handler, supported }
  }

  fn select(&self, request: &mut NetworkServiceRequest) -> Result<(), ChainError> {
    if request.connection.mechanism.is_some() {
      return Ok(());
    }
    let selected = request
      .mechanism_preferences
      .iter()
      .find(|offered| self.supported.iter().any(|s| s.same_kind(offered)))
      .cloned();
    match selected {
      Some(mechanism) => {
        tracing::debug!(
          connection_id = %request.connection.id,
          cls = %mechanism.cls,
          mechanism = %mechanism.mechanism_type,
          "Selected mechanism"
        );
        request.connection.mechanism = Some(mechanism);
        Ok(())
      }
      None => Err(ChainError::NegotiationFailed {
        offered: request.preference_types(),
      }),
    }
  }
}

impl NetworkServiceServer for Selector {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    mut request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    async move {
      self.select(&mut request)?;
      if self.handler.selected_by(&request.connection) {
        ctx.ensure_active()?;
        self
          .handler
          .configure(ctx, &request.connection, Role::Server)
          .await?;
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
    async move {
      let cleanup = self
        .handler
        .deconfigure(ctx, &connection, Role::Server)
        .await;
      let delegated = next.close(ctx, connection).await;
      close_with_cleanup(delegated, cleanup)
    }
    .boxed()
  }
}

/// The ordered, immutable set of mechanisms a forwarder side supports
#[derive(Clone)]
pub struct PreferenceRegistry {
  handlers: Arc<[Arc<dyn MechanismHandler>]>,
}

impl PreferenceRegistry {
  pub fn new(handlers: Vec<Arc<dyn MechanismHandler>>) -> Self {
    Self {
      handlers: handlers.into(),
    }
  }

  pub fn len(&self) -> usize {
    self.handlers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handlers.is_empty()
  }

  /// Preferences in the order they are offered
  pub fn preferences(&self) -> Vec<Mechanism> {
    self.handlers.iter().map(|h| h.preference()).collect()
  }

  pub fn supports(&self, mechanism: &Mechanism) -> bool {
    self
      .handlers
      .iter()
      .any(|h| h.class() == mechanism.cls && h.mechanism_type() == mechanism.mechanism_type)
  }

  pub fn originators(&self) -> Vec<Arc<dyn NetworkServiceClient>> {
    self
      .handlers
      .iter()
      .map(|h| Arc::new(Originator::new(h.clone())) as Arc<dyn NetworkServiceClient>)
      .collect()
  }

  pub fn selectors(&self) -> Vec<Arc<dyn NetworkServiceServer>> {
    let supported: Arc<[Mechanism]> = self.preferences().into();
    self
      .handlers
      .iter()
      .map(|h| Arc::new(Selector::new(h.clone(), supported.clone())) as Arc<dyn NetworkServiceServer>)
      .collect()
  }
}

impl fmt::Debug for PreferenceRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list()
      .entries(self.handlers.iter().map(|h| format!("{}/{}", h.class(), h.mechanism_type())))
      .finish()
  }
}
