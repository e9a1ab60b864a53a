// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connection and request records exchanged along a chain
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod mechanism;

pub use mechanism::Mechanism;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpContext {
  pub src_ip_addr: Option<String>,
  pub dst_ip_addr: Option<String>,
  pub src_routes: Vec<String>,
  pub dst_routes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionContext {
  pub ip_context: IpContext,
  pub extra: BTreeMap<String, String>,
}

/// A logical connection between a requester and the provider of a network service
///
/// The `id` is assigned by the first hop which sees it empty, and is stable for the
/// connection's lifetime; `mechanism` is unset until a selector settles on one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub network_service: String,
  #[serde(default)]
  pub mechanism: Option<Mechanism>,
  #[serde(default)]
  pub context: ConnectionContext,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
}

impl Connection {
  pub fn new<S: Into<String>>(id: S) -> Self {
    Self {
      id: id.into(),
      ..Default::default()
    }
  }

  pub fn with_network_service<S: Into<String>>(mut self, network_service: S) -> Self {
    self.network_service = network_service.into();
    self
  }

  pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
    self.mechanism = Some(mechanism);
    self
  }

  pub fn with_label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
    self.labels.insert(key.into(), value.into());
    self
  }

  pub fn mechanism_type(&self) -> Option<&str> {
    self.mechanism.as_ref().map(|m| m.mechanism_type.as_str())
  }
}

/// A connection paired with the ordered mechanism preferences offered for it
///
/// Earlier preferences are preferred; selectors take the first entry they support.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkServiceRequest {
  pub connection: Connection,
  #[serde(default)]
  pub mechanism_preferences: Vec<Mechanism>,
}

impl NetworkServiceRequest {
  pub fn new(connection: Connection) -> Self {
    Self {
      connection,
      mechanism_preferences: Vec::new(),
    }
  }

  pub fn with_preference(mut self, mechanism: Mechanism) -> Self {
    self.mechanism_preferences.push(mechanism);
    self
  }

  pub fn preference_types(&self) -> Vec<String> {
    self
      .mechanism_preferences
      .iter()
      .map(|m| format!("{}/{}", m.cls, m.mechanism_type))
      .collect()
  }
}
