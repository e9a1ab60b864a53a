// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use dashmap::DashMap;
use futures::future::{self, FutureExt};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use super::ClientUrl;
use crate::common::chain::{ChainError, ChainFuture, Context, NetworkServiceClient};

/// Options applied when establishing a connection to a next hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialOptions {
  pub connect_timeout_ms: u64,
  /// Transport-specific settings, passed through to the dialer uninterpreted
  pub options: BTreeMap<String, String>,
}

impl Default for DialOptions {
  fn default() -> Self {
    Self {
      connect_timeout_ms: 5_000,
      options: BTreeMap::new(),
    }
  }
}

impl DialOptions {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }
}

/// Produces the client through which calls reach the process at a URL
pub trait Dialer: Send + Sync {
  fn dial<'a>(
    &'a self,
    ctx: &'a Context,
    url: &'a ClientUrl,
    options: &'a DialOptions,
  ) -> ChainFuture<'a, Arc<dyn NetworkServiceClient>>;
}

/// Dials in-process peers registered by URL
#[derive(Default)]
pub struct LocalDialer {
  peers: DashMap<ClientUrl, Arc<dyn NetworkServiceClient>>,
}

impl LocalDialer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(
    &self,
    url: ClientUrl,
    peer: Arc<dyn NetworkServiceClient>,
  ) -> Option<Arc<dyn NetworkServiceClient>> {
    self.peers.insert(url, peer)
  }

  pub fn deregister(&self, url: &ClientUrl) -> Option<Arc<dyn NetworkServiceClient>> {
    self.peers.remove(url).map(|(_, peer)| peer)
  }
}

impl Dialer for LocalDialer {
  fn dial<'a>(
    &'a self,
    _ctx: &'a Context,
    url: &'a ClientUrl,
    _options: &'a DialOptions,
  ) -> ChainFuture<'a, Arc<dyn NetworkServiceClient>> {
    let peer = self
      .peers
      .get(url)
      .map(|peer| peer.value().clone())
      .ok_or_else(|| ChainError::Transport {
        url: url.to_string(),
        source: "No peer is registered at this address".into(),
      });
    future::ready(peer).boxed()
  }
}
