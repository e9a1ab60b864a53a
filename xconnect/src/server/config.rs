// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Context as AnyhowContext;
use serde::{Deserialize, Serialize};
use std::{
  net::{IpAddr, Ipv4Addr},
  path::{Path, PathBuf},
  time::Duration,
};

use crate::{common::connect::DialOptions, util::validators};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Forwarder name must not be empty")]
  EmptyName,
  #[error("Invalid next-hop URL {url:?}: {reason}")]
  InvalidClientUrl { url: String, reason: String },
  #[error("Request timeout must be greater than zero")]
  ZeroRequestTimeout,
  #[error("Failure deserializing forwarder configuration: {0}")]
  Deserialization(#[from] serde_json::Error),
}

/// Settings for a [`super::Forwarder`], loadable from JSON with every field optional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
  pub name: String,
  /// Directory under which memif sockets are advertised
  pub base_dir: PathBuf,
  /// Local endpoint for vxlan and srv6 tunnels
  pub tunnel_ip: IpAddr,
  pub client_url: String,
  pub request_timeout_ms: u64,
  pub dial: DialOptions,
}

impl Default for ForwarderConfig {
  fn default() -> Self {
    Self {
      name: "forwarder".into(),
      base_dir: PathBuf::from("/var/lib/networkservicemesh"),
      tunnel_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
      client_url: "unix:///var/lib/networkservicemesh/nsm.io.sock".into(),
      request_timeout_ms: 15_000,
      dial: DialOptions::default(),
    }
  }
}

impl ForwarderConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.name.trim().is_empty() {
      return Err(ConfigError::EmptyName);
    }
    if let Err(reason) = validators::validate_client_url(&self.client_url) {
      return Err(ConfigError::InvalidClientUrl {
        url: self.client_url.clone(),
        reason,
      });
    }
    if self.request_timeout_ms == 0 {
      return Err(ConfigError::ZeroRequestTimeout);
    }
    Ok(())
  }

  pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(raw)?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("Failed reading forwarder configuration from {}", path.display()))?;
    Self::from_json_str(&raw)
      .with_context(|| format!("Invalid forwarder configuration in {}", path.display()))
  }
}
