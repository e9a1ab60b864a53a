// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Connection;

pub mod cls {
  pub const LOCAL: &str = "LOCAL";
  pub const REMOTE: &str = "REMOTE";
}

pub const KERNEL: &str = "KERNEL";
pub const MEMIF: &str = "MEMIF";
pub const VXLAN: &str = "VXLAN";
pub const SRV6: &str = "SRV6";

/// Namespace identity of the process on the far end of a kernel mechanism
pub const NETNS_INODE_KEY: &str = "netnsInode";
/// Requested in-namespace interface name for a kernel mechanism
pub const INTERFACE_NAME_KEY: &str = "name";
pub const SOCKET_DIR_KEY: &str = "socketDir";
pub const SRC_IP_KEY: &str = "src_ip";

/// Longest interface name the kernel accepts, excluding the terminator
pub const LINUX_IFNAMSIZ: usize = 15;

/// A connection mechanism; one of the offered preferences, or the selected result
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
  pub cls: String,
  #[serde(rename = "type")]
  pub mechanism_type: String,
  #[serde(default)]
  pub parameters: BTreeMap<String, String>,
}

impl Mechanism {
  pub fn new<C: Into<String>, T: Into<String>>(cls: C, mechanism_type: T) -> Self {
    Self {
      cls: cls.into(),
      mechanism_type: mechanism_type.into(),
      parameters: BTreeMap::new(),
    }
  }

  pub fn with_parameter<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
    self.parameters.insert(key.into(), value.into());
    self
  }

  pub fn parameter(&self, key: &str) -> Option<&str> {
    self.parameters.get(key).map(String::as_str)
  }

  /// Whether both mechanisms share a class and type, regardless of parameters
  pub fn same_kind(&self, other: &Mechanism) -> bool {
    self.cls == other.cls && self.mechanism_type == other.mechanism_type
  }
}

/// Typed view of a connection whose selected mechanism is a kernel interface
#[derive(Debug, Clone, Copy)]
pub struct KernelMechanism<'a> {
  connection: &'a Connection,
  mechanism: &'a Mechanism,
}

impl<'a> KernelMechanism<'a> {
  pub fn from_connection(connection: &'a Connection) -> Option<Self> {
    connection
      .mechanism
      .as_ref()
      .filter(|m| m.mechanism_type == KERNEL)
      .map(|mechanism| Self {
        connection,
        mechanism,
      })
  }

  pub fn netns_inode(&self) -> Option<&'a str> {
    self
      .mechanism
      .parameter(NETNS_INODE_KEY)
      .filter(|inode| !inode.is_empty())
  }

  /// The in-namespace interface name, defaulting to one derived from the connection id
  pub fn interface_name(&self) -> String {
    match self.mechanism.parameter(INTERFACE_NAME_KEY) {
      Some(name) if !name.is_empty() => linux_interface_name(name),
      _ => linux_interface_name(&format!("nsm{}", self.connection.id)),
    }
  }
}

/// Truncates a name to fit the kernel's interface name limit, on a character boundary
pub fn linux_interface_name(name: &str) -> String {
  if name.len() <= LINUX_IFNAMSIZ {
    return name.to_string();
  }
  let mut end = LINUX_IFNAMSIZ;
  while !name.is_char_boundary(end) {
    end -= 1;
  }
  name[..end].to_string()
}
