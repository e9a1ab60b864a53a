// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Mapping a network namespace identity onto a handle usable by the dataplane
use std::{
  io,
  path::{Path, PathBuf},
};

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
  #[error("Mechanism carried no namespace identity")]
  MissingIdentity,
  #[error("Namespace identity {0:?} is not an inode number")]
  InvalidIdentity(String),
  #[error("No process is attached to the network namespace with inode {0}")]
  NotFound(u64),
  #[error("Namespace lookup failed")]
  Io(#[from] io::Error),
}

/// Resolves a namespace identity, as carried in mechanism parameters, to a namespace handle
///
/// Implementations may block; callers run them off the async workers.
#[cfg_attr(test, mockall::automock)]
pub trait NetNsResolver: Send + Sync {
  fn resolve(&self, identity: &str) -> Result<String, ResolveError>;
}

impl<F> NetNsResolver for F
where
  F: Fn(&str) -> Result<String, ResolveError> + Send + Sync,
{
  fn resolve(&self, identity: &str) -> Result<String, ResolveError> {
    self(identity)
  }
}

/// Finds a process attached to the namespace by scanning a procfs mount
#[derive(Debug, Clone)]
pub struct ProcfsNetNsResolver {
  proc_root: PathBuf,
}

impl Default for ProcfsNetNsResolver {
  fn default() -> Self {
    Self::with_proc_root("/proc")
  }
}

impl ProcfsNetNsResolver {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_proc_root<P: Into<PathBuf>>(proc_root: P) -> Self {
    Self {
      proc_root: proc_root.into(),
    }
  }

  /// Accepts either a bare inode number or a `scheme://device/inode` form
  pub fn parse_identity(identity: &str) -> Result<u64, ResolveError> {
    if identity.is_empty() {
      return Err(ResolveError::MissingIdentity);
    }
    let inode = match identity.split_once("://") {
      Some((_, path)) => path.rsplit('/').next().unwrap_or(path),
      None => identity,
    };
    inode
      .parse::<u64>()
      .map_err(|_| ResolveError::InvalidIdentity(identity.to_string()))
  }

  fn is_pid_dir(name: &std::ffi::OsStr) -> bool {
    name
      .to_str()
      .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
  }
}

#[cfg(unix)]
fn inode_of(path: &Path) -> io::Result<u64> {
  use std::os::unix::fs::MetadataExt;
  std::fs::metadata(path).map(|m| m.ino())
}

#[cfg(not(unix))]
fn inode_of(path: &Path) -> io::Result<u64> {
  Err(io::Error::new(
    io::ErrorKind::Unsupported,
    format!("Cannot inspect namespace inode of {}", path.display()),
  ))
}

impl NetNsResolver for ProcfsNetNsResolver {
  fn resolve(&self, identity: &str) -> Result<String, ResolveError> {
    let inode = Self::parse_identity(identity)?;
    let own = self.proc_root.join("self").join("ns").join("net");
    if matches!(inode_of(&own), Ok(found) if found == inode) {
      return Ok(own.display().to_string());
    }
    for entry in std::fs::read_dir(&self.proc_root)? {
      let entry = match entry {
        Ok(entry) => entry,
        Err(_) => continue,
      };
      if !Self::is_pid_dir(&entry.file_name()) {
        continue;
      }
      let candidate = entry.path().join("ns").join("net");
      // Processes exit or deny access mid-scan
      match inode_of(&candidate) {
        Ok(found) if found == inode => {
          tracing::trace!(inode, path = %candidate.display(), "Resolved network namespace");
          return Ok(candidate.display().to_string());
        }
        _ => continue,
      }
    }
    Err(ResolveError::NotFound(inode))
  }
}
