// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};

/// Splits a next-hop URL into its scheme and remainder, rejecting anything without both
pub fn parse_client_url(v: &str) -> Result<(&str, &str)> {
  match v.split_once("://") {
    None => Err(AnyErr::msg("Could not match '://' in client URL")),
    Some(("", _)) => Err(AnyErr::msg("Client URL scheme was empty")),
    Some((_, "")) => Err(AnyErr::msg("Client URL had no address following its scheme")),
    Some((scheme, _)) if !scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) => {
      Err(AnyErr::msg(format!("Client URL scheme {:?} contained invalid characters", scheme)))
    }
    Some(parts) => Ok(parts),
  }
}

pub fn validate_client_url(v: &str) -> Result<(), String> {
  parse_client_url(v).map(|_| ()).map_err(|e| e.to_string())
}
