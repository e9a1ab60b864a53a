// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Control-plane negotiation for a cross-connecting network service forwarder.
//!
//! Requests enter an inbound chain of [`common::chain::NetworkServiceServer`] handlers, which
//! select a local mechanism, open a matching outbound connection through a per-request chain of
//! [`common::chain::NetworkServiceClient`] handlers, and commit the combined dataplane
//! configuration once both sides have been negotiated.

pub mod common;
pub mod server;
pub mod util;
