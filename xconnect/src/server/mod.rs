// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod config;
pub mod endpoint;
pub mod xconnectns;

pub use config::{ConfigError, ForwarderConfig};
pub use endpoint::{Endpoint, SetIdServer};
pub use xconnectns::{Forwarder, ForwarderBuilder};
