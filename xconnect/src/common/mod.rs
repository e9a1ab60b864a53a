// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod authorization;
pub mod chain;
pub mod connect;
pub mod dataplane;
pub mod mechanisms;
pub mod netns;
pub mod protocol;
