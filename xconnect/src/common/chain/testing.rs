// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Handler fakes for chain tests
use futures::future::FutureExt;
use std::sync::{Arc, Mutex};

use super::{
  ChainError, ChainFuture, ClientNext, CloseAck, Context, NetworkServiceClient,
  NetworkServiceServer, ServerNext,
};
use crate::common::protocol::{Connection, NetworkServiceRequest};

#[derive(Clone, Default, Debug)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
  pub fn record<S: Into<String>>(&self, entry: S) {
    self.0.lock().unwrap().push(entry.into());
  }

  pub fn entries(&self) -> Vec<String> {
    self.0.lock().unwrap().clone()
  }
}

/// Records each phase it sees, then delegates unless told to fail
pub struct RecordingServer {
  name: String,
  journal: Journal,
  fail_requests: bool,
  fail_closes: bool,
}

impl RecordingServer {
  pub fn new(name: &str, journal: &Journal) -> Self {
    Self {
      name: name.to_string(),
      journal: journal.clone(),
      fail_requests: false,
      fail_closes: false,
    }
  }

  pub fn failing_requests(mut self) -> Self {
    self.fail_requests = true;
    self
  }

  pub fn failing_closes(mut self) -> Self {
    self.fail_closes = true;
    self
  }
}

impl NetworkServiceServer for RecordingServer {
  fn request<'a>(
    &'a self,
    ctx: &'a Context,
    request: NetworkServiceRequest,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    self.journal.record(format!("request:{}", self.name));
    if self.fail_requests {
      return futures::future::ready(Err(ChainError::Unavailable)).boxed();
    }
    next.request(ctx, request)
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    self.journal.record(format!("close:{}", self.name));
    if self.fail_closes {
      return futures::future::ready(Err(ChainError::Unavailable)).boxed();
    }
    next.close(ctx, connection)
  }
}

type Responder =
  Box<dyn Fn(&NetworkServiceRequest) -> Result<Connection, ChainError> + Send + Sync>;

/// Terminates a client chain, remembering every request and close it received
pub struct CapturingClient {
  requests: Mutex<Vec<NetworkServiceRequest>>,
  closes: Mutex<Vec<Connection>>,
  respond: Responder,
}

impl CapturingClient {
  /// Responds with the offered connection, unchanged
  pub fn echo() -> Self {
    Self::responding(|request| Ok(request.connection.clone()))
  }

  pub fn responding<F>(respond: F) -> Self
  where
    F: Fn(&NetworkServiceRequest) -> Result<Connection, ChainError> + Send + Sync + 'static,
  {
    Self {
      requests: Mutex::new(Vec::new()),
      closes: Mutex::new(Vec::new()),
      respond: Box::new(respond),
    }
  }

  pub fn requests(&self) -> Vec<NetworkServiceRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn closes(&self) -> Vec<Connection> {
    self.closes.lock().unwrap().clone()
  }
}

impl NetworkServiceClient for CapturingClient {
  fn request<'a>(
    &'a self,
    _ctx: &'a Context,
    request: NetworkServiceRequest,
    _next: ClientNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    let response = (self.respond)(&request);
    self.requests.lock().unwrap().push(request);
    futures::future::ready(response).boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ClientNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    self.closes.lock().unwrap().push(connection.clone());
    next.close(ctx, connection)
  }
}

/// Terminates a server chain, remembering every request it received
pub struct CapturingServer {
  requests: Mutex<Vec<NetworkServiceRequest>>,
}

impl CapturingServer {
  pub fn new() -> Self {
    Self {
      requests: Mutex::new(Vec::new()),
    }
  }

  pub fn requests(&self) -> Vec<NetworkServiceRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl NetworkServiceServer for CapturingServer {
  fn request<'a>(
    &'a self,
    _ctx: &'a Context,
    request: NetworkServiceRequest,
    _next: ServerNext<'a>,
  ) -> ChainFuture<'a, Connection> {
    let connection = request.connection.clone();
    self.requests.lock().unwrap().push(request);
    futures::future::ready(Ok(connection)).boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a Context,
    connection: Connection,
    next: ServerNext<'a>,
  ) -> ChainFuture<'a, CloseAck> {
    next.close(ctx, connection)
  }
}
