// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use downcast_rs::{impl_downcast, DowncastSync};
use std::{
  any::{type_name, TypeId},
  fmt,
  sync::Arc,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::error::ChainError;

/// A value carried alongside a single call through a chain
pub trait ContextValue: DowncastSync + fmt::Debug {}
impl_downcast!(sync ContextValue);

struct ValueNode {
  type_id: TypeId,
  type_name: &'static str,
  value: Arc<dyn ContextValue>,
  parent: Option<Arc<ValueNode>>,
}

/// Per-call context: a cancellation signal plus a typed value bag
///
/// Contexts are immutable; [`Context::with_value`] derives a child which shadows any
/// existing value of the same type for everything downstream of it, leaving the parent
/// untouched. Derived contexts share the parent's cancellation signal.
#[derive(Clone)]
pub struct Context {
  cancellation: CancellationToken,
  values: Option<Arc<ValueNode>>,
}

impl Context {
  pub fn new() -> Self {
    Self::with_cancellation(CancellationToken::new())
  }

  pub fn with_cancellation(cancellation: CancellationToken) -> Self {
    Self {
      cancellation,
      values: None,
    }
  }

  pub fn with_value<T: ContextValue>(&self, value: T) -> Self {
    self.with_shared_value(Arc::new(value))
  }

  pub fn with_shared_value<T: ContextValue>(&self, value: Arc<T>) -> Self {
    Self {
      cancellation: self.cancellation.clone(),
      values: Some(Arc::new(ValueNode {
        type_id: TypeId::of::<T>(),
        type_name: type_name::<T>(),
        value,
        parent: self.values.clone(),
      })),
    }
  }

  fn find(&self, type_id: TypeId) -> Option<&Arc<dyn ContextValue>> {
    let mut node = self.values.as_deref();
    while let Some(current) = node {
      if current.type_id == type_id {
        return Some(&current.value);
      }
      node = current.parent.as_deref();
    }
    None
  }

  pub fn value<T: ContextValue>(&self) -> Option<&T> {
    self
      .find(TypeId::of::<T>())
      .and_then(|value| value.downcast_ref::<T>())
  }

  pub fn shared_value<T: ContextValue>(&self) -> Option<Arc<T>> {
    self
      .find(TypeId::of::<T>())
      .and_then(|value| value.clone().downcast_arc::<T>().ok())
  }

  pub fn require<T: ContextValue>(&self) -> Result<&T, ChainError> {
    self
      .value::<T>()
      .ok_or(ChainError::MissingContext(type_name::<T>()))
  }

  /// A context sharing this one's cancellation signal but carrying no values
  ///
  /// Used when a call leaves the process, where in-process values have no meaning.
  pub fn detached(&self) -> Self {
    Self::with_cancellation(self.cancellation.clone())
  }

  /// A context carrying the same values, cancelled with this one or on its own
  pub fn child(&self) -> Self {
    Self {
      cancellation: self.cancellation.child_token(),
      values: self.values.clone(),
    }
  }

  pub fn cancel(&self) {
    self.cancellation.cancel()
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancellation.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.cancellation.cancelled()
  }

  pub fn cancellation_token(&self) -> &CancellationToken {
    &self.cancellation
  }

  /// Fails with [`ChainError::Cancelled`] once cancellation has been requested
  pub fn ensure_active(&self) -> Result<(), ChainError> {
    if self.is_cancelled() {
      Err(ChainError::Cancelled)
    } else {
      Ok(())
    }
  }
}

impl Default for Context {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for Context {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names = Vec::new();
    let mut node = self.values.as_deref();
    while let Some(current) = node {
      names.push(current.type_name);
      node = current.parent.as_deref();
    }
    f.debug_struct("Context")
      .field("cancelled", &self.is_cancelled())
      .field("values", &names)
      .finish()
  }
}
