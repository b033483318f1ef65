//! Payload representation
//!
//! A payload is the opaque callable carried by a workload: void-returning,
//! result-returning, or asynchronously result-returning. The `TypeId` of the
//! concrete callable serves as the stable identity key for virtual-time
//! accounting; every workload built from the same closure or function item
//! shares one timing entry.

use std::any::{Any, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use futures::future::BoxFuture;

use super::WorkloadContext;

/// Stable identity of a payload, derived from its concrete type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId(u64);

impl PayloadId {
    /// Identity of the callable type `F`
    pub fn of<F: 'static>() -> Self {
        let mut hasher = DefaultHasher::new();
        TypeId::of::<F>().hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Raw key value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Boxed result value as stored in the outcome cell
pub(crate) type BoxedValue = Box<dyn Any + Send>;

/// The executable body of a workload, taken exactly once
pub(crate) enum Payload {
    /// Void-returning
    Unit(Box<dyn FnOnce(WorkloadContext) + Send>),
    /// Result-returning
    Value(Box<dyn FnOnce(WorkloadContext) -> BoxedValue + Send>),
    /// Asynchronously result-returning; driven to completion on the worker
    Future(Box<dyn FnOnce(WorkloadContext) -> BoxFuture<'static, BoxedValue> + Send>),
}

impl Payload {
    pub(crate) fn unit<F>(f: F) -> (Self, PayloadId)
    where
        F: FnOnce(WorkloadContext) + Send + 'static,
    {
        (Payload::Unit(Box::new(f)), PayloadId::of::<F>())
    }

    pub(crate) fn value<F, T>(f: F) -> (Self, PayloadId)
    where
        F: FnOnce(WorkloadContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        (
            Payload::Value(Box::new(move |ctx| Box::new(f(ctx)) as BoxedValue)),
            PayloadId::of::<F>(),
        )
    }

    pub(crate) fn future<F, Fut, T>(f: F) -> (Self, PayloadId)
    where
        F: FnOnce(WorkloadContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        (
            Payload::Future(Box::new(move |ctx| {
                Box::pin(async move { Box::new(f(ctx).await) as BoxedValue })
            })),
            PayloadId::of::<F>(),
        )
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Payload::Unit(_) => "Unit",
            Payload::Value(_) => "Value",
            Payload::Future(_) => "Future",
        };
        f.debug_tuple("Payload").field(&kind).finish()
    }
}
