//! Dispatch handler contract.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Failure reported by a dispatch handler.
///
/// The variant decides the entry's fate: `Retryable` goes through the
/// retry budget, `Permanent` is marked `Failed` immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            DispatchError::Retryable(msg) | DispatchError::Permanent(msg) => msg,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Retryable(_))
    }
}

/// Downstream side effect for one queue (ingestion runner, audit forwarder, ...).
///
/// Delivery is at-least-once: a handler may see the same entry again after
/// a crash or lease reclaim and must be idempotent.
#[async_trait]
pub trait DispatchHandler: Send + Sync + 'static {
    /// Typed payload; entries that fail to decode are marked `Failed`.
    type Payload: DeserializeOwned + Send + 'static;

    async fn dispatch(
        &self,
        job_type: &str,
        payload: Self::Payload,
    ) -> Result<(), DispatchError>;
}

#[async_trait]
impl<H: DispatchHandler> DispatchHandler for std::sync::Arc<H> {
    type Payload = H::Payload;

    async fn dispatch(
        &self,
        job_type: &str,
        payload: Self::Payload,
    ) -> Result<(), DispatchError> {
        (**self).dispatch(job_type, payload).await
    }
}

/// Adapter turning an async closure into a handler over raw JSON payloads.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(String, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> DispatchHandler for FnHandler<F>
where
    F: Fn(String, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    type Payload = serde_json::Value;

    async fn dispatch(
        &self,
        job_type: &str,
        payload: Self::Payload,
    ) -> Result<(), DispatchError> {
        (self.f)(job_type.to_string(), payload).await
    }
}
