//! Provider capability surface consumed by the lifecycle engine
//!
//! Concrete backends (remote APIs, local model servers) live outside this crate.
//! The engine only needs to connect, disconnect, ping and dispose of them, and
//! to mint fresh sessions from an existing one.

use crate::error::LifecycleError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Provider trait implemented by every pluggable backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier shared by every session of this provider
    fn id(&self) -> &str;

    /// Open the session
    async fn connect(&self) -> Result<(), LifecycleError>;

    /// Close the session
    async fn disconnect(&self) -> Result<(), LifecycleError>;

    /// Lightweight liveness check, returning the observed latency
    async fn ping(&self) -> Result<Duration, LifecycleError>;

    /// Release any resources held beyond the session itself
    async fn dispose(&self) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Mint a new, unconnected session from this provider's descriptor.
    ///
    /// The returned provider must not share a live session with `self`; the
    /// pool calls [`Provider::connect`] on it before handing it out.
    fn fork(&self) -> Arc<dyn Provider>;
}

/// Shared handle to one provider session.
///
/// Two handles are equal only when they point at the same session.
#[derive(Clone)]
pub struct ProviderHandle {
    inner: Arc<dyn Provider>,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { inner: provider }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.inner
    }

    /// Whether both handles refer to the same session
    pub fn same_session(&self, other: &ProviderHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// New handle around a forked, unconnected session
    pub fn fork(&self) -> ProviderHandle {
        ProviderHandle::new(self.inner.fork())
    }

    /// Disconnect then dispose, reporting the first failure after attempting both
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        let disconnected = self.inner.disconnect().await;
        let disposed = self.inner.dispose().await;
        disconnected.and(disposed)
    }
}

impl std::ops::Deref for ProviderHandle {
    type Target = dyn Provider;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl PartialEq for ProviderHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_session(other)
    }
}

impl Eq for ProviderHandle {}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.inner.id())
            .field("session", &Arc::as_ptr(&self.inner).cast::<()>())
            .finish()
    }
}

impl From<Arc<dyn Provider>> for ProviderHandle {
    fn from(provider: Arc<dyn Provider>) -> Self {
        Self::new(provider)
    }
}
