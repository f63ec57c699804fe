use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::sandbox::{Error, Result};

/// Per-request context: the containerd namespace the request is scoped to
/// and the caller's cancellation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    namespace: Option<String>,
    cancel: CancellationToken,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancels the context once `timeout` elapses.
    /// Must be called from within a tokio runtime.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    pub fn namespace_required(&self) -> Result<&str> {
        self.namespace()
            .ok_or_else(|| Error::NotFound("namespace is required".to_string()))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Code;

    #[test]
    fn test_namespace_required() {
        let ctx = Context::new();
        assert_eq!(ctx.namespace_required().unwrap_err().code(), Code::NotFound);

        let ctx = Context::new().with_namespace("");
        assert!(ctx.namespace_required().is_err());

        let ctx = Context::new().with_namespace("default");
        assert_eq!(ctx.namespace_required().unwrap(), "default");
    }

    #[tokio::test]
    async fn test_with_timeout_cancels() {
        let ctx = Context::new().with_timeout(Duration::from_millis(1));
        tokio::time::timeout(Duration::from_secs(5), ctx.cancellation().cancelled())
            .await
            .unwrap();
        assert!(ctx.cancellation().is_cancelled());
    }
}
