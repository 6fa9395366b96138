//! The seam between the lifecycle and an embedded server.

use async_trait::async_trait;

use crate::error::Result;
use crate::notify::NotifyListener;

/// What the lifecycle needs from an embedded request/response server.
///
/// The lifecycle binds (or inherits) the listener; the server only accepts
/// on it, drains on request, and reports how serving ended.
#[async_trait]
pub trait Server: Send + Sync {
    /// The address to listen on, e.g. `"127.0.0.1:8080"` or `":8080"`.
    fn addr(&self) -> String;

    /// Serves connections accepted from `listener` until shutdown or a
    /// terminal error.
    ///
    /// Return [`Error::ServerClosed`](crate::Error::ServerClosed) when
    /// serving ended because [`shutdown`](Server::shutdown) was requested;
    /// the lifecycle swallows that sentinel and reports everything else.
    async fn serve(&self, listener: NotifyListener) -> Result<()>;

    /// Gracefully drains in-flight work and makes `serve` return.
    ///
    /// May be called before `serve` ever ran (startup was aborted) and must
    /// be harmless in that case.
    async fn shutdown(&self) -> Result<()>;
}
