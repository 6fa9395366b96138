//! A minimal PID-reporting HTTP server.
//!
//! Answers every request with this process's pid; `/sleep?ms=N` delays the
//! answer, which is how the restart tests observe draining. Connection
//! draining follows the guard-and-notify pattern: every in-flight
//! connection holds a guard, shutdown waits until the last one drops.

use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct PidServer {
    addr: String,
    stop: CancellationToken,
    drain: Arc<Drain>,
}

impl PidServer {
    pub fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            stop: CancellationToken::new(),
            drain: Arc::new(Drain {
                active: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }
}

#[async_trait]
impl molt::Server for PidServer {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn serve(&self, listener: molt::NotifyListener) -> molt::Result<()> {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Err(molt::Error::ServerClosed),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let guard = self.drain.guard();
                    tokio::spawn(async move {
                        if let Err(e) = handle(stream).await {
                            debug!(%peer, error = %e, "connection failed");
                        }
                        drop(guard);
                    });
                }
            }
        }
    }

    async fn shutdown(&self) -> molt::Result<()> {
        self.stop.cancel();
        self.drain.drained().await;
        Ok(())
    }
}

struct Drain {
    active: AtomicUsize,
    idle: Notify,
}

impl Drain {
    fn guard(self: &Arc<Self>) -> DrainGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        DrainGuard {
            drain: self.clone(),
        }
    }

    async fn drained(&self) {
        let mut notified = pin!(self.idle.notified());
        loop {
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.as_mut().await;
            notified.set(self.idle.notified());
        }
    }
}

struct DrainGuard {
    drain: Arc<Drain>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.drain.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drain.idle.notify_waiters();
        }
    }
}

async fn handle(mut stream: TcpStream) -> std::io::Result<()> {
    // Only the request line matters here; read until the head ends or the
    // buffer is full.
    let mut buf = [0u8; 4096];
    let mut filled = 0;
    loop {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled].windows(4).any(|w| w == b"\r\n\r\n") || filled == buf.len() {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf[..filled]);
    let target = head.split_whitespace().nth(1).unwrap_or("/");
    if let Some(ms) = sleep_param(target) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let body = std::process::id().to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn sleep_param(target: &str) -> Option<u64> {
    let (path, query) = target.split_once('?')?;
    if path != "/sleep" {
        return None;
    }
    query
        .split('&')
        .find_map(|kv| kv.strip_prefix("ms="))
        .and_then(|v| v.parse().ok())
}
