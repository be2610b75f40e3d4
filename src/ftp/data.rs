//! Passive-mode data channels.
//!
//! `PASV`/`EPSV` allocate a listener on the first free port in the
//! configured range. A spawned accept task hands the connected socket over
//! a capacity-1 channel; transfer commands wait on it with a bounded
//! timeout. Teardown aborts the accept task and drops any pending socket.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::config::FTP_DATA_ACCEPT_TIMEOUT_SECS;

#[derive(Debug)]
pub struct PassiveChannel {
    port: u16,
    ready: mpsc::Receiver<TcpStream>,
    accept_task: JoinHandle<()>,
}

impl PassiveChannel {
    /// Bind the first free port in `[min..=max]` and start accepting one
    /// connection. `None` when the whole range is busy.
    pub async fn open(min: u16, max: u16) -> Option<PassiveChannel> {
        for port in min..=max {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let Ok(listener) = TcpListener::bind(addr).await else {
                continue;
            };
            let (tx, ready) = mpsc::channel(1);
            let accept_task = tokio::spawn(async move {
                if let Ok((stream, peer)) = listener.accept().await {
                    debug!(%peer, "data connection accepted");
                    let _ = tx.send(stream).await;
                }
            });
            return Some(PassiveChannel {
                port,
                ready,
                accept_task,
            });
        }
        None
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the client's data connection.
    pub async fn take_socket(&mut self) -> Option<TcpStream> {
        timeout(
            Duration::from_secs(FTP_DATA_ACCEPT_TIMEOUT_SECS),
            self.ready.recv(),
        )
        .await
        .ok()
        .flatten()
    }
}

impl Drop for PassiveChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
