//! FTP server: control listener and per-connection session spawn.

mod data;
mod session;

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::auth::Auth;
use crate::blocklist::BlockList;
use crate::config::{DEFAULT_FTP_PORT, DEFAULT_PASV_PORT_MAX, DEFAULT_PASV_PORT_MIN};
use crate::pathguard::PathGuard;
use crate::stats::Stats;

/// Shared dependencies handed to every session.
pub struct FtpContext {
    pub guard: Arc<PathGuard>,
    pub auth: Arc<Auth>,
    pub blocklist: Arc<BlockList>,
    pub stats: Arc<Stats>,
    pub anonymous_read: bool,
    pub pasv_port_min: u16,
    pub pasv_port_max: u16,
}

/// The `ftp` settings module with defaults applied.
#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub enabled: bool,
    pub port: u16,
    pub pasv_port_min: u16,
    pub pasv_port_max: u16,
    pub anonymous_read: bool,
}

impl FtpConfig {
    pub fn from_settings(module: &Value) -> Self {
        let port = module
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(DEFAULT_FTP_PORT);
        let pasv_port_min = module
            .get("pasvPortMin")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(DEFAULT_PASV_PORT_MIN);
        let pasv_port_max = module
            .get("pasvPortMax")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(DEFAULT_PASV_PORT_MAX);
        Self {
            enabled: module
                .get("enabled")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            port,
            pasv_port_min,
            pasv_port_max: pasv_port_max.max(pasv_port_min),
            anonymous_read: module
                .get("anonymousRead")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// Accepts control connections and spawns a session task per client.
pub struct FtpServer {
    listener: TcpListener,
    ctx: Arc<FtpContext>,
}

impl FtpServer {
    pub async fn bind(addr: SocketAddr, ctx: Arc<FtpContext>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "ftp listening");
        Ok(Self { listener, ctx })
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "ftp connection accepted");
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(err) = session::Session::run(stream, peer, ctx).await {
                            error!(%peer, error = %err, "ftp session error");
                        }
                    });
                }
                Err(err) => {
                    error!(error = %err, "ftp accept failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FtpConfig;
    use serde_json::json;

    #[test]
    fn config_defaults() {
        let config = FtpConfig::from_settings(&json!({}));
        assert!(config.enabled);
        assert_eq!(config.port, 2121);
        assert_eq!(config.pasv_port_min, 50000);
        assert_eq!(config.pasv_port_max, 50100);
        assert!(!config.anonymous_read);
    }

    #[test]
    fn config_overrides_and_range_clamp() {
        let config = FtpConfig::from_settings(&json!({
            "enabled": false,
            "port": 2222,
            "pasvPortMin": 60000,
            "pasvPortMax": 59000,
            "anonymousRead": true,
        }));
        assert!(!config.enabled);
        assert_eq!(config.port, 2222);
        assert!(config.pasv_port_max >= config.pasv_port_min);
        assert!(config.anonymous_read);
    }
}
