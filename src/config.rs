//! CLI arguments and server configuration defaults.

use clap::Parser;

pub const STATE_DIR: &str = ".fileshare";
pub const USERS_FILE: &str = "users.json";
pub const BLOCK_FILE: &str = "block.json";
pub const SETTINGS_FILE: &str = "settings.json";
pub const HLS_CACHE_DIR: &str = "cache/hls";

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_FTP_PORT: u16 = 2121;
pub const DEFAULT_PASV_PORT_MIN: u16 = 50000;
pub const DEFAULT_PASV_PORT_MAX: u16 = 50100;

pub const SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const AUTH_SAVE_DEBOUNCE_MS: u64 = 200;
pub const DISK_CACHE_TTL_SECS: u64 = 30;
pub const BANDWIDTH_WINDOW_SECS: u64 = 60;
pub const ACTIVE_CLIENT_TTL_SECS: u64 = 60;

pub const HLS_SEGMENT_SECONDS: f64 = 10.0;
pub const HLS_NO_CACHE_THRESHOLD: u64 = 1024 * 1024 * 1024;
pub const HLS_NO_CACHE_GRACE_SECS: u64 = 8;
pub const HLS_JANITOR_INTERVAL_SECS: u64 = 60;
pub const HLS_ENTRY_TTL_SECS: u64 = 30 * 60;
pub const MAX_TRANSCODERS: usize = 2;

pub const FTP_DATA_ACCEPT_TIMEOUT_SECS: u64 = 10;
pub const FTP_STOR_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "fileshare", version, about = "LAN file sharing server")]
pub struct Args {
    #[arg(
        long,
        env = "FILESHARE_PATH",
        default_value = ".",
        help = "Directory shared with clients"
    )]
    pub path: String,
    #[arg(
        long,
        env = "FILESHARE_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
}
