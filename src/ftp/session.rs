//! FTP control-connection state machine and command dispatch.

use anyhow::Result;
use chrono::{DateTime, Datelike, Local, Utc};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::FtpContext;
use super::data::PassiveChannel;
use crate::atomic::AtomicFile;
use crate::config::FTP_STOR_TIMEOUT_SECS;

enum Flow {
    Continue,
    Quit,
}

enum ListStyle {
    Unix,
    Mlsd,
    NamesOnly,
}

pub struct Session {
    ctx: Arc<FtpContext>,
    peer: SocketAddr,
    local_ip: IpAddr,
    cwd: String,
    authenticated: bool,
    anonymous: bool,
    username: Option<String>,
    pending_user: Option<String>,
    transfer_type: char,
    utf8: bool,
    rename_from: Option<String>,
    data: Option<PassiveChannel>,
}

impl Session {
    pub fn new(ctx: Arc<FtpContext>, peer: SocketAddr, local_ip: IpAddr) -> Self {
        Self {
            ctx,
            peer,
            local_ip,
            cwd: String::new(),
            authenticated: false,
            anonymous: false,
            username: None,
            pending_user: None,
            transfer_type: 'I',
            utf8: false,
            rename_from: None,
            data: None,
        }
    }

    /// Drive one control connection to completion.
    pub async fn run(stream: TcpStream, peer: SocketAddr, ctx: Arc<FtpContext>) -> Result<()> {
        let local_ip = stream.local_addr()?.ip();
        let (read_half, mut writer) = stream.into_split();
        let mut session = Session::new(ctx, peer, local_ip);
        let mut lines = BufReader::new(read_half).lines();

        reply(&mut writer, "220 fileshare FTP ready").await?;
        while let Some(line) = lines.next_line().await? {
            debug!(%peer, command = %line, "ftp command");
            match session.dispatch(&mut writer, &line).await? {
                Flow::Continue => {}
                Flow::Quit => break,
            }
        }
        info!(%peer, "ftp session closed");
        Ok(())
    }

    async fn dispatch(&mut self, writer: &mut OwnedWriteHalf, line: &str) -> Result<Flow> {
        let (cmd, arg) = split_command(line);

        match cmd.as_str() {
            "USER" => self.cmd_user(writer, arg).await?,
            "PASS" => self.cmd_pass(writer, arg).await?,
            "QUIT" => {
                reply(writer, "221 Goodbye").await?;
                return Ok(Flow::Quit);
            }
            "FEAT" => {
                reply(
                    writer,
                    "211-Features:\r\n UTF8\r\n SIZE\r\n MDTM\r\n MLSD\r\n EPSV\r\n REST STREAM\r\n211 End",
                )
                .await?;
            }
            "OPTS" => {
                if arg.eq_ignore_ascii_case("UTF8 ON") {
                    self.utf8 = true;
                    reply(writer, "200 UTF8 set to on").await?;
                } else {
                    reply(writer, "501 Option not understood").await?;
                }
            }
            "AUTH" => reply(writer, "504 Security mechanism not implemented").await?,
            "NOOP" => reply(writer, "200 OK").await?,
            "PORT" => reply(writer, "502 Active mode not supported, use PASV").await?,
            _ if !self.authenticated => {
                reply(writer, "530 Please login with USER and PASS").await?;
            }
            "SYST" => reply(writer, "215 UNIX Type: L8").await?,
            "TYPE" => match arg.to_ascii_uppercase().as_str() {
                "I" => {
                    self.transfer_type = 'I';
                    reply(writer, "200 Type set to I").await?;
                }
                "A" => {
                    self.transfer_type = 'A';
                    reply(writer, "200 Type set to A").await?;
                }
                _ => reply(writer, "504 Type not supported").await?,
            },
            "PWD" | "XPWD" => {
                reply(writer, &format!("257 \"/{}\" is current directory", self.cwd)).await?;
            }
            "CWD" | "XCWD" => self.cmd_cwd(writer, arg).await?,
            "CDUP" | "XCUP" => {
                self.cwd = match self.cwd.rfind('/') {
                    Some(pos) => self.cwd[..pos].to_string(),
                    None => String::new(),
                };
                reply(writer, "250 Directory changed").await?;
            }
            "PASV" => self.cmd_pasv(writer).await?,
            "EPSV" => self.cmd_epsv(writer).await?,
            "LIST" => self.cmd_list(writer, arg, ListStyle::Unix).await?,
            "MLSD" => self.cmd_list(writer, arg, ListStyle::Mlsd).await?,
            "NLST" => self.cmd_list(writer, arg, ListStyle::NamesOnly).await?,
            "RETR" => self.cmd_retr(writer, arg).await?,
            "STOR" => self.cmd_stor(writer, arg).await?,
            "SIZE" => self.cmd_size(writer, arg).await?,
            "MDTM" => self.cmd_mdtm(writer, arg).await?,
            "MKD" | "XMKD" => self.cmd_mkd(writer, arg).await?,
            "RMD" | "XRMD" => self.cmd_rmd(writer, arg).await?,
            "DELE" => self.cmd_dele(writer, arg).await?,
            "RNFR" => self.cmd_rnfr(writer, arg).await?,
            "RNTO" => self.cmd_rnto(writer, arg).await?,
            "ABOR" => {
                self.data = None;
                reply(writer, "226 Transfer aborted").await?;
            }
            "REST" => reply(writer, "350 Restart position noted but not honored").await?,
            "STAT" => {
                reply(
                    writer,
                    &format!(
                        "211-Status:\r\n Logged in as {}\r\n TYPE {}\r\n UTF8 {}\r\n211 End of status",
                        self.username.as_deref().unwrap_or("-"),
                        self.transfer_type,
                        if self.utf8 { "on" } else { "off" }
                    ),
                )
                .await?;
            }
            "HELP" => reply(writer, "214 Commands: USER PASS PASV EPSV LIST RETR STOR").await?,
            _ => reply(writer, "502 Command not implemented").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_user(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        let username = arg.trim().to_lowercase();
        if username.is_empty() {
            return reply(writer, "501 Username required").await;
        }
        if username == "anonymous" && self.ctx.anonymous_read {
            self.authenticated = true;
            self.anonymous = true;
            self.username = Some(username);
            self.pending_user = None;
            return reply(writer, "230 Anonymous read-only access granted").await;
        }
        self.pending_user = Some(username);
        reply(writer, "331 Password required").await
    }

    async fn cmd_pass(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        if self.authenticated {
            return reply(writer, "230 Already logged in").await;
        }
        let Some(username) = self.pending_user.clone() else {
            return reply(writer, "503 Send USER first").await;
        };
        match self.ctx.auth.check_password(&username, arg).await {
            Ok(user) => {
                self.authenticated = true;
                self.anonymous = false;
                self.username = Some(user.username.clone());
                info!(peer = %self.peer, username = %user.username, "ftp login");
                reply(writer, "230 Logged in").await
            }
            Err(_) => {
                warn!(peer = %self.peer, username = %username, "ftp login failed");
                reply(writer, "530 Login incorrect").await
            }
        }
    }

    async fn cmd_cwd(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        let rel = self.target_rel(arg);
        if rel.is_empty() {
            self.cwd = String::new();
            return reply(writer, "250 Directory changed").await;
        }
        match self.resolve_read(&rel).await {
            Some((abs, rel)) => {
                let is_dir = fs::metadata(&abs)
                    .await
                    .map(|metadata| metadata.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    self.cwd = rel;
                    reply(writer, "250 Directory changed").await
                } else {
                    reply(writer, "550 Directory not found").await
                }
            }
            None => reply(writer, "550 Directory not found").await,
        }
    }

    async fn cmd_pasv(&mut self, writer: &mut OwnedWriteHalf) -> Result<()> {
        self.data = None;
        match PassiveChannel::open(self.ctx.pasv_port_min, self.ctx.pasv_port_max).await {
            Some(channel) => {
                let port = channel.port();
                self.data = Some(channel);
                let ip = self.advertised_ipv4();
                let [h1, h2, h3, h4] = ip.octets();
                reply(
                    writer,
                    &format!(
                        "227 Entering Passive Mode ({h1},{h2},{h3},{h4},{},{})",
                        port >> 8,
                        port & 0xFF
                    ),
                )
                .await
            }
            None => reply(writer, "425 No passive port available").await,
        }
    }

    async fn cmd_epsv(&mut self, writer: &mut OwnedWriteHalf) -> Result<()> {
        self.data = None;
        match PassiveChannel::open(self.ctx.pasv_port_min, self.ctx.pasv_port_max).await {
            Some(channel) => {
                let port = channel.port();
                self.data = Some(channel);
                reply(
                    writer,
                    &format!("229 Entering Extended Passive Mode (|||{port}|)"),
                )
                .await
            }
            None => reply(writer, "425 No passive port available").await,
        }
    }

    async fn cmd_list(
        &mut self,
        writer: &mut OwnedWriteHalf,
        arg: &str,
        style: ListStyle,
    ) -> Result<()> {
        // Flags like `-la` are ignored; a path argument narrows the listing.
        let arg = if arg.starts_with('-') { "" } else { arg };
        let rel = self.target_rel(arg);
        let target = if rel.is_empty() {
            Some((self.ctx.guard.root().to_path_buf(), String::new()))
        } else {
            self.resolve_read(&rel).await
        };
        let Some((abs, _)) = target else {
            return reply(writer, "550 Not found").await;
        };
        let Some(mut socket) = self.open_data(writer).await? else {
            return Ok(());
        };

        let lines = self.render_listing(&abs, &style).await;
        reply(writer, "150 Opening data connection").await?;
        let payload = lines.join("\r\n");
        let mut body = payload.into_bytes();
        if !body.is_empty() {
            body.extend_from_slice(b"\r\n");
        }
        let send = socket.write_all(&body).await;
        let _ = socket.shutdown().await;
        self.data = None;
        match send {
            Ok(()) => reply(writer, "226 Transfer complete").await,
            Err(_) => reply(writer, "426 Data connection failed").await,
        }
    }

    async fn cmd_retr(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        let rel = self.target_rel(arg);
        let Some((abs, rel)) = self.resolve_read(&rel).await else {
            return reply(writer, "550 Not found").await;
        };
        let Ok(metadata) = fs::metadata(&abs).await else {
            return reply(writer, "550 Not found").await;
        };
        if !metadata.is_file() {
            return reply(writer, "550 Not a file").await;
        }
        let Some(mut socket) = self.open_data(writer).await? else {
            return Ok(());
        };

        reply(writer, "150 Opening data connection").await?;
        let result = async {
            let mut file = fs::File::open(&abs).await?;
            tokio::io::copy(&mut file, &mut socket).await
        }
        .await;
        let _ = socket.shutdown().await;
        self.data = None;
        match result {
            Ok(sent) => {
                self.ctx.stats.record_download(&rel, sent).await;
                info!(peer = %self.peer, path = %rel, bytes = sent, "ftp retr");
                reply(writer, "226 Transfer complete").await
            }
            Err(_) => reply(writer, "426 Data connection failed").await,
        }
    }

    async fn cmd_stor(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        if self.deny_write(writer).await? {
            return Ok(());
        }
        let rel = self.target_rel(arg);
        let Some((abs, rel)) = self.resolve_write(&rel).await else {
            return reply(writer, "550 Invalid path").await;
        };
        let Some(mut socket) = self.open_data(writer).await? else {
            return Ok(());
        };

        reply(writer, "150 Opening data connection").await?;
        let mut buffer = Vec::new();
        let received = timeout(
            Duration::from_secs(FTP_STOR_TIMEOUT_SECS),
            socket.read_to_end(&mut buffer),
        )
        .await;
        let _ = socket.shutdown().await;
        self.data = None;

        match received {
            Ok(Ok(_)) => {
                let write = async {
                    let mut atomic = AtomicFile::new(&abs).await?;
                    atomic.file_mut().write_all(&buffer).await?;
                    atomic.finalize().await
                }
                .await;
                match write {
                    Ok(()) => {
                        self.ctx.stats.record_upload(buffer.len() as u64).await;
                        info!(peer = %self.peer, path = %rel, bytes = buffer.len(), "ftp stor");
                        reply(writer, "226 Transfer complete").await
                    }
                    Err(_) => reply(writer, "550 Write failed").await,
                }
            }
            _ => reply(writer, "426 Data connection timed out").await,
        }
    }

    async fn cmd_size(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        let rel = self.target_rel(arg);
        match self.resolve_read(&rel).await {
            Some((abs, _)) => match fs::metadata(&abs).await {
                Ok(metadata) if metadata.is_file() => {
                    reply(writer, &format!("213 {}", metadata.len())).await
                }
                _ => reply(writer, "550 Not a file").await,
            },
            None => reply(writer, "550 Not found").await,
        }
    }

    async fn cmd_mdtm(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        let rel = self.target_rel(arg);
        match self.resolve_read(&rel).await {
            Some((abs, _)) => match fs::metadata(&abs).await.and_then(|m| m.modified()) {
                Ok(modified) => {
                    let stamp = DateTime::<Utc>::from(modified).format("%Y%m%d%H%M%S");
                    reply(writer, &format!("213 {stamp}")).await
                }
                Err(_) => reply(writer, "550 Not found").await,
            },
            None => reply(writer, "550 Not found").await,
        }
    }

    async fn cmd_mkd(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        if self.deny_write(writer).await? {
            return Ok(());
        }
        let rel = self.target_rel(arg);
        match self.resolve_write(&rel).await {
            Some((abs, rel)) => match fs::create_dir_all(&abs).await {
                Ok(()) => reply(writer, &format!("257 \"/{rel}\" created")).await,
                Err(_) => reply(writer, "550 Create failed").await,
            },
            None => reply(writer, "550 Invalid path").await,
        }
    }

    async fn cmd_rmd(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        if self.deny_write(writer).await? {
            return Ok(());
        }
        let rel = self.target_rel(arg);
        match self.resolve_read(&rel).await {
            Some((abs, _)) => match fs::remove_dir(&abs).await {
                Ok(()) => reply(writer, "250 Directory removed").await,
                Err(_) => reply(writer, "550 Remove failed").await,
            },
            None => reply(writer, "550 Not found").await,
        }
    }

    async fn cmd_dele(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        if self.deny_write(writer).await? {
            return Ok(());
        }
        let rel = self.target_rel(arg);
        match self.resolve_read(&rel).await {
            Some((abs, _)) => match fs::remove_file(&abs).await {
                Ok(()) => reply(writer, "250 File deleted").await,
                Err(_) => reply(writer, "550 Delete failed").await,
            },
            None => reply(writer, "550 Not found").await,
        }
    }

    async fn cmd_rnfr(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        if self.deny_write(writer).await? {
            return Ok(());
        }
        let rel = self.target_rel(arg);
        match self.resolve_read(&rel).await {
            Some((_, rel)) => {
                self.rename_from = Some(rel);
                reply(writer, "350 Ready for RNTO").await
            }
            None => reply(writer, "550 Not found").await,
        }
    }

    async fn cmd_rnto(&mut self, writer: &mut OwnedWriteHalf, arg: &str) -> Result<()> {
        if self.deny_write(writer).await? {
            return Ok(());
        }
        let Some(from_rel) = self.rename_from.take() else {
            return reply(writer, "503 Send RNFR first").await;
        };
        let Some((from_abs, _)) = self.resolve_read(&from_rel).await else {
            return reply(writer, "550 Source vanished").await;
        };
        let rel = self.target_rel(arg);
        match self.resolve_write(&rel).await {
            Some((to_abs, _)) => match fs::rename(&from_abs, &to_abs).await {
                Ok(()) => reply(writer, "250 Rename complete").await,
                Err(_) => reply(writer, "550 Rename failed").await,
            },
            None => reply(writer, "550 Invalid path").await,
        }
    }

    /// Anonymous sessions are read-only. Replies 550 and reports `true`
    /// when the command must be refused.
    async fn deny_write(&mut self, writer: &mut OwnedWriteHalf) -> Result<bool> {
        if self.anonymous {
            reply(writer, "550 Permission denied").await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn open_data(&mut self, writer: &mut OwnedWriteHalf) -> Result<Option<TcpStream>> {
        let Some(channel) = self.data.as_mut() else {
            reply(writer, "425 Use PASV first").await?;
            return Ok(None);
        };
        match channel.take_socket().await {
            Some(socket) => Ok(Some(socket)),
            None => {
                self.data = None;
                reply(writer, "425 No data connection").await?;
                Ok(None)
            }
        }
    }

    /// Root-relative resolution: a leading `/` anchors at the share root,
    /// anything else is relative to the working directory.
    fn target_rel(&self, arg: &str) -> String {
        let arg = arg.trim();
        if let Some(rooted) = arg.strip_prefix('/') {
            return rooted.trim_start_matches('/').to_string();
        }
        if arg.is_empty() {
            return self.cwd.clone();
        }
        if self.cwd.is_empty() {
            arg.to_string()
        } else {
            format!("{}/{}", self.cwd, arg)
        }
    }

    async fn resolve_read(&self, rel: &str) -> Option<(PathBuf, String)> {
        let abs = self.ctx.guard.resolve_read(rel).await.ok()?;
        let rel = self.ctx.guard.relative_of(&abs)?;
        if self.ctx.blocklist.is_blocked(&abs, &rel).await {
            return None;
        }
        Some((abs, rel))
    }

    async fn resolve_write(&self, rel: &str) -> Option<(PathBuf, String)> {
        let abs = self.ctx.guard.resolve_write(rel).await.ok()?;
        let rel = self.ctx.guard.relative_of(&abs)?;
        if self.ctx.blocklist.is_blocked(&abs, &rel).await {
            return None;
        }
        Some((abs, rel))
    }

    fn advertised_ipv4(&self) -> Ipv4Addr {
        if self.peer.ip().is_loopback() {
            return Ipv4Addr::LOCALHOST;
        }
        match self.local_ip {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
        }
    }

    async fn render_listing(&self, dir: &Path, style: &ListStyle) -> Vec<String> {
        let mut lines = Vec::new();
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return lines;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == crate::config::STATE_DIR {
                continue;
            }
            let path = entry.path();
            if let Some(rel) = self.ctx.guard.relative_of(&path)
                && self.ctx.blocklist.is_blocked(&path, &rel).await
            {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            lines.push(match style {
                ListStyle::Unix => format_unix_line(&name, &metadata),
                ListStyle::Mlsd => format_mlsd_line(&name, &metadata),
                ListStyle::NamesOnly => name,
            });
        }
        lines.sort();
        lines
    }
}

async fn reply(writer: &mut OwnedWriteHalf, text: &str) -> Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

fn split_command(line: &str) -> (String, &str) {
    let trimmed = line.trim();
    match trimmed.split_once(' ') {
        Some((cmd, arg)) => (cmd.to_ascii_uppercase(), arg.trim()),
        None => (trimmed.to_ascii_uppercase(), ""),
    }
}

/// `ls -l` style line for LIST responses.
fn format_unix_line(name: &str, metadata: &std::fs::Metadata) -> String {
    let mode = if metadata.is_dir() {
        "drwxr-xr-x"
    } else {
        "-rw-r--r--"
    };
    let size = if metadata.is_dir() { 0 } else { metadata.len() };
    let stamp = metadata
        .modified()
        .ok()
        .map(|ts| {
            let dt: DateTime<Local> = ts.into();
            if dt.year() == Local::now().year() {
                dt.format("%b %e %H:%M").to_string()
            } else {
                dt.format("%b %e  %Y").to_string()
            }
        })
        .unwrap_or_else(|| "Jan  1  1970".to_string());
    format!("{mode} 1 share share {size:>12} {stamp} {name}")
}

fn format_mlsd_line(name: &str, metadata: &std::fs::Metadata) -> String {
    let stamp = metadata
        .modified()
        .ok()
        .map(|ts| DateTime::<Utc>::from(ts).format("%Y%m%d%H%M%S").to_string())
        .unwrap_or_default();
    if metadata.is_dir() {
        format!("type=dir;modify={stamp}; {name}")
    } else {
        format!("type=file;size={};modify={stamp}; {name}", metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;
    use crate::blocklist::BlockList;
    use crate::ftp::FtpContext;
    use crate::pathguard::PathGuard;
    use crate::stats::Stats;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn make_session(ctx: Arc<FtpContext>) -> Session {
        Session::new(
            ctx,
            "127.0.0.1:50001".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
        )
    }

    async fn make_ctx(anonymous_read: bool) -> (tempfile::TempDir, Arc<FtpContext>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("share");
        std::fs::create_dir_all(&root).expect("mkdir");
        let ctx = Arc::new(FtpContext {
            guard: Arc::new(PathGuard::new(&root).expect("guard")),
            auth: Arc::new(Auth::load(temp.path()).await),
            blocklist: Arc::new(BlockList::load(temp.path()).await),
            stats: Arc::new(Stats::new()),
            anonymous_read,
            pasv_port_min: 52000,
            pasv_port_max: 52100,
        });
        (temp, ctx)
    }

    #[test]
    fn command_splitting_uppercases_verb() {
        assert_eq!(split_command("user Alice"), ("USER".to_string(), "Alice"));
        assert_eq!(split_command("  quit  "), ("QUIT".to_string(), ""));
        assert_eq!(
            split_command("stor some file.txt"),
            ("STOR".to_string(), "some file.txt")
        );
    }

    #[tokio::test]
    async fn target_rel_resolution() {
        let (_temp, ctx) = make_ctx(true).await;
        let mut session = make_session(ctx);
        assert_eq!(session.target_rel("a.txt"), "a.txt");
        assert_eq!(session.target_rel("/top/a.txt"), "top/a.txt");
        session.cwd = "docs".to_string();
        assert_eq!(session.target_rel("a.txt"), "docs/a.txt");
        assert_eq!(session.target_rel("/a.txt"), "a.txt");
        assert_eq!(session.target_rel(""), "docs");
    }

    #[test]
    fn unix_listing_line_shape() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("f.bin"), vec![0u8; 1234]).expect("seed");
        let metadata = std::fs::metadata(temp.path().join("f.bin")).expect("stat");
        let line = format_unix_line("f.bin", &metadata);
        assert!(line.starts_with("-rw-r--r-- 1 share share"));
        assert!(line.contains("1234"));
        assert!(line.ends_with("f.bin"));

        let dir_meta = std::fs::metadata(temp.path()).expect("stat");
        assert!(format_unix_line("d", &dir_meta).starts_with("drwxr-xr-x"));
    }

    #[test]
    fn mlsd_line_shape() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("f.bin"), vec![0u8; 10]).expect("seed");
        let metadata = std::fs::metadata(temp.path().join("f.bin")).expect("stat");
        let line = format_mlsd_line("f.bin", &metadata);
        assert!(line.starts_with("type=file;size=10;modify="));
        assert!(line.ends_with("; f.bin"));
    }

    /// Scenario: anonymous login, passive listing over one control
    /// connection, with `.fileshare` hidden from the listing.
    #[tokio::test]
    async fn anonymous_passive_list_flow() {
        let (_temp, ctx) = make_ctx(true).await;
        std::fs::write(ctx.guard.root().join("visible.txt"), b"data").expect("seed");
        std::fs::create_dir_all(ctx.guard.root().join(".fileshare")).expect("state dir");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server_ctx = Arc::clone(&ctx);
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.expect("accept");
            let _ = Session::run(stream, peer, server_ctx).await;
        });

        let control = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = control.into_split();
        let mut replies = BufReader::new(read_half).lines();

        let greeting = replies.next_line().await.expect("io").expect("line");
        assert!(greeting.starts_with("220"));

        write_half.write_all(b"USER anonymous\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("230"));

        write_half.write_all(b"TYPE I\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("200"));

        write_half.write_all(b"PASV\r\n").await.expect("send");
        let pasv = replies.next_line().await.expect("io").expect("line");
        assert!(pasv.starts_with("227 Entering Passive Mode ("));
        let inside = pasv
            .split('(')
            .nth(1)
            .and_then(|rest| rest.split(')').next())
            .expect("addr tuple");
        let parts: Vec<u16> = inside.split(',').map(|p| p.parse().unwrap()).collect();
        let port = parts[4] * 256 + parts[5];

        let mut data = TcpStream::connect(("127.0.0.1", port)).await.expect("data");
        write_half.write_all(b"LIST\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("150"));

        let mut listing = String::new();
        data.read_to_string(&mut listing).await.expect("read data");
        assert!(listing.contains("visible.txt"));
        assert!(!listing.contains(".fileshare"));

        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("226"));

        write_half.write_all(b"QUIT\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("221"));
        server.await.expect("server task");
    }

    /// Anonymous sessions must not mutate the share.
    #[tokio::test]
    async fn anonymous_writes_denied() {
        let (_temp, ctx) = make_ctx(true).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server_ctx = Arc::clone(&ctx);
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.expect("accept");
            let _ = Session::run(stream, peer, server_ctx).await;
        });

        let control = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = control.into_split();
        let mut replies = BufReader::new(read_half).lines();
        replies.next_line().await.expect("io"); // greeting

        write_half.write_all(b"USER anonymous\r\n").await.expect("send");
        replies.next_line().await.expect("io"); // 230

        for command in ["MKD newdir", "DELE x.txt", "RNFR x.txt", "STOR x.txt"] {
            write_half
                .write_all(format!("{command}\r\n").as_bytes())
                .await
                .expect("send");
            let line = replies.next_line().await.expect("io").expect("line");
            assert!(line.starts_with("550"), "{command} should be denied: {line}");
        }

        write_half.write_all(b"QUIT\r\n").await.expect("send");
        replies.next_line().await.expect("io");
        server.await.expect("server task");
    }

    /// Password verification goes through the Auth store.
    #[tokio::test]
    async fn password_login_requires_approved_user() {
        let (_temp, ctx) = make_ctx(false).await;
        ctx.auth
            .register("mallory", "pass1234", "ip")
            .await
            .expect("register");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server_ctx = Arc::clone(&ctx);
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.expect("accept");
            let _ = Session::run(stream, peer, server_ctx).await;
        });

        let control = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = control.into_split();
        let mut replies = BufReader::new(read_half).lines();
        replies.next_line().await.expect("io"); // greeting

        // Pending user is refused even with the right password.
        write_half.write_all(b"USER mallory\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("331"));
        write_half.write_all(b"PASS pass1234\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("530"));

        // Approval flips the outcome.
        ctx.auth.approve("mallory").await.expect("approve");
        write_half.write_all(b"USER mallory\r\n").await.expect("send");
        replies.next_line().await.expect("io");
        write_half.write_all(b"PASS pass1234\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("230"));

        write_half.write_all(b"QUIT\r\n").await.expect("send");
        replies.next_line().await.expect("io");
        server.await.expect("server task");
    }

    /// RNTO without a pending RNFR is a sequence error.
    #[tokio::test]
    async fn rnto_without_rnfr_is_rejected() {
        let (_temp, ctx) = make_ctx(false).await;
        ctx.auth.register("oscar", "pass1234", "ip").await.expect("register");
        ctx.auth.approve("oscar").await.expect("approve");
        std::fs::write(ctx.guard.root().join("old.txt"), b"x").expect("seed");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server_ctx = Arc::clone(&ctx);
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.expect("accept");
            let _ = Session::run(stream, peer, server_ctx).await;
        });

        let control = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = control.into_split();
        let mut replies = BufReader::new(read_half).lines();
        replies.next_line().await.expect("io"); // greeting

        write_half.write_all(b"USER oscar\r\n").await.expect("send");
        replies.next_line().await.expect("io");
        write_half.write_all(b"PASS pass1234\r\n").await.expect("send");
        replies.next_line().await.expect("io");

        write_half.write_all(b"RNTO new.txt\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("503"));

        write_half.write_all(b"RNFR old.txt\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("350"));
        write_half.write_all(b"RNTO new.txt\r\n").await.expect("send");
        let line = replies.next_line().await.expect("io").expect("line");
        assert!(line.starts_with("250"));
        assert!(ctx.guard.root().join("new.txt").exists());

        write_half.write_all(b"QUIT\r\n").await.expect("send");
        replies.next_line().await.expect("io");
        server.await.expect("server task");
    }
}
