//! Local daemon query channel.
//!
//! A Unix domain socket speaking a line-oriented textual protocol. A
//! request is a single command line. The response is `ok` or `error`, a
//! human-readable message line, zero or more `key=value` lines, and a
//! terminating `END` line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Response to one IPC command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcResponse {
    pub success: bool,
    pub message: String,
    pub data: Vec<(String, String)>,
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.push((key.into(), value.into()));
        self
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(if self.success { "ok" } else { "error" });
        out.push('\n');
        out.push_str(&self.message);
        out.push('\n');
        for (key, value) in &self.data {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out.push_str("END\n");
        out
    }

    fn parse(lines: &[String]) -> Option<Self> {
        let mut iter = lines.iter();
        let success = match iter.next()?.as_str() {
            "ok" => true,
            "error" => false,
            _ => return None,
        };
        let message = iter.next()?.clone();
        let mut data = Vec::new();
        for line in iter {
            if line == "END" {
                return Some(Self {
                    success,
                    message,
                    data,
                });
            }
            if let Some(eq) = line.find('=') {
                data.push((line[..eq].to_string(), line[eq + 1..].to_string()));
            }
        }
        None
    }
}

/// Command handler installed by the daemon.
pub type IpcHandler = Arc<dyn Fn(&str) -> IpcResponse + Send + Sync>;

/// IPC server bound to a Unix socket path.
pub struct IpcServer {
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the socket (replacing any stale file) and serve commands until
    /// the process exits.
    pub fn start(socket_path: &Path, handler: IpcHandler) -> std::io::Result<Self> {
        // A previous daemon may have left the socket file behind
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "ipc server listening");

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::serve_client(stream, handler).await {
                                debug!(error = %e, "ipc client error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "ipc accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
        })
    }

    async fn serve_client(stream: UnixStream, handler: IpcHandler) -> std::io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim();
        debug!(command, "ipc command");

        let response = handler(command);
        write_half.write_all(response.render().as_bytes()).await?;
        write_half.shutdown().await
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// One-shot IPC client used by the CLI.
pub struct IpcClient;

impl IpcClient {
    pub async fn request(socket_path: &Path, command: &str) -> std::io::Result<IpcResponse> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        write_half
            .write_all(format!("{}\n", command).as_bytes())
            .await?;
        write_half.shutdown().await?;

        let mut reader = BufReader::new(read_half);
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let line = line.trim_end_matches('\n').to_string();
            let done = line == "END";
            lines.push(line);
            if done {
                break;
            }
        }

        IpcResponse::parse(&lines).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed ipc response")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_format() {
        let response = IpcResponse::ok("2 peers connected")
            .with("peer.0", "1001")
            .with("peer.1", "1002");
        assert_eq!(
            response.render(),
            "ok\n2 peers connected\npeer.0=1001\npeer.1=1002\nEND\n"
        );

        let response = IpcResponse::error("unknown command");
        assert_eq!(response.render(), "error\nunknown command\nEND\n");
    }

    #[test]
    fn test_parse_roundtrip() {
        let response = IpcResponse::ok("status").with("peer_id", "1234");
        let lines: Vec<String> = response.render().lines().map(str::to_string).collect();
        assert_eq!(IpcResponse::parse(&lines).unwrap(), response);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let lines = vec!["wat".to_string(), "msg".to_string(), "END".to_string()];
        assert!(IpcResponse::parse(&lines).is_none());

        // Missing END terminator
        let lines = vec!["ok".to_string(), "msg".to_string()];
        assert!(IpcResponse::parse(&lines).is_none());
    }

    #[tokio::test]
    async fn test_server_client_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let handler: IpcHandler = Arc::new(|command| match command {
            "status" => IpcResponse::ok("running").with("peer_id", "42"),
            other => IpcResponse::error(format!("unknown command: {}", other)),
        });
        let _server = IpcServer::start(&socket_path, handler).unwrap();

        let response = IpcClient::request(&socket_path, "status").await.unwrap();
        assert!(response.success);
        assert_eq!(response.message, "running");
        assert_eq!(response.data, vec![("peer_id".to_string(), "42".to_string())]);

        let response = IpcClient::request(&socket_path, "bogus").await.unwrap();
        assert!(!response.success);
        assert!(response.message.contains("unknown command"));
    }

    #[tokio::test]
    async fn test_server_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("stale.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let handler: IpcHandler = Arc::new(|_| IpcResponse::ok("up"));
        let _server = IpcServer::start(&socket_path, handler).unwrap();

        let response = IpcClient::request(&socket_path, "ping").await.unwrap();
        assert!(response.success);
    }
}
