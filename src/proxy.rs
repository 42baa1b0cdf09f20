//! Multiplexing proxy placed between the adapter and the runtime service, so
//! several debug clients can share one runtime connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The runtime already has a proxy in front of it.
    #[error("vm service is already proxied by {0}")]
    AlreadyProxied(String),
    #[error("start proxy: {0}")]
    Start(#[from] std::io::Error),
    #[error("proxy failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait ServiceProxy: Send + Sync {
    /// Start proxying `uri`, return the uri clients should connect to.
    async fn start(&self, uri: &Url) -> Result<Url, ProxyError>;

    /// Stop the proxy. Must tolerate repeated calls.
    async fn shutdown(&self);
}

/// Status line printed by the proxy process once it is ready or has failed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
enum ProxyStatus {
    #[serde(rename = "started")]
    Started { uri: String },
    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(default)]
        existing_proxy_uri: Option<String>,
    },
}

/// Proxy hosted by an external process (`<command> --vm-service-uri=<uri>`).
pub struct ProcessProxy {
    command: PathBuf,
    child: Mutex<Option<Child>>,
}

impl ProcessProxy {
    pub fn new(command: PathBuf) -> Self {
        Self {
            command,
            child: Mutex::new(None),
        }
    }
}

fn parse_status(line: &str) -> Result<Url, ProxyError> {
    let status: ProxyStatus = serde_json::from_str(line.trim())
        .map_err(|e| ProxyError::Failed(format!("unexpected proxy output `{}`: {e}", line.trim())))?;
    match status {
        ProxyStatus::Started { uri } => {
            Url::parse(&uri).map_err(|e| ProxyError::Failed(format!("proxy uri `{uri}`: {e}")))
        }
        ProxyStatus::Error {
            existing_proxy_uri: Some(existing),
            ..
        } => Err(ProxyError::AlreadyProxied(existing)),
        ProxyStatus::Error { error, .. } => Err(ProxyError::Failed(error)),
    }
}

#[async_trait]
impl ServiceProxy for ProcessProxy {
    async fn start(&self, uri: &Url) -> Result<Url, ProxyError> {
        let mut child = Command::new(&self.command)
            .arg(format!("--vm-service-uri={uri}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Failed("proxy stdout is not captured".to_string()))?;
        let mut line = String::new();
        let read = BufReader::new(stdout).read_line(&mut line).await?;
        if read == 0 {
            let status = child.wait().await?;
            return Err(ProxyError::Failed(format!("proxy exited early ({status})")));
        }

        match parse_status(&line) {
            Ok(proxied) => {
                log::info!(target: "dap", "vm service proxied at {proxied}");
                *self.child.lock() = Some(child);
                Ok(proxied)
            }
            Err(e) => {
                let _ = child.start_kill();
                Err(e)
            }
        }
    }

    async fn shutdown(&self) {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            crate::muted_error!(child.kill().await, "stop proxy:");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let uri = parse_status(r#"{"state":"started","uri":"ws://127.0.0.1:4000/ws"}"#).unwrap();
        assert_eq!(uri.as_str(), "ws://127.0.0.1:4000/ws");

        let err = parse_status(
            r#"{"state":"error","error":"already proxied","existingProxyUri":"ws://127.0.0.1:5000/ws"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::AlreadyProxied(uri) if uri == "ws://127.0.0.1:5000/ws"));

        let err = parse_status(r#"{"state":"error","error":"bind failed"}"#).unwrap_err();
        assert!(matches!(err, ProxyError::Failed(msg) if msg == "bind failed"));

        assert!(parse_status("garbage").is_err());
    }
}
