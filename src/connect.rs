//! Connection establisher: turns a runtime service endpoint into a connected,
//! subscribed [`VmConnection`].

use crate::dap::client::ClientSender;
use crate::dap::protocol::event;
use crate::error::{Error, Result};
use crate::proxy::{ProxyError, ServiceProxy};
use crate::vm::service::{RpcError, StreamId, VmConnection, VmConnector};
use serde_json::json;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Put the multiplexing proxy in front of the runtime.
    pub use_proxy: bool,
    /// Subscribe to `Stdout`/`Stderr`. Off when the launcher drains the
    /// debuggee output itself.
    pub subscribe_output_streams: bool,
}

impl ConnectOptions {
    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams = vec![
            StreamId::Isolate,
            StreamId::Debug,
            StreamId::Logging,
            StreamId::Extension,
            StreamId::Service,
        ];
        if self.subscribe_output_streams {
            streams.extend([StreamId::Stdout, StreamId::Stderr]);
        }
        streams
    }
}

/// Convert any http(s)/ws(s) service uri into the websocket endpoint uri.
///
/// The `ws` path segment is appended exactly once.
pub fn normalize_ws_uri(uri: &str) -> Result<Url> {
    let invalid = || Error::InvalidUri(uri.to_string());
    let mut url = Url::parse(uri.trim()).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;

    let mut segments: Vec<String> = url
        .path_segments()
        .map(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    if segments.last().map(String::as_str) == Some("ws") {
        segments.pop();
    }
    segments.push("ws".to_string());
    url.set_path(&format!("/{}", segments.join("/")));
    Ok(url)
}

pub struct ConnectionEstablisher {
    connector: Arc<dyn VmConnector>,
    proxy: Option<Arc<dyn ServiceProxy>>,
    client: ClientSender,
}

impl ConnectionEstablisher {
    pub fn new(
        connector: Arc<dyn VmConnector>,
        proxy: Option<Arc<dyn ServiceProxy>>,
        client: ClientSender,
    ) -> Self {
        Self {
            connector,
            proxy,
            client,
        }
    }

    /// Connect to the runtime at `uri` and subscribe to the session streams.
    ///
    /// Any failure here is fatal for the session.
    pub async fn establish(&self, uri: &str, options: ConnectOptions) -> Result<(Url, VmConnection)> {
        let mut uri = normalize_ws_uri(uri)?;

        if let (true, Some(proxy)) = (options.use_proxy, &self.proxy) {
            match proxy.start(&uri).await {
                Ok(proxied) => uri = normalize_ws_uri(proxied.as_str())?,
                Err(ProxyError::AlreadyProxied(existing)) => {
                    log::info!(target: "dap", "vm service already proxied by {existing}, connecting directly");
                }
                Err(e) => return Err(e.into()),
            }
        }

        log::info!(target: "dap", "connecting to vm service at {uri}");
        let connection = self
            .connector
            .connect(&uri)
            .await
            .map_err(|e| Error::Connect(uri.to_string(), e))?;

        for stream in options.streams() {
            match connection.service.stream_listen(stream.as_ref()).await {
                Ok(()) => {}
                Err(e) if e.code() == Some(RpcError::STREAM_ALREADY_SUBSCRIBED) => {}
                Err(e) => return Err(Error::Connect(uri.to_string(), e)),
            }
        }

        self.client
            .send_event(event::DEBUGGER_URIS, json!({ "vmServiceUri": uri.as_str() }));
        Ok((uri, connection))
    }

    pub async fn shutdown_proxy(&self) {
        if let Some(proxy) = &self.proxy {
            proxy.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ws_uri() {
        let cases = [
            ("http://127.0.0.1:8181/", "ws://127.0.0.1:8181/ws"),
            ("https://host:443/token=/", "wss://host/token=/ws"),
            ("ws://127.0.0.1:8181/abc/ws", "ws://127.0.0.1:8181/abc/ws"),
            ("wss://127.0.0.1:8181/abc/ws/", "wss://127.0.0.1:8181/abc/ws"),
            ("http://127.0.0.1:8181/abc", "ws://127.0.0.1:8181/abc/ws"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_ws_uri(input).unwrap().as_str(), expected, "{input}");
        }
    }

    #[test]
    fn test_normalize_rejects_other_schemes() {
        assert!(matches!(
            normalize_ws_uri("file:///tmp/x"),
            Err(Error::InvalidUri(_))
        ));
        assert!(normalize_ws_uri("not a uri").is_err());
    }

    #[test]
    fn test_output_streams_are_optional() {
        let streams = ConnectOptions::default().streams();
        assert!(!streams.contains(&StreamId::Stdout));
        let streams = ConnectOptions {
            subscribe_output_streams: true,
            ..Default::default()
        }
        .streams();
        assert!(streams.contains(&StreamId::Stdout) && streams.contains(&StreamId::Stderr));
    }
}
