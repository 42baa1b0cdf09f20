//! Client connection handling: one DAP session per byte stream.

use crate::adapter::DebugAdapter;
use crate::config::AdapterConfig;
use crate::dap::client::{ClientSender, Outgoing, TerminationSignal};
use crate::dap::protocol::DapRequest;
use crate::dap::tracer::FileTracer;
use crate::dap::transport::{DapReader, DapWriter};
use crate::launcher::ProcessLauncher;
use crate::proxy::{ProcessProxy, ServiceProxy};
use anyhow::Context;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Consecutive unreadable frames after which the client stream is considered broken.
const MAX_MALFORMED_FRAMES: usize = 3;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Build an adapter wired to the process launcher and the optional proxy from `config`.
pub fn build_adapter(
    config: &AdapterConfig,
    client: ClientSender,
) -> Arc<DebugAdapter> {
    let termination = TerminationSignal::new(client.clone());
    let strategy = Arc::new(ProcessLauncher::new(
        config.clone(),
        client.clone(),
        termination.clone(),
    ));
    let proxy = config
        .proxy_command
        .clone()
        .map(|command| Arc::new(ProcessProxy::new(command)) as Arc<dyn ServiceProxy>);
    DebugAdapter::builder()
        .with_proxy(proxy)
        .build(client, termination, strategy)
}

/// Serve a whole session over a byte stream pair.
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    config: &AdapterConfig,
    tracer: Option<FileTracer>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (client, queue) = ClientSender::new();
    let adapter = build_adapter(config, client);
    serve(adapter, queue, reader, writer, tracer).await
}

/// Pump client requests into `adapter` until the client leaves or the session closes.
pub async fn serve<R, W>(
    adapter: Arc<DebugAdapter>,
    queue: mpsc::UnboundedReceiver<Outgoing>,
    reader: R,
    writer: W,
    tracer: Option<FileTracer>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer_task = tokio::spawn(DapWriter::new(writer, tracer.clone()).run(queue));
    let mut reader = DapReader::new(BufReader::new(reader), tracer);
    let mut malformed = 0;

    loop {
        let message = tokio::select! {
            message = reader.read_message() => message,
            _ = adapter.closed() => break,
        };
        match message {
            Ok(Some(value)) => {
                malformed = 0;
                match serde_json::from_value::<DapRequest>(value) {
                    Ok(req) if req.r#type == "request" => {
                        adapter.submit(req);
                    }
                    Ok(other) => {
                        warn!(target: "dap", "ignore non request message `{}`", other.r#type)
                    }
                    Err(e) => warn!(target: "dap", "malformed request: {e}"),
                }
            }
            Ok(None) => {
                info!(target: "dap", "client closed the connection");
                break;
            }
            Err(e) => {
                malformed += 1;
                warn!(target: "dap", "unreadable DAP frame: {e:#}");
                if malformed >= MAX_MALFORMED_FRAMES {
                    break;
                }
            }
        }
    }

    adapter.disconnect().await;
    drop(adapter);

    // background tasks may still hold senders, give the writer a bounded time to flush
    match tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task).await {
        Ok(result) => result.context("DAP writer task")?,
        Err(_) => {
            writer_task.abort();
            Ok(())
        }
    }
}

/// Accept clients one after another, one session per connection.
pub async fn listen(
    addr: SocketAddr,
    oneshot: bool,
    config: AdapterConfig,
    tracer: Option<FileTracer>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(target: "dap", "vmdap listening on {addr}");

    let mut session_num = 0;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        session_num += 1;
        info!(target: "dap", "DAP client connected: {peer}");
        let tracer = tracer.as_ref().map(|t| t.for_session(session_num));
        if let Some(t) = &tracer {
            t.line(&format!("client connected: {peer}"));
        }
        if let Err(err) = stream.set_nodelay(true) {
            warn!(target: "dap", "set TCP_NODELAY: {err}");
        }

        let (read_half, write_half) = stream.into_split();
        let res = run_session(read_half, write_half, &config, tracer.clone()).await;
        match (&res, &tracer) {
            (Err(err), _) => {
                warn!(target: "dap", "session ended with error: {err:#}");
                if let Some(t) = &tracer {
                    t.line(&format!("session error: {err:#}"));
                }
            }
            (Ok(()), Some(t)) => t.line("session finished OK"),
            (Ok(()), None) => {}
        }

        if oneshot {
            break;
        }
    }
    Ok(())
}
