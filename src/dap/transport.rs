//! DAP transport abstraction layer.
//! Content-Length framing over any async byte stream (stdio or TCP).

use crate::dap::client::Outgoing;
use crate::dap::tracer::FileTracer;
use anyhow::anyhow;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Reading half of a DAP connection.
pub struct DapReader<R> {
    reader: R,
    tracer: Option<FileTracer>,
}

impl<R: AsyncBufRead + Unpin> DapReader<R> {
    pub fn new(reader: R, tracer: Option<FileTracer>) -> Self {
        Self { reader, tracer }
    }

    /// Read a single DAP message. Return `None` on a clean end of stream.
    pub async fn read_message(&mut self) -> anyhow::Result<Option<Value>> {
        let mut content_length: Option<usize> = None;
        let mut seen_header = false;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line).await?;
            if read_n == 0 {
                if seen_header {
                    return Err(anyhow!("DAP connection closed in the middle of a message"));
                }
                return Ok(None);
            }
            seen_header = true;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix("Content-Length:") {
                content_length = Some(v.trim().parse()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        let msg: Value = serde_json::from_slice(&buf)?;
        if let Some(tracer) = &self.tracer {
            tracer.line(&format!("<- {msg}"));
        }
        Ok(Some(msg))
    }
}

/// Writing half of a DAP connection.
pub struct DapWriter<W> {
    writer: W,
    tracer: Option<FileTracer>,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W, tracer: Option<FileTracer>) -> Self {
        Self { writer, tracer }
    }

    pub async fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message)?;
        if let Some(tracer) = &self.tracer {
            tracer.line(&format!("-> {message}"));
        }
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Drain queued messages into the stream until every sender is dropped.
    ///
    /// This is the only place where outgoing sequence numbers are assigned.
    pub async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Outgoing>) -> anyhow::Result<()> {
        let mut seq = 1;
        while let Some(msg) = queue.recv().await {
            let message = msg.into_message(seq)?;
            seq += 1;
            self.write_message(&message).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::client::ClientSender;
    use serde_json::json;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_framed_messages() {
        let first = r#"{"seq":1,"type":"request","command":"initialize"}"#;
        let second = r#"{"seq":2,"type":"request","command":"threads"}"#;
        let data = format!(
            "Content-Length: {}\r\n\r\n{first}Content-Length: {}\r\n\r\n{second}",
            first.len(),
            second.len()
        );

        let mut reader = DapReader::new(BufReader::new(data.as_bytes()), None);
        let msg = reader.read_message().await.unwrap().unwrap();
        assert_eq!(msg["command"], json!("initialize"));
        let msg = reader.read_message().await.unwrap().unwrap();
        assert_eq!(msg["seq"], json!(2));
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_content_length() {
        let data = "X-Other: 1\r\n\r\n{}";
        let mut reader = DapReader::new(BufReader::new(data.as_bytes()), None);
        assert!(reader.read_message().await.is_err());
    }

    #[tokio::test]
    async fn test_writer_assigns_sequence() {
        let (client, rx) = ClientSender::new();
        client.send_event("initialized", Value::Null);
        client.output("stdout", "hello\n");
        drop(client);

        let mut out = Vec::new();
        DapWriter::new(&mut out, None).run(rx).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let bodies: Vec<Value> = text
            .split("Content-Length: ")
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| {
                let (_, body) = chunk.split_once("\r\n\r\n").unwrap();
                serde_json::from_str(body).unwrap()
            })
            .collect();

        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["seq"], json!(1));
        assert_eq!(bodies[0]["event"], json!("initialized"));
        assert_eq!(bodies[1]["seq"], json!(2));
        assert_eq!(bodies[1]["body"]["output"], json!("hello\n"));
    }
}
