//! Line-delimited JSON loop over stdio
//!
//! One JSON object per line in, one per line out. A single request is in
//! flight at a time per connection; malformed lines get an error reply
//! instead of killing the loop.

use eyre::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use super::{ToolDispatcher, ToolRequest, sanitize_value};

/// Serve tool calls over the process's stdio
pub async fn serve_stdio(dispatcher: &ToolDispatcher) -> Result<()> {
    info!("Serving tool calls on stdio");
    serve(dispatcher, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// Serve tool calls over any line-oriented transport (testable)
pub async fn serve<R, W>(dispatcher: &ToolDispatcher, mut reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await.context("Failed to read request line")?;
        if bytes_read == 0 {
            debug!("EOF on input, shutting down");
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<ToolRequest>(trimmed) {
            Ok(request) => dispatcher.dispatch(request).await,
            Err(e) => sanitize_value(json!({
                "success": false,
                "error": format!("malformed request: {}", e),
                "error_kind": "invalid-input",
            })),
        };

        let encoded = serde_json::to_string(&reply).context("Failed to serialize response")?;
        writer.write_all(encoded.as_bytes()).await.context("Failed to write response")?;
        writer.write_all(b"\n").await.context("Failed to write newline")?;
        writer.flush().await.context("Failed to flush response")?;
    }
}
