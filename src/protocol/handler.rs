//! Connection handler for the prefixed line echo protocol.

use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::parser;
use crate::stats::Stats;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Handle a single client connection until it closes.
///
/// Returns `Ok(())` when the peer shuts down its side of the stream and the
/// first read or write error otherwise. The connection is counted in `stats`
/// for the whole call and is closed when `stream` is dropped on return.
pub async fn handle_connection<S>(
    mut stream: S,
    prefix: Arc<str>,
    stats: Arc<Stats>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _guard = stats.connection_opened();

    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut response = BytesMut::with_capacity(BUFFER_SIZE);
    // Bytes at the front of `buffer` already known to hold no delimiter
    let mut scanned = 0;

    loop {
        while let Some(len) = parser::find_line(&buffer, scanned) {
            let line = buffer.split_to(len);
            scanned = 0;

            stats.record_line();
            trace!(len, "Line received");
            parser::write_response(&prefix, &line, &mut response);
        }
        scanned = buffer.len();

        if !response.is_empty() {
            stream.write_all(&response).await?;
            response.clear();
        }

        if buffer.capacity() - buffer.len() < BUFFER_SIZE / 4 {
            buffer.reserve(BUFFER_SIZE);
        }

        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            if !buffer.is_empty() {
                debug!(bytes = buffer.len(), "Discarding unterminated trailing data");
            }
            trace!("Connection closed by client");
            return Ok(());
        }
    }
}
