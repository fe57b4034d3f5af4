//! Buffered client socket with bounded, timed reads.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::error::{HandlerError, RequestError, TransportError};

const READ_BUFFER_SIZE: usize = 8192;

/// Client connection as seen by the connection handler.
///
/// Generic over the stream so tests can drive it with `tokio::io::duplex`.
pub struct LineSocket<S> {
    stream: BufReader<S>,
    peer: SocketAddr,
}

impl<S> LineSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream: BufReader::with_capacity(READ_BUFFER_SIZE, stream),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reads one line, without its line terminator.
    ///
    /// Lines longer than `max_len` bytes are a request error; hitting
    /// `limit` or end of stream is a transport error.
    pub async fn read_line(
        &mut self,
        max_len: usize,
        limit: Duration,
    ) -> Result<String, HandlerError> {
        let line = match timeout(limit, self.read_raw_line(max_len)).await {
            Ok(line) => line?,
            Err(_) => return Err(TransportError::Timeout.into()),
        };

        let mut line = String::from_utf8(line)
            .map_err(|_| RequestError::bad_request("Request line is not valid UTF-8"))?;
        if line.ends_with('\n') {
            line.pop();
        }
        if line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn read_raw_line(&mut self, max_len: usize) -> Result<Vec<u8>, HandlerError> {
        let mut line = Vec::new();

        loop {
            let (done, used) = {
                let available = self
                    .stream
                    .fill_buf()
                    .await
                    .map_err(TransportError::from_io)?;
                if available.is_empty() {
                    return Err(TransportError::Closed.into());
                }
                match available.iter().position(|b| *b == b'\n') {
                    Some(i) => {
                        line.extend_from_slice(&available[..=i]);
                        (true, i + 1)
                    }
                    None => {
                        line.extend_from_slice(available);
                        (false, available.len())
                    }
                }
            };
            self.stream.consume(used);

            if line.len() > max_len {
                return Err(RequestError::bad_request(format!(
                    "Line exceeds {max_len} bytes"
                ))
                .into());
            }
            if done {
                return Ok(line);
            }
        }
    }

    /// Reads exactly `len` body bytes.
    pub async fn read_body(&mut self, len: usize, limit: Duration) -> Result<Vec<u8>, TransportError> {
        let mut body = vec![0u8; len];
        match timeout(limit, self.stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => Ok(body),
            Ok(Err(e)) => Err(TransportError::from_io(e)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// The underlying stream, for writing responses.
    pub fn stream_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.get_mut();
        stream.write_all(bytes).await.map_err(TransportError::from_io)?;
        stream.flush().await.map_err(TransportError::from_io)
    }

    /// Shuts down the write side. Errors are irrelevant at this point.
    pub async fn close(&mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }
}
