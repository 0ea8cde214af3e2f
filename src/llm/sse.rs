//! SSE plumbing shared by the streaming providers.
//!
//! [`LineBuffer`] reassembles complete lines out of arbitrarily split byte
//! chunks, and [`StreamSink`] is the provider-facing half of the client
//! response stream: frames pushed into it come out of the handler's body
//! stream, and a one-shot readiness signal lets the handler keep the 500
//! path open until the upstream connection is actually established.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use super::LlmError;

/// Reassembles `\n`-terminated lines from a stream of byte chunks.
///
/// Upstream chunks can split lines anywhere, including in the middle of a
/// UTF-8 sequence; bytes after the last newline stay buffered until the
/// next push.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and drain every complete line, with the trailing
    /// `\n` (and `\r`, if present) stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// Provider-side handle for streaming SSE frames back to the client.
pub struct StreamSink {
    ready: Option<oneshot::Sender<Result<(), LlmError>>>,
    frames: mpsc::Sender<Bytes>,
}

impl StreamSink {
    /// Create a sink plus the handler-side readiness and frame receivers.
    pub fn channel(
        capacity: usize,
    ) -> (Self, oneshot::Receiver<Result<(), LlmError>>, mpsc::Receiver<Bytes>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        (Self { ready: Some(ready_tx), frames: frame_tx }, ready_rx, frame_rx)
    }

    /// Whether the client side of the stream has already gone away.
    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }

    /// Signal that the upstream accepted the call and streaming begins.
    ///
    /// Idempotent. Fails with [`LlmError::StreamClosed`] when the handler
    /// side has already gone away, in which case there is no point opening
    /// the upstream stream at all.
    pub fn open(&mut self) -> Result<(), LlmError> {
        match self.ready.take() {
            Some(tx) => tx.send(Ok(())).map_err(|_| LlmError::StreamClosed),
            None => Ok(()),
        }
    }

    /// Forward one SSE frame to the client, opening the stream first if
    /// needed.
    pub async fn send(&mut self, frame: Bytes) -> Result<(), LlmError> {
        self.open()?;
        self.frames.send(frame).await.map_err(|_| LlmError::StreamClosed)
    }

    /// Report a failure. Before the stream opened this hands the error to
    /// the handler (which turns it into a 500); afterwards the client only
    /// sees a truncated stream, so the error is just logged.
    pub fn abort(&mut self, err: LlmError) {
        match self.ready.take() {
            Some(tx) => {
                if let Err(payload) = tx.send(Err(err)) {
                    warn!(error = ?payload, "client went away before upstream failure could be reported");
                }
            }
            None => error!(error = %err, "llm stream aborted after streaming began"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_single_chunk() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"data: one\n\ndata: two\n");
        assert_eq!(lines, vec!["data: one", "", "data: two"]);
    }

    #[test]
    fn test_line_buffer_split_mid_line() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"del").is_empty());
        assert!(buf.push(b"ta\":\"Par").is_empty());
        let lines = buf.push(b"is\"}\n");
        assert_eq!(lines, vec![r#"data: {"delta":"Paris"}"#]);
    }

    #[test]
    fn test_line_buffer_strips_crlf() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"data: x\r\n");
        assert_eq!(lines, vec!["data: x"]);
    }

    #[test]
    fn test_line_buffer_keeps_trailing_partial() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"done\npartial");
        assert_eq!(lines, vec!["done"]);
        let lines = buf.push(b" line\n");
        assert_eq!(lines, vec!["partial line"]);
    }

    #[tokio::test]
    async fn test_sink_open_then_send() {
        let (mut sink, ready_rx, mut frames) = StreamSink::channel(4);

        sink.send(Bytes::from_static(b"data: hi\n\n")).await.unwrap();
        assert!(ready_rx.await.unwrap().is_ok());
        assert_eq!(frames.recv().await.unwrap(), Bytes::from_static(b"data: hi\n\n"));
    }

    #[tokio::test]
    async fn test_sink_abort_before_open_reports_error() {
        let (mut sink, ready_rx, _frames) = StreamSink::channel(4);

        sink.abort(LlmError::NoProvider(crate::types::Level::Medium));
        let signalled = ready_rx.await.unwrap();
        assert!(matches!(signalled, Err(LlmError::NoProvider(_))));
    }

    #[tokio::test]
    async fn test_sink_send_fails_when_client_gone() {
        let (mut sink, ready_rx, frames) = StreamSink::channel(4);
        drop(ready_rx);
        drop(frames);

        let err = sink.send(Bytes::from_static(b"data: hi\n\n")).await.unwrap_err();
        assert!(matches!(err, LlmError::StreamClosed));
    }
}
