//! An in-memory [`MessageChannel`] pair used to drive end-to-end scenarios
//! against a real [`wireio::Server`] without any actual network transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use wireio::channel::{CloseInfo, Frame, MessageChannel, TransportError, WriteOutcome};

/// The server-facing end: handed to [`wireio::Server::accept`].
pub struct TestChannel {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl MessageChannel for TestChannel {
    async fn read(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.inbound.recv().await)
    }

    fn write(&self, frame: Frame) -> Result<WriteOutcome, TransportError> {
        // The receiving end (`TestClient`) is dropped by some tests once
        // they've seen everything they care about; a closed outbound channel
        // at that point isn't a transport failure.
        let _ = self.outbound.send(frame);
        Ok(WriteOutcome::Accepted)
    }

    fn close(&self, _info: CloseInfo) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn remote_address(&self) -> String {
        "127.0.0.1:0".to_string()
    }

    fn local_address(&self) -> String {
        "127.0.0.1:1".to_string()
    }
}

/// The test-driver end: sends frames as if they came from a client, and
/// observes everything the server writes out.
pub struct TestClient {
    to_server: mpsc::UnboundedSender<Frame>,
    from_server: mpsc::UnboundedReceiver<Frame>,
    pub closed: Arc<AtomicBool>,
}

impl TestClient {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_server.send(Frame::Text(text.into()));
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.to_server.send(frame);
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_server.recv().await
    }

    /// Awaits the next frame, panicking if none arrives within `millis`.
    pub async fn recv_within(&mut self, millis: u64) -> Frame {
        tokio::time::timeout(std::time::Duration::from_millis(millis), self.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("channel closed before a frame arrived")
    }
}

pub fn channel_pair() -> (TestChannel, TestClient) {
    let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
    let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        TestChannel {
            inbound: c2s_rx,
            outbound: s2c_tx,
            closed: closed.clone(),
        },
        TestClient {
            to_server: c2s_tx,
            from_server: s2c_rx,
            closed,
        },
    )
}

pub fn as_text(frame: Frame) -> String {
    match frame {
        Frame::Text(s) => s,
        Frame::Binary(_) => panic!("expected a text frame, got a binary one"),
    }
}

pub fn as_binary(frame: Frame) -> Vec<u8> {
    match frame {
        Frame::Binary(b) => b,
        Frame::Text(s) => panic!("expected a binary frame, got text: {s}"),
    }
}

/// Splits a `2<ackid><json>` EVENT header (default namespace, no comma) into
/// its ack id and JSON payload.
pub fn parse_ack_event_header(text: &str) -> (i64, serde_json::Value) {
    let rest = text.strip_prefix('2').expect("expected an EVENT packet");
    let digit_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let ack_id: i64 = rest[..digit_end].parse().expect("expected a leading ack id");
    let payload: serde_json::Value = serde_json::from_str(&rest[digit_end..]).expect("valid JSON payload");
    (ack_id, payload)
}
