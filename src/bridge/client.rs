//! Bridge client: one connection, typed outbound records, blocking receive.
//!
//! The stream is split into a read half and a write half, each behind its
//! own async lock. Writers (send, publish, register, ...) serialize on the
//! write lock and never wait on the reader, so they are safe to call from
//! any number of tasks while another task sits in [`BridgeClient::receive`].
//!
//! # Lifecycle
//!
//! ```text
//! BridgeClient::connect(addr) ──► send / publish / register / receive ...
//!                                        │
//!                                   close() ──► write half shut down,
//!                                               pending receive() returns Closed
//! ```

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use super::framing::{self, FrameReader, DEFAULT_MAX_FRAME_SIZE};
use super::message::{self, Message};
use super::BridgeError;
use crate::config::BridgeConfig;

/// Connection to a remote event bus bridge.
///
/// Generic over the stream so tests can run against an in-memory pipe;
/// production code uses the default `TcpStream`.
pub struct BridgeClient<S = TcpStream> {
    /// Remote address (for logging).
    peer: String,
    /// Read half plus any partially received frame. Held for one receive.
    reader: Mutex<FrameReader<ReadHalf<S>>>,
    /// Write half. `None` once closed.
    writer: Mutex<Option<WriteHalf<S>>>,
    /// Flips to `true` on close; wakes a blocked `receive()`.
    closed_tx: watch::Sender<bool>,
    max_frame_size: u32,
}

impl<S> std::fmt::Debug for BridgeClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("peer", &self.peer)
            .field("closed", &*self.closed_tx.borrow())
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

impl BridgeClient<TcpStream> {
    /// Connect to a bridge at `address` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConnectionFailed`] if the remote is unreachable.
    pub async fn connect(address: &str) -> Result<Self, BridgeError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| BridgeError::ConnectionFailed {
                address: address.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("[Bridge] Failed to set TCP_NODELAY for {address}: {e}");
        }
        log::info!("[Bridge] Connected to {address}");
        Ok(Self::from_stream(stream, address))
    }

    /// Connect using the address and frame limit from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConnectionFailed`] if the remote is unreachable.
    pub async fn connect_with_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let client = Self::connect(&config.address).await?;
        Ok(client.with_max_frame_size(config.max_frame_size))
    }
}

impl<S> BridgeClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap an already-connected stream.
    pub fn from_stream(stream: S, peer: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed_tx, _) = watch::channel(false);
        Self {
            peer: peer.into(),
            reader: Mutex::new(FrameReader::new(reader, DEFAULT_MAX_FRAME_SIZE)),
            writer: Mutex::new(Some(writer)),
            closed_tx,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Override the maximum frame payload size (both directions).
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self.reader.get_mut().set_max_frame_size(max_frame_size);
        self
    }

    /// Remote address this client was created for.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Close the connection.
    ///
    /// Shuts down the write half and wakes any task blocked in
    /// [`receive`](Self::receive). Closing twice is an error, as on the
    /// underlying socket.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Closed`] if already closed, or
    /// [`BridgeError::Transport`] if the shutdown fails.
    pub async fn close(&self) -> Result<(), BridgeError> {
        let mut writer = self.writer.lock().await;
        let Some(mut half) = writer.take() else {
            return Err(BridgeError::Closed);
        };
        self.closed_tx.send_replace(true);
        log::info!("[Bridge] Closing connection to {}", self.peer);
        half.shutdown().await?;
        Ok(())
    }

    /// Send a point-to-point message with no reply address.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Encode`] if `body` cannot be represented as
    /// JSON, or a transport error if the write fails.
    pub async fn send<B>(
        &self,
        address: &str,
        headers: Option<Value>,
        body: &B,
    ) -> Result<(), BridgeError>
    where
        B: Serialize + ?Sized,
    {
        let msg = Message::send(address, None, headers, message::to_value(body)?);
        self.send_message(&msg).await
    }

    /// Send a point-to-point message asking for a reply at `reply_address`.
    ///
    /// The reply arrives later through [`receive`](Self::receive), addressed
    /// to `reply_address`.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn send_with_reply<B>(
        &self,
        address: &str,
        reply_address: &str,
        headers: Option<Value>,
        body: &B,
    ) -> Result<(), BridgeError>
    where
        B: Serialize + ?Sized,
    {
        let msg = Message::send(
            address,
            Some(reply_address.to_string()),
            headers,
            message::to_value(body)?,
        );
        self.send_message(&msg).await
    }

    /// Publish a broadcast message. No reply is ever expected.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn publish<B>(
        &self,
        address: &str,
        headers: Option<Value>,
        body: &B,
    ) -> Result<(), BridgeError>
    where
        B: Serialize + ?Sized,
    {
        let msg = Message::publish(address, headers, message::to_value(body)?);
        self.send_message(&msg).await
    }

    /// Ask the bridge to deliver records for `address` to this connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the write fails.
    pub async fn register(&self, address: &str) -> Result<(), BridgeError> {
        self.send_message(&Message::register(address)).await
    }

    /// Stop delivery of records for `address` to this connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the write fails.
    pub async fn unregister(&self, address: &str) -> Result<(), BridgeError> {
        self.send_message(&Message::unregister(address)).await
    }

    /// Send a keepalive ping. The bridge answers with a `pong` record.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the write fails.
    pub async fn ping(&self) -> Result<(), BridgeError> {
        self.send_message(&Message::ping()).await
    }

    /// Write one pre-built record as one frame.
    ///
    /// The record is fully encoded before the write lock is taken, so an
    /// encoding failure never leaves a partial frame on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Encode`], [`BridgeError::FrameTooLarge`],
    /// [`BridgeError::Closed`] or [`BridgeError::Transport`].
    pub async fn send_message(&self, message: &Message) -> Result<(), BridgeError> {
        let payload = message.encode()?;

        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or(BridgeError::Closed)?;
        framing::write_frame(half, &payload, self.max_frame_size).await?;

        log::debug!(
            "[Bridge] Sent {} frame ({} bytes) to {:?}",
            message.kind,
            payload.len(),
            message.address
        );
        Ok(())
    }

    /// Wait for the next inbound record.
    ///
    /// Use from one task at a time; the dispatcher's receive loop is the
    /// usual single reader. `err` records are returned as normal records.
    ///
    /// Cancel-safe: if the future is dropped mid-frame (for example by a
    /// `tokio::time::timeout`), the bytes received so far are kept and the
    /// next call picks up where this one stopped.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Closed`] if the client is or becomes closed,
    /// a transport error if the stream fails, or [`BridgeError::Decode`]
    /// if the payload is not a valid record.
    pub async fn receive(&self) -> Result<Message, BridgeError> {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut reader = self.reader.lock().await;

        let payload = tokio::select! {
            result = reader.next_frame() => result?,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(BridgeError::Closed),
        };

        let message = Message::decode(&payload)?;
        log::debug!(
            "[Bridge] Received {} frame ({} bytes) for {:?}",
            message.kind,
            payload.len(),
            message.address
        );
        Ok(message)
    }
}
