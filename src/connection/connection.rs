use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::config::Config;
use crate::connection::ping::{PingRegistry, PongWaiter, unique_payload};
use crate::connection::state::StateCell;
use crate::connection::{ConnectionState, Role, Transport};
use crate::error::{Error, Result};
use crate::extensions::ExtensionPipeline;
use crate::message::{CloseCode, CloseFrame, Message};
use crate::protocol::{Frame, Headers, MAX_CONTROL_FRAME_PAYLOAD, MessageAssembler, OpCode};

/// Outcome of the opening handshake handed to the engine.
#[derive(Debug, Default)]
pub(crate) struct Negotiated {
    pub(crate) subprotocol: Option<String>,
    pub(crate) extensions: ExtensionPipeline,
    pub(crate) path: String,
    pub(crate) request_headers: Headers,
    pub(crate) response_headers: Headers,
    /// Bytes received after the handshake's HTTP head.
    pub(crate) buffered: BytesMut,
}

/// State shared by the connection handle, the read loop and the close task.
struct Inner<T: Transport> {
    role: Role,
    timeout: Duration,
    max_size: Option<usize>,
    state: StateCell,
    close: Mutex<Option<CloseFrame>>,
    pings: Mutex<PingRegistry>,
    extensions: Mutex<ExtensionPipeline>,
    writer: AsyncMutex<Option<FrameWriter<WriteHalf<T>>>>,
    cancel_reading: Notify,
    aborted: watch::Sender<bool>,
    transfer_done: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

/// An open WebSocket connection.
///
/// Created by [`crate::client::connect`], [`crate::client::client_handshake`]
/// or [`crate::server::accept`] once the opening handshake succeeded. A
/// background task reads frames, answers pings and queues complete messages
/// for [`Connection::recv`]; a second task tears the transport down once the
/// closing handshake is over.
///
/// All methods take `&self`, so a connection can be shared between a reader
/// and writers behind an `Arc`. Dropping the connection without closing it
/// aborts the transport.
///
/// ```rust,no_run
/// use wsconn::{CloseCode, Config, Message};
///
/// # async fn run() -> wsconn::Result<()> {
/// let conn = wsconn::client::connect("ws://localhost:9001/chat", &Config::client()).await?;
/// conn.send(Message::text("hello")).await?;
/// let reply = conn.recv().await?;
/// conn.close(CloseCode::Normal, "bye").await?;
/// # Ok(())
/// # }
/// ```
pub struct Connection<T: Transport> {
    inner: Arc<Inner<T>>,
    inbound: AsyncMutex<mpsc::Receiver<Message>>,
    subprotocol: Option<String>,
    extensions: Vec<&'static str>,
    path: String,
    request_headers: Headers,
    response_headers: Headers,
}

impl<T: Transport> Connection<T> {
    /// Run the engine on a transport whose opening handshake was done
    /// elsewhere, without extensions or subprotocol.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(io: T, role: Role, config: &Config) -> Self {
        Self::open(io, role, config, Negotiated::default())
    }

    pub(crate) fn open(io: T, role: Role, config: &Config, negotiated: Negotiated) -> Self {
        let half_close = io.supports_half_close();
        let (read_half, write_half) = tokio::io::split(io);
        let reader = FrameReader::with_buffered(
            read_half,
            role.expects_masked(),
            config.read_buffer_size,
            negotiated.buffered,
        );
        let writer = FrameWriter::new(write_half, role.must_mask(), config.write_buffer_size);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.max_queue.max(1));
        let extension_names = negotiated.extensions.names();

        let inner = Arc::new(Inner {
            role,
            timeout: config.timeout,
            max_size: config.max_size,
            state: StateCell::new(ConnectionState::Connecting),
            close: Mutex::new(None),
            pings: Mutex::new(PingRegistry::default()),
            extensions: Mutex::new(negotiated.extensions),
            writer: AsyncMutex::new(Some(writer)),
            cancel_reading: Notify::new(),
            aborted: watch::Sender::new(false),
            transfer_done: watch::Sender::new(false),
            closed: watch::Sender::new(false),
        });

        inner.state.advance(ConnectionState::Open);
        debug!(
            role = %role,
            subprotocol = ?negotiated.subprotocol,
            extensions = ?extension_names,
            "connection open"
        );

        let read_task = tokio::spawn(Arc::clone(&inner).read_loop(reader, inbound_tx));
        tokio::spawn(Arc::clone(&inner).close_transport(read_task, half_close));

        Self {
            inner,
            inbound: AsyncMutex::new(inbound_rx),
            subprotocol: negotiated.subprotocol,
            extensions: extension_names,
            path: negotiated.path,
            request_headers: negotiated.request_headers,
            response_headers: negotiated.response_headers,
        }
    }

    /// Receive the next message.
    ///
    /// Messages queued before the connection closed are still delivered.
    /// Cancelling a pending `recv` never loses a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] with the close code and reason
    /// once the connection is closed and the queue is drained.
    pub async fn recv(&self) -> Result<Message> {
        let mut inbound = self.inbound.lock().await;
        if let Some(message) = inbound.recv().await {
            return Ok(message);
        }
        drop(inbound);
        if self.close_code().is_none() {
            self.wait_closed().await;
        }
        Err(self.inner.closed_error())
    }

    /// Send a text or binary message as a single frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] unless the connection is open, or
    /// if the transport fails while writing.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.ensure_open().await?;
        let frame = match message.into() {
            Message::Text(text) => Frame::text(text),
            Message::Binary(data) => Frame::binary(data),
        };
        self.inner.write_frame(frame).await
    }

    /// Send a ping and return a future resolving when its pong arrives.
    ///
    /// With `None`, four random bytes not used by another outstanding ping
    /// are sent. A pong acknowledges its ping and every ping sent before it.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicatePing`] if `data` is already waiting for a pong
    /// - [`Error::Protocol`] if `data` is longer than 125 bytes
    /// - [`Error::ConnectionClosed`] unless the connection is open
    pub async fn ping(&self, data: Option<Vec<u8>>) -> Result<PongWaiter> {
        self.ensure_open().await?;
        let (data, waiter) = {
            let mut pings = self.inner.pings.lock().unwrap_or_else(PoisonError::into_inner);
            let data = match data {
                Some(data) if data.len() > MAX_CONTROL_FRAME_PAYLOAD => {
                    return Err(Error::protocol("control frame too long"));
                }
                Some(data) => data,
                None => unique_payload(&pings)?,
            };
            let waiter = pings.register(data.clone())?;
            (data, waiter)
        };
        self.inner.write_frame(Frame::ping(data)).await?;
        Ok(waiter)
    }

    /// Send an unsolicited pong, e.g. as a unidirectional heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] unless the connection is open.
    pub async fn pong(&self, data: Vec<u8>) -> Result<()> {
        self.ensure_open().await?;
        self.inner.write_frame(Frame::pong(data)).await
    }

    /// Perform the closing handshake and release the transport.
    ///
    /// Each stage is bounded by the configured timeout, so this returns in
    /// bounded time. Safe to call concurrently and repeatedly: only one
    /// close frame is ever written, and every caller returns once the
    /// connection is closed. Transport errors are not reported.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCloseCode`] for a code that may not be sent
    /// and [`Error::Protocol`] for a reason longer than 123 bytes.
    pub async fn close(&self, code: impl Into<CloseCode>, reason: &str) -> Result<()> {
        let payload = CloseFrame::new(code.into(), reason).serialize()?;
        let inner = &self.inner;

        match time::timeout(inner.timeout, inner.write_close(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(role = %inner.role, error = %err, "failed to send close frame");
                inner.abort();
            }
            Err(_) => {
                debug!(role = %inner.role, "timed out sending close frame");
                inner.abort();
            }
        }

        let mut transfer_done = inner.transfer_done.subscribe();
        if time::timeout(inner.timeout, transfer_done.wait_for(|done| *done))
            .await
            .is_err()
        {
            debug!(role = %inner.role, "timed out waiting for the closing handshake");
            inner.cancel_reading.notify_one();
        }

        self.wait_closed().await;
        Ok(())
    }

    /// Wait until the connection is closed.
    pub async fn wait_closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn ensure_open(&self) -> Result<()> {
        let state = self.state();
        let reading = !*self.inner.transfer_done.borrow();
        if state == ConnectionState::Open && reading {
            return Ok(());
        }
        // The outcome is only known once the close task has finished.
        if state == ConnectionState::Open
            || (state == ConnectionState::Closing && self.close_code().is_none())
        {
            self.wait_closed().await;
        }
        Err(self.inner.closed_error())
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Close code received from the peer or recorded when the connection
    /// failed. 1006 once closed without either; `None` while still open.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        self.inner.close_frame().map(|frame| frame.code.as_u16())
    }

    /// Close reason matching [`Connection::close_code`].
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_frame().map(|frame| frame.reason)
    }

    /// Negotiated subprotocol.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Names of the negotiated extensions, in negotiated order.
    #[must_use]
    pub fn extensions(&self) -> &[&'static str] {
        &self.extensions
    }

    /// Request target of the opening handshake.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn request_headers(&self) -> &Headers {
        &self.request_headers
    }

    #[must_use]
    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        if !self.is_closed() {
            trace!(role = %self.inner.role, "connection dropped before closing");
            self.inner.abort();
        }
    }
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("subprotocol", &self.subprotocol)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Inner<T> {
    fn close_frame(&self) -> Option<CloseFrame> {
        self.close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record why the connection ended. A close frame from the peer always
    /// wins; local failures only fill in a missing record.
    fn record_close(&self, code: u16, reason: &str, from_peer: bool) {
        let mut close = self.close.lock().unwrap_or_else(PoisonError::into_inner);
        if from_peer || close.is_none() {
            *close = Some(CloseFrame::new(CloseCode::from_u16(code), reason));
        }
    }

    fn closed_error(&self) -> Error {
        let (code, reason) = self.close_frame().map_or_else(
            || (CloseCode::Abnormal.as_u16(), String::new()),
            |frame| (frame.code.as_u16(), frame.reason),
        );
        Error::ConnectionClosed { code, reason }
    }

    /// Stop reading, interrupt pending writes and skip the graceful
    /// teardown stages.
    fn abort(&self) {
        self.aborted.send_replace(true);
        self.cancel_reading.notify_one();
    }

    fn is_aborted(&self) -> bool {
        *self.aborted.borrow()
    }

    /// Resolves once the connection is aborted.
    async fn aborting(&self) {
        let mut aborted = self.aborted.subscribe();
        let _ = aborted.wait_for(|aborted| *aborted).await;
    }

    async fn write_frame(&self, frame: Frame) -> Result<()> {
        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            () = self.aborting() => return Err(self.closed_error()),
        };
        let Some(writer) = guard.as_mut() else {
            return Err(self.closed_error());
        };
        trace!(role = %self.role, "> {frame}");
        let written = tokio::select! {
            result = writer.write_frame(frame, &self.extensions) => Some(result),
            () = self.aborting() => None,
        };
        let Some(result) = written else {
            // A frame may be half written, so the writer is unusable.
            debug!(role = %self.role, "write interrupted by abort");
            guard.take();
            return Err(self.closed_error());
        };
        match result {
            Err(Error::Io(err)) => {
                debug!(role = %self.role, error = %err, "write failed");
                self.record_close(CloseCode::Abnormal.as_u16(), "", false);
                self.cancel_reading.notify_one();
                Err(self.closed_error())
            }
            result => result,
        }
    }

    /// Send a close frame unless one was already sent or received.
    async fn write_close(&self, payload: Vec<u8>) -> Result<()> {
        if !self
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            return Ok(());
        }
        debug!(role = %self.role, "state OPEN -> CLOSING");
        self.write_frame(Frame::close(payload)).await
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: FrameReader<ReadHalf<T>>,
        inbound: mpsc::Sender<Message>,
    ) -> FrameReader<ReadHalf<T>> {
        tokio::select! {
            biased;
            () = self.cancel_reading.notified() => {
                debug!(role = %self.role, "read loop cancelled");
            }
            () = self.transfer(&mut reader, inbound) => {}
        }
        self.transfer_done.send_replace(true);
        reader
    }

    /// Read frames until a close frame, a failure or the end of the stream.
    async fn transfer(&self, reader: &mut FrameReader<ReadHalf<T>>, inbound: mpsc::Sender<Message>) {
        let mut assembler = MessageAssembler::new(self.max_size);
        loop {
            // Frames of a fragmented message share the message budget.
            let budget = self
                .max_size
                .map(|max| max.saturating_sub(assembler.buffered()));

            let frame = match reader.read_frame(budget, &self.extensions).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(role = %self.role, "stream ended without a close frame");
                    self.record_close(CloseCode::Abnormal.as_u16(), "", false);
                    return;
                }
                Err(Error::Io(err)) => {
                    debug!(role = %self.role, error = %err, "read failed");
                    self.record_close(CloseCode::Abnormal.as_u16(), "", false);
                    return;
                }
                Err(Error::PayloadTooBig { size, max }) => {
                    let err = Error::PayloadTooBig {
                        size: size + assembler.buffered(),
                        max: self.max_size.unwrap_or(max),
                    };
                    return self.fail_connection(err).await;
                }
                Err(err) => return self.fail_connection(err).await,
            };
            trace!(role = %self.role, "< {frame}");

            match frame.opcode {
                OpCode::Close => {
                    let close = match CloseFrame::parse(&frame.payload) {
                        Ok(close) => close,
                        Err(err) => return self.fail_connection(err).await,
                    };
                    debug!(
                        role = %self.role,
                        code = close.code.as_u16(),
                        reason = %close.reason,
                        "received close frame"
                    );
                    self.record_close(close.code.as_u16(), &close.reason, true);
                    // Echo the peer's payload unless we already sent ours.
                    if let Err(err) = self.write_close(frame.payload).await {
                        debug!(role = %self.role, error = %err, "failed to echo close frame");
                    }
                    return;
                }
                OpCode::Ping => {
                    if self.state.get() == ConnectionState::Open
                        && self.write_frame(Frame::pong(frame.payload)).await.is_err()
                    {
                        return;
                    }
                }
                OpCode::Pong => {
                    let acknowledged = self
                        .pings
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .acknowledge(&frame.payload);
                    if acknowledged == 0 {
                        trace!(role = %self.role, "unsolicited pong");
                    }
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    match assembler.push(frame) {
                        Ok(Some(message)) => {
                            // Blocks while the queue is full.
                            if inbound.send(message).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => return self.fail_connection(err).await,
                    }
                }
            }
        }
    }

    /// Record `err`, send the matching close frame if still open and stop
    /// reading without waiting for the peer's reply.
    async fn fail_connection(&self, err: Error) {
        let code = err.close_code();
        let reason = truncate_reason(&err.to_string());
        debug!(role = %self.role, code, error = %err, "failing connection");
        self.record_close(code, &reason, false);

        if code == CloseCode::Abnormal.as_u16() {
            return;
        }
        match CloseFrame::new(CloseCode::from_u16(code), reason).serialize() {
            Ok(payload) => {
                if time::timeout(self.timeout, self.write_close(payload))
                    .await
                    .is_err()
                {
                    self.aborted.send_replace(true);
                }
            }
            Err(err) => warn!(role = %self.role, error = %err, "cannot build close frame"),
        }
    }

    /// Tear the transport down once the read loop is over.
    async fn close_transport(
        self: Arc<Self>,
        read_task: JoinHandle<FrameReader<ReadHalf<T>>>,
        half_close: bool,
    ) {
        let mut reader = match read_task.await {
            Ok(reader) => Some(reader),
            Err(err) => {
                warn!(role = %self.role, error = %err, "read loop failed");
                self.transfer_done.send_replace(true);
                None
            }
        };
        let timeout = self.timeout;

        let graceful = 'stages: {
            if self.is_aborted() {
                break 'stages false;
            }

            if self.role.initiated_transport() {
                debug!(role = %self.role, "waiting for the peer to close the transport");
                if let Some(reader) = reader.as_mut() {
                    if wait_for_eof(reader, timeout).await {
                        break 'stages true;
                    }
                }
            }

            let writer = match time::timeout(timeout, self.writer.lock()).await {
                Ok(mut guard) => guard.take(),
                Err(_) => break 'stages false,
            };
            let Some(mut writer) = writer else {
                break 'stages false;
            };

            if half_close {
                debug!(role = %self.role, "half-closing the transport");
            } else {
                debug!(role = %self.role, "closing the transport");
            }
            // Either way the peer gets one more timeout to close its end.
            if matches!(time::timeout(timeout, writer.shutdown()).await, Ok(Ok(()))) {
                if let Some(reader) = reader.as_mut() {
                    if wait_for_eof(reader, timeout).await {
                        break 'stages true;
                    }
                }
            }
            false
        };

        if !graceful {
            debug!(role = %self.role, "aborting the transport");
        }
        // Interrupts a write still holding the writer so it can be dropped.
        self.aborted.send_replace(true);
        self.writer.lock().await.take();
        drop(reader);
        self.finish();
    }

    fn finish(&self) {
        self.state.advance(ConnectionState::Closed);
        self.record_close(CloseCode::Abnormal.as_u16(), "", false);
        let err = self.closed_error();
        self.pings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort(&err);
        debug!(role = %self.role, error = %err, "state CLOSED");
        self.closed.send_replace(true);
    }
}

/// Discard incoming bytes until the peer closes; `false` on timeout.
async fn wait_for_eof<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    timeout: Duration,
) -> bool {
    time::timeout(timeout, reader.read_to_eof()).await.is_ok()
}

fn truncate_reason(reason: &str) -> String {
    let max = MAX_CONTROL_FRAME_PAYLOAD - 2;
    if reason.len() <= max {
        return reason.to_string();
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
