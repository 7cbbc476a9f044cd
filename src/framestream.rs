//! Frame Streams listener delivering raw dnstap records.
//!
//! Each connection is a sequence of big-endian length-prefixed frames. A
//! zero length introduces a control frame used for the handshake:
//!
//! ```text
//! bidirectional:   READY ->   <- ACCEPT   START -> data... STOP ->   <- FINISH
//! unidirectional:  START -> data... STOP ->
//! ```
//!
//! Data frames are forwarded untouched to the shared record queue.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::envelope::CONTENT_TYPE;
use crate::error::{CollectorError, FrameError};
use crate::metrics::{self, ConnectionEvent};

/// Largest control frame the protocol allows.
pub const MAX_CONTROL_FRAME_SIZE: usize = 512;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const FIELD_CONTENT_TYPE: u32 = 1;

/// Control frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Receiver agrees to a content type.
    Accept,
    /// Sender begins a stream.
    Start,
    /// Sender ends a stream.
    Stop,
    /// Sender asks to negotiate.
    Ready,
    /// Receiver acknowledges STOP.
    Finish,
}

impl ControlKind {
    /// Wire value.
    pub fn code(self) -> u32 {
        match self {
            ControlKind::Accept => 1,
            ControlKind::Start => 2,
            ControlKind::Stop => 3,
            ControlKind::Ready => 4,
            ControlKind::Finish => 5,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ControlKind::Accept),
            2 => Some(ControlKind::Start),
            3 => Some(ControlKind::Stop),
            4 => Some(ControlKind::Ready),
            5 => Some(ControlKind::Finish),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ControlKind::Accept => "ACCEPT",
            ControlKind::Start => "START",
            ControlKind::Stop => "STOP",
            ControlKind::Ready => "READY",
            ControlKind::Finish => "FINISH",
        }
    }
}

/// A parsed control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// Control type.
    pub kind: ControlKind,
    /// Content types carried by the frame, in order.
    pub content_types: Vec<Bytes>,
}

impl ControlFrame {
    /// Whether the frame permits dnstap. A frame naming no content type
    /// permits anything.
    fn offers_dnstap(&self) -> bool {
        self.content_types.is_empty()
            || self.content_types.iter().any(|ct| ct.as_ref() == CONTENT_TYPE)
    }
}

/// One frame read off a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data frame payload.
    Data(Bytes),
    /// A control frame.
    Control(ControlFrame),
}

/// Encode a data frame.
pub fn data_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf
}

/// Encode a control frame, optionally carrying one content type field.
pub fn control_frame(kind: ControlKind, content_type: Option<&[u8]>) -> Vec<u8> {
    let fields_len = content_type.map_or(0, |ct| 8 + ct.len());
    let mut buf = Vec::with_capacity(12 + fields_len);
    buf.put_u32(0);
    buf.put_u32((4 + fields_len) as u32);
    buf.put_u32(kind.code());
    if let Some(ct) = content_type {
        buf.put_u32(FIELD_CONTENT_TYPE);
        buf.put_u32(ct.len() as u32);
        buf.put_slice(ct);
    }
    buf
}

fn parse_control(mut body: &[u8]) -> Result<ControlFrame, FrameError> {
    let code = take_u32(&mut body).ok_or(FrameError::MalformedControl("missing control type"))?;
    let kind =
        ControlKind::from_code(code).ok_or(FrameError::MalformedControl("unknown control type"))?;

    let mut content_types = Vec::new();
    while !body.is_empty() {
        let field = take_u32(&mut body).ok_or(FrameError::MalformedControl("truncated field"))?;
        let len = take_u32(&mut body).ok_or(FrameError::MalformedControl("truncated field"))?
            as usize;
        if len > body.len() {
            return Err(FrameError::MalformedControl("field overruns frame"));
        }
        let (value, rest) = body.split_at(len);
        if field == FIELD_CONTENT_TYPE {
            content_types.push(Bytes::copy_from_slice(value));
        }
        body = rest;
    }

    Ok(ControlFrame {
        kind,
        content_types,
    })
}

fn take_u32(buf: &mut &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    let (head, rest) = buf.split_at(4);
    *buf = rest;
    Some(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

/// Read the next frame. Returns `None` on a clean end of stream between
/// frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    // End of stream is only clean before the first byte of a length prefix.
    let mut len_buf = [0u8; 4];
    match reader.read_u8().await {
        Ok(first) => len_buf[0] = first,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut len_buf[1..]).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > 0 {
        if len > max_frame_size {
            return Err(FrameError::FrameTooLarge {
                len,
                max: max_frame_size,
            });
        }
        let mut payload = BytesMut::zeroed(len);
        reader.read_exact(&mut payload).await?;
        return Ok(Some(Frame::Data(payload.freeze())));
    }

    let control_len = reader.read_u32().await? as usize;
    if control_len > MAX_CONTROL_FRAME_SIZE {
        return Err(FrameError::ControlFrameTooLarge(control_len));
    }
    let mut body = vec![0u8; control_len];
    reader.read_exact(&mut body).await?;
    parse_control(&body).map(|control| Some(Frame::Control(control)))
}

async fn write_control<W>(writer: &mut W, kind: ControlKind) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&control_frame(kind, Some(CONTENT_TYPE)))
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Run the receiver side of one Frame Streams connection, forwarding data
/// frames to `records`.
///
/// Returns when the sender stops, the stream ends, `shutdown` fires or the
/// record queue is gone.
pub async fn handle_connection<S>(
    stream: S,
    records: mpsc::UnboundedSender<Bytes>,
    max_frame_size: usize,
    shutdown: CancellationToken,
) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut bidirectional = false;
    let mut started = false;

    loop {
        let frame = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("closing frame stream connection on shutdown");
                return Ok(());
            }

            frame = read_frame(&mut stream, max_frame_size) => frame?,
        };

        let Some(frame) = frame else {
            if started {
                debug!("frame stream ended without STOP");
            }
            return Ok(());
        };

        match frame {
            Frame::Data(payload) => {
                if !started {
                    return Err(FrameError::DataBeforeStart);
                }
                metrics::record_frame();
                if records.send(payload).is_err() {
                    debug!("record queue closed; dropping connection");
                    return Ok(());
                }
            }
            Frame::Control(control) => match (control.kind, started) {
                (ControlKind::Ready, false) if !bidirectional => {
                    if !control.offers_dnstap() {
                        return Err(FrameError::ContentTypeMismatch);
                    }
                    write_control(&mut stream, ControlKind::Accept).await?;
                    bidirectional = true;
                    trace!("accepted frame stream negotiation");
                }
                (ControlKind::Start, false) => {
                    if !control.offers_dnstap() {
                        return Err(FrameError::ContentTypeMismatch);
                    }
                    started = true;
                    trace!(bidirectional, "frame stream started");
                }
                (ControlKind::Stop, true) => {
                    if bidirectional {
                        write_control(&mut stream, ControlKind::Finish).await?;
                    }
                    trace!("frame stream stopped");
                    return Ok(());
                }
                (kind, started) => {
                    return Err(FrameError::UnexpectedControl {
                        got: kind.as_str(),
                        state: if started { "streaming" } else { "handshaking" },
                    });
                }
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    records: mpsc::UnboundedSender<Bytes>,
    max_frame_size: usize,
    shutdown: CancellationToken,
) {
    metrics::record_connection(ConnectionEvent::Opened);
    debug!(%peer, "frame stream connection opened");

    match handle_connection(stream, records, max_frame_size, shutdown).await {
        Ok(()) => {
            metrics::record_connection(ConnectionEvent::Closed);
            debug!(%peer, "frame stream connection closed");
        }
        Err(e) => {
            metrics::record_connection(ConnectionEvent::Error);
            warn!(%peer, error = %e, "frame stream connection dropped");
        }
    }
}

/// TCP listener accepting dnstap senders.
#[derive(Debug)]
pub struct FrameSource {
    listener: TcpListener,
    max_frame_size: usize,
}

impl FrameSource {
    /// Bind the listener.
    pub async fn bind(addr: SocketAddr, max_frame_size: usize) -> Result<Self, CollectorError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CollectorError::Bind { addr, source })?;
        info!(addr = %listener.local_addr()?, "dnstap listener bound");

        Ok(Self {
            listener,
            max_frame_size,
        })
    }

    /// Address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then close the listener
    /// and wait for every connection task to finish.
    pub async fn run(self, records: mpsc::UnboundedSender<Bytes>, shutdown: CancellationToken) {
        let Self {
            listener,
            max_frame_size,
        } = self;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("frame source received shutdown signal");
                    break;
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "frame stream connection task failed");
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            connections.spawn(serve_connection(
                                stream,
                                peer,
                                records.clone(),
                                max_frame_size,
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept frame stream connection");
                            pause_after_accept_error(&shutdown).await;
                        }
                    }
                }
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        info!("frame source stopped");
    }
}

/// Back off after a failed accept so that a persistent error such as
/// descriptor exhaustion does not spin the loop. Returns early on shutdown.
async fn pause_after_accept_error(shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
    }
}
