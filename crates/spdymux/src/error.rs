use std::io;

use spdymux_frame::{ErrorCode, KnownErrorCode, SettingsError, StreamId};

use crate::codec::FramingError;

/// Terminal status seen by streams, stream requests and pool callers.
///
/// Variants are distinct enough for an HTTP layer to decide whether a request
/// can be retried transparently on a fresh connection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpdyError {
    /// The peer closed the connection, or the session was closed cleanly
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport was reset
    #[error("connection reset")]
    ConnectionReset,

    /// Some other transport failure
    #[error("transport error: {0:?}")]
    Transport(io::ErrorKind),

    /// The session went away before this stream or request was processed
    #[error("aborted: session is going away")]
    Aborted,

    /// Cancelled locally
    #[error("cancelled")]
    Cancelled,

    /// The network configuration changed under the session
    #[error("network changed")]
    NetworkChanged,

    /// The session or stream is already closed
    #[error("not connected")]
    NotConnected,

    #[error("protocol error")]
    ProtocolError,

    #[error("flow control error")]
    FlowControlError,

    #[error("header compression error")]
    CompressionError,

    #[error("frame size error")]
    FrameSizeError,

    /// The peer answered with RST_STREAM(REFUSED_STREAM)
    #[error("stream refused by server")]
    ServerRefusedStream,

    /// The peer reset the stream with some other code
    #[error("stream reset by peer: {code:?}")]
    StreamReset { code: ErrorCode },

    /// The peer did not answer a keepalive ping in time
    #[error("ping failed")]
    PingFailed,

    /// Stream creation was attempted on a session that is going away
    #[error("failed: session is not accepting new streams")]
    Failed,
}

impl SpdyError {
    pub(crate) fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => SpdyError::ConnectionClosed,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                SpdyError::ConnectionReset
            }
            io::ErrorKind::NotConnected => SpdyError::NotConnected,
            kind => SpdyError::Transport(kind),
        }
    }

    /// GOAWAY code to send when draining with this status, `None` when the
    /// peer is gone or the close is local bookkeeping.
    pub(crate) fn goaway_code(&self) -> Option<KnownErrorCode> {
        match self {
            SpdyError::ConnectionClosed
            | SpdyError::ConnectionReset
            | SpdyError::Transport(_)
            | SpdyError::Aborted
            | SpdyError::NetworkChanged
            | SpdyError::NotConnected => None,
            SpdyError::FlowControlError => Some(KnownErrorCode::FlowControlError),
            SpdyError::CompressionError => Some(KnownErrorCode::CompressionError),
            SpdyError::FrameSizeError => Some(KnownErrorCode::FrameSizeError),
            SpdyError::Cancelled => Some(KnownErrorCode::Cancel),
            _ => Some(KnownErrorCode::ProtocolError),
        }
    }

    /// Whether a request that failed with this status never reached the
    /// peer's application and may be replayed on another session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpdyError::Aborted
                | SpdyError::ServerRefusedStream
                | SpdyError::NetworkChanged
                | SpdyError::ConnectionClosed
                | SpdyError::ConnectionReset
        )
    }
}

/// Failures fatal to a whole session.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("error encoding frame: {0}")]
    Encode(io::Error),

    #[error("received {frame_type} for stream {stream_id}, which was never opened")]
    FrameForUnopenedStream {
        frame_type: &'static str,
        stream_id: StreamId,
    },

    #[error("received {len} bytes of data but the session receive window only has {window}")]
    SessionWindowUnderflow { len: u32, window: i32 },

    #[error("session window update of {increment} made the send window overflow")]
    SessionWindowOverflow { increment: u32 },

    #[error("zero increment in session window update")]
    SessionWindowUpdateZeroIncrement,

    #[error("initial window size change overflowed the send window of stream {stream_id}")]
    StreamWindowOverflowDueToSettings { stream_id: StreamId },

    #[error("bad setting value: {0}")]
    BadSettingValue(#[from] SettingsError),

    #[error("received ping ack with no ping in flight")]
    UnexpectedPingAck,

    #[error("no activity from peer within the hung interval after a ping")]
    PingTimeout,

    #[error("received PUSH_PROMISE but push is disabled")]
    PushDisabled,

    #[error("PUSH_PROMISE for stream {promised_stream_id} is not a valid server stream id (last was {last_push_id})")]
    InvalidPromisedStreamId {
        promised_stream_id: StreamId,
        last_push_id: StreamId,
    },

    #[error("received HEADERS for server stream {stream_id} which was never promised")]
    HeadersForUnpromisedStream { stream_id: StreamId },
}

impl SessionError {
    /// Code carried by the GOAWAY sent for this error
    pub(crate) fn as_known_error_code(&self) -> KnownErrorCode {
        self.status()
            .goaway_code()
            .unwrap_or(KnownErrorCode::ProtocolError)
    }

    /// Status reported to every stream closed because of this error
    pub(crate) fn status(&self) -> SpdyError {
        match self {
            SessionError::Framing(e) => e.status(),
            SessionError::SessionWindowUnderflow { .. }
            | SessionError::SessionWindowOverflow { .. }
            | SessionError::StreamWindowOverflowDueToSettings { .. }
            | SessionError::BadSettingValue(SettingsError::InitialWindowSizeTooLarge { .. }) => {
                SpdyError::FlowControlError
            }
            SessionError::PingTimeout => SpdyError::PingFailed,
            _ => SpdyError::ProtocolError,
        }
    }
}

/// Violations that only take down the offending stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StreamProtocolError {
    #[error("header name {name:?} contains uppercase characters")]
    UppercaseHeaderName { name: String },

    #[error("duplicate pseudo-header {name:?}")]
    DuplicatePseudoHeader { name: String },

    #[error("pseudo-header {name:?} appears after regular headers")]
    PseudoHeaderAfterRegular { name: String },

    #[error("header block of {size} bytes exceeds the {limit} byte limit")]
    HeaderBlockTooLarge { size: usize, limit: usize },

    #[error("response headers have no :status")]
    MissingStatus,

    #[error("received {frame_type} frame before response headers")]
    DataBeforeHeaders { frame_type: &'static str },

    #[error("received frames after the peer ended the stream")]
    FrameAfterEndStream,

    #[error("received {len} bytes with only {window} bytes of stream window")]
    WindowUnderflow { len: u32, window: i32 },

    #[error("stream window update made the send window overflow")]
    WindowUpdateOverflow,

    #[error("zero increment in stream window update")]
    WindowUpdateZeroIncrement,

    #[error("received {frame_type} frame with invalid size {len}")]
    InvalidFrameSize { frame_type: &'static str, len: u32 },

    #[error("pushed stream refused: session is going away")]
    PushWhileGoingAway,

    #[error("pushed stream refused: too many unclaimed pushed streams")]
    PushCapacity,

    #[error("pushed stream's associated stream {associated} is not open")]
    PushAssociatedStreamClosed { associated: StreamId },

    #[error("pushed stream has no valid url")]
    InvalidPushUrl,

    #[error("pushed url is not same-origin with the associated stream")]
    PushCrossOrigin,

    #[error("a pushed stream for this url is already unclaimed")]
    DuplicatePush,

    #[error("pushed stream expired before being claimed")]
    PushExpired,
}

impl StreamProtocolError {
    pub(crate) fn as_known_error_code(&self) -> KnownErrorCode {
        use KnownErrorCode as Code;
        use StreamProtocolError::*;

        match self {
            // flow control errors
            WindowUnderflow { .. } | WindowUpdateOverflow => Code::FlowControlError,
            // frame size errors
            InvalidFrameSize { .. } => Code::FrameSizeError,
            // stream closed errors
            PushAssociatedStreamClosed { .. } => Code::StreamClosed,
            // refused
            PushWhileGoingAway | PushCapacity | PushCrossOrigin | PushExpired => {
                Code::RefusedStream
            }
            _ => Code::ProtocolError,
        }
    }

    /// Status reported to the stream's consumer
    pub(crate) fn status(&self) -> SpdyError {
        match self.as_known_error_code() {
            KnownErrorCode::FlowControlError => SpdyError::FlowControlError,
            KnownErrorCode::FrameSizeError => SpdyError::FrameSizeError,
            KnownErrorCode::RefusedStream => SpdyError::Aborted,
            _ => SpdyError::ProtocolError,
        }
    }
}
