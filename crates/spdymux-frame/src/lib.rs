//! Wire types for the spdymux session multiplexer.
//!
//! Framing follows HTTP/2 <https://httpwg.org/specs/rfc9113.html>: a 9-byte
//! frame header (length, type, flags, stream id) followed by a type-specific
//! payload.

use std::{fmt, io::Write, ops::RangeInclusive};

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;

pub use enumflags2;
use enumflags2::{bitflags, BitFlags};

pub use nom;

use nom::{
    combinator::map,
    number::streaming::{be_u24, be_u32, be_u8},
    sequence::tuple,
    IResult,
};

/// Sent by clients before anything else on a fresh connection.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of the fixed frame header, in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

/// See https://httpwg.org/specs/rfc9113.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RawFrameType {
    Data = 0x00,
    Headers = 0x01,
    Priority = 0x02,
    RstStream = 0x03,
    Settings = 0x04,
    PushPromise = 0x05,
    Ping = 0x06,
    GoAway = 0x07,
    WindowUpdate = 0x08,
    Continuation = 0x09,
}

impl RawFrameType {
    pub fn repr(self) -> u8 {
        self as u8
    }

    pub fn from_repr(ty: u8) -> Option<Self> {
        Some(match ty {
            0x00 => Self::Data,
            0x01 => Self::Headers,
            0x02 => Self::Priority,
            0x03 => Self::RstStream,
            0x04 => Self::Settings,
            0x05 => Self::PushPromise,
            0x06 => Self::Ping,
            0x07 => Self::GoAway,
            0x08 => Self::WindowUpdate,
            0x09 => Self::Continuation,
            _ => return None,
        })
    }
}

/// Typed flags for various frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data(BitFlags<DataFlags>),
    Headers(BitFlags<HeadersFlags>),
    Priority,
    RstStream,
    Settings(BitFlags<SettingsFlags>),
    PushPromise(BitFlags<PushPromiseFlags>),
    Ping(BitFlags<PingFlags>),
    GoAway,
    WindowUpdate,
    Continuation(BitFlags<ContinuationFlags>),
    Unknown(EncodedFrameType),
}

impl FrameType {
    /// Turn this [FrameType] into a [Frame]
    pub fn into_frame(self, stream_id: StreamId) -> Frame {
        Frame::new(self, stream_id)
    }

    /// Short name used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data(_) => "Data",
            FrameType::Headers(_) => "Headers",
            FrameType::Priority => "Priority",
            FrameType::RstStream => "RstStream",
            FrameType::Settings(_) => "Settings",
            FrameType::PushPromise(_) => "PushPromise",
            FrameType::Ping(_) => "Ping",
            FrameType::GoAway => "GoAway",
            FrameType::WindowUpdate => "WindowUpdate",
            FrameType::Continuation(_) => "Continuation",
            FrameType::Unknown(_) => "Unknown",
        }
    }
}

/// See https://httpwg.org/specs/rfc9113.html#DATA
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataFlags {
    Padded = 0x08,
    EndStream = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#HEADERS
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeadersFlags {
    Priority = 0x20,
    Padded = 0x08,
    EndHeaders = 0x04,
    EndStream = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#SETTINGS
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SettingsFlags {
    Ack = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#PUSH_PROMISE
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PushPromiseFlags {
    Padded = 0x08,
    EndHeaders = 0x04,
}

/// See https://httpwg.org/specs/rfc9113.html#PING
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PingFlags {
    Ack = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#CONTINUATION
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContinuationFlags {
    EndHeaders = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedFrameType {
    pub ty: u8,
    pub flags: u8,
}

impl EncodedFrameType {
    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (ty, flags)) = tuple((be_u8, be_u8))(i)?;
        Ok((i, Self { ty, flags }))
    }
}

impl From<(RawFrameType, u8)> for EncodedFrameType {
    fn from((ty, flags): (RawFrameType, u8)) -> Self {
        Self {
            ty: ty.repr(),
            flags,
        }
    }
}

impl FrameType {
    pub fn encode(self) -> EncodedFrameType {
        match self {
            FrameType::Data(f) => (RawFrameType::Data, f.bits()).into(),
            FrameType::Headers(f) => (RawFrameType::Headers, f.bits()).into(),
            FrameType::Priority => (RawFrameType::Priority, 0).into(),
            FrameType::RstStream => (RawFrameType::RstStream, 0).into(),
            FrameType::Settings(f) => (RawFrameType::Settings, f.bits()).into(),
            FrameType::PushPromise(f) => (RawFrameType::PushPromise, f.bits()).into(),
            FrameType::Ping(f) => (RawFrameType::Ping, f.bits()).into(),
            FrameType::GoAway => (RawFrameType::GoAway, 0).into(),
            FrameType::WindowUpdate => (RawFrameType::WindowUpdate, 0).into(),
            FrameType::Continuation(f) => (RawFrameType::Continuation, f.bits()).into(),
            FrameType::Unknown(ft) => ft,
        }
    }

    pub fn decode(ft: EncodedFrameType) -> Self {
        match RawFrameType::from_repr(ft.ty) {
            Some(ty) => match ty {
                RawFrameType::Data => FrameType::Data(BitFlags::from_bits_truncate(ft.flags)),
                RawFrameType::Headers => {
                    FrameType::Headers(BitFlags::from_bits_truncate(ft.flags))
                }
                RawFrameType::Priority => FrameType::Priority,
                RawFrameType::RstStream => FrameType::RstStream,
                RawFrameType::Settings => {
                    FrameType::Settings(BitFlags::from_bits_truncate(ft.flags))
                }
                RawFrameType::PushPromise => {
                    FrameType::PushPromise(BitFlags::from_bits_truncate(ft.flags))
                }
                RawFrameType::Ping => FrameType::Ping(BitFlags::from_bits_truncate(ft.flags)),
                RawFrameType::GoAway => FrameType::GoAway,
                RawFrameType::WindowUpdate => FrameType::WindowUpdate,
                RawFrameType::Continuation => {
                    FrameType::Continuation(BitFlags::from_bits_truncate(ft.flags))
                }
            },
            None => FrameType::Unknown(ft),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Stream ID used for connection control frames
    pub const CONNECTION: Self = Self(0);

    /// Largest stream id representable on the wire (2^31-1)
    pub const MAX: Self = Self(0x7FFF_FFFF);

    /// Server-initiated streams have even IDs
    pub fn is_server_initiated(&self) -> bool {
        self.0 != 0 && self.0 % 2 == 0
    }

    /// Client-initiated streams have odd IDs
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid stream id: {0}")]
pub struct StreamIdOutOfRange(u32);

impl TryFrom<u32> for StreamId {
    type Error = StreamIdOutOfRange;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value & 0x8000_0000 != 0 {
            Err(StreamIdOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// See https://httpwg.org/specs/rfc9113.html#FrameHeader
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub reserved: u8,
    pub stream_id: StreamId,
    pub len: u32,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stream_id.0 == 0 {
            write!(f, "Conn:")?;
        } else {
            write!(f, "#{}:", self.stream_id.0)?;
        }

        if let FrameType::Unknown(EncodedFrameType { ty, flags }) = &self.frame_type {
            return write!(f, "UnknownFrame({:#x}, {:#x}, len={})", ty, flags, self.len);
        }
        let mut s = f.debug_struct(self.frame_type.name());

        if self.reserved != 0 {
            s.field("reserved", &self.reserved);
        }
        if self.len > 0 {
            s.field("len", &self.len);
        }

        struct DisplayDebug<'a, D: fmt::Display>(&'a D);
        impl<'a, D: fmt::Display> fmt::Debug for DisplayDebug<'a, D> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self.0, f)
            }
        }

        match &self.frame_type {
            FrameType::Data(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::Headers(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::Settings(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::PushPromise(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::Ping(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::Continuation(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            _ => {
                // no flags worth showing
            }
        }

        s.finish()
    }
}

impl Frame {
    /// Create a new frame with the given type and stream ID.
    pub fn new(frame_type: FrameType, stream_id: StreamId) -> Self {
        Self {
            frame_type,
            reserved: 0,
            stream_id,
            len: 0,
        }
    }

    /// Set the frame's length.
    pub fn with_len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    /// Parse a frame header from the given slice
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (len, frame_type, (reserved, stream_id))) = tuple((
            be_u24,
            EncodedFrameType::parse,
            parse_reserved_and_stream_id,
        ))(i)?;

        let frame = Frame {
            frame_type: FrameType::decode(frame_type),
            reserved,
            stream_id,
            len,
        };
        Ok((i, frame))
    }

    pub fn write_into(self, mut w: impl Write) -> std::io::Result<()> {
        w.write_u24::<BigEndian>(self.len)?;
        let ft = self.frame_type.encode();
        w.write_u8(ft.ty)?;
        w.write_u8(ft.flags)?;
        w.write_all(&pack_reserved_and_stream_id(self.reserved, self.stream_id))?;

        Ok(())
    }

    /// Returns true if this frame is an ack
    pub fn is_ack(&self) -> bool {
        match self.frame_type {
            FrameType::Settings(flags) => flags.contains(SettingsFlags::Ack),
            FrameType::Ping(flags) => flags.contains(PingFlags::Ack),
            _ => false,
        }
    }

    /// Returns true if this frame has `EndHeaders` set
    pub fn is_end_headers(&self) -> bool {
        match self.frame_type {
            FrameType::Headers(flags) => flags.contains(HeadersFlags::EndHeaders),
            FrameType::PushPromise(flags) => flags.contains(PushPromiseFlags::EndHeaders),
            FrameType::Continuation(flags) => flags.contains(ContinuationFlags::EndHeaders),
            _ => false,
        }
    }

    /// Returns true if this frame has `EndStream` set
    pub fn is_end_stream(&self) -> bool {
        match self.frame_type {
            FrameType::Data(flags) => flags.contains(DataFlags::EndStream),
            FrameType::Headers(flags) => flags.contains(HeadersFlags::EndStream),
            _ => false,
        }
    }

    /// Returns true if the payload starts with a pad length octet
    pub fn is_padded(&self) -> bool {
        match self.frame_type {
            FrameType::Data(flags) => flags.contains(DataFlags::Padded),
            FrameType::Headers(flags) => flags.contains(HeadersFlags::Padded),
            FrameType::PushPromise(flags) => flags.contains(PushPromiseFlags::Padded),
            _ => false,
        }
    }
}

/// See https://httpwg.org/specs/rfc9113.html#FrameHeader - the first bit
/// is reserved, and the rest is a 31-bit stream id
pub fn parse_bit_and_u31(i: &[u8]) -> IResult<&[u8], (u8, u32)> {
    let (i, x) = be_u32(i)?;

    let bit = (x >> 31) as u8;
    let val = x & 0x7FFF_FFFF;

    Ok((i, (bit, val)))
}

fn parse_reserved_and_stream_id(i: &[u8]) -> IResult<&[u8], (u8, StreamId)> {
    parse_bit_and_u31(i).map(|(i, (reserved, stream_id))| (i, (reserved, StreamId(stream_id))))
}

/// Pack a bit and a u31 into a 4-byte array (big-endian)
pub fn pack_bit_and_u31(bit: u8, val: u32) -> [u8; 4] {
    assert_eq!(val & 0x7FFF_FFFF, val, "val is too large: {val:x}");
    assert_eq!(bit & 0x1, bit, "bit should be 0 or 1: {bit:x}");

    let mut bytes = val.to_be_bytes();
    if bit != 0 {
        bytes[0] |= 0x80;
    }

    bytes
}

pub fn pack_reserved_and_stream_id(reserved: u8, stream_id: StreamId) -> [u8; 4] {
    pack_bit_and_u31(reserved, stream_id.0)
}

// cf. https://httpwg.org/specs/rfc9113.html#HEADERS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub exclusive: bool,
    pub stream_dependency: StreamId,
    // 0-255 => 1-256
    pub weight: u8,
}

impl PrioritySpec {
    pub const LEN: usize = 5;

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        map(
            tuple((parse_reserved_and_stream_id, be_u8)),
            |((exclusive, stream_dependency), weight)| Self {
                exclusive: exclusive != 0,
                stream_dependency,
                weight,
            },
        )(i)
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&pack_reserved_and_stream_id(
            self.exclusive as u8,
            self.stream_dependency,
        ))?;
        w.write_u8(self.weight)?;
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Returns the underlying u32
    pub fn as_repr(self) -> u32 {
        self.0
    }

    /// Returns the known error code, if any
    pub fn known(self) -> Option<KnownErrorCode> {
        KnownErrorCode::from_repr(self.0)
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match KnownErrorCode::from_repr(self.0) {
            Some(e) => fmt::Debug::fmt(&e, f),
            None => write!(f, "ErrorCode(0x{:02x})", self.0),
        }
    }
}

impl From<KnownErrorCode> for ErrorCode {
    fn from(e: KnownErrorCode) -> Self {
        Self(e as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KnownErrorCode {
    /// Graceful shutdown, or a stream that is simply no longer wanted
    NoError = 0x00,
    ProtocolError = 0x01,
    InternalError = 0x02,
    /// A window was overrun
    FlowControlError = 0x03,
    SettingsTimeout = 0x04,
    /// Frame for a stream that was already half-closed
    StreamClosed = 0x05,
    FrameSizeError = 0x06,
    /// Refused before any processing; safe to retry elsewhere
    RefusedStream = 0x07,
    Cancel = 0x08,
    /// HPACK state is out of sync, the session cannot continue
    CompressionError = 0x09,
    ConnectError = 0x0a,
    EnhanceYourCalm = 0x0b,
    InadequateSecurity = 0x0c,
    Http1_1Required = 0x0d,
}

impl KnownErrorCode {
    pub fn repr(self) -> u32 {
        self as u32
    }

    pub fn from_repr(code: u32) -> Option<Self> {
        use KnownErrorCode::*;
        Some(match code {
            0x00 => NoError,
            0x01 => ProtocolError,
            0x02 => InternalError,
            0x03 => FlowControlError,
            0x04 => SettingsTimeout,
            0x05 => StreamClosed,
            0x06 => FrameSizeError,
            0x07 => RefusedStream,
            0x08 => Cancel,
            0x09 => CompressionError,
            0x0a => ConnectError,
            0x0b => EnhanceYourCalm,
            0x0c => InadequateSecurity,
            0x0d => Http1_1Required,
            _ => return None,
        })
    }
}

impl TryFrom<ErrorCode> for KnownErrorCode {
    type Error = ();

    fn try_from(e: ErrorCode) -> Result<Self, Self::Error> {
        KnownErrorCode::from_repr(e.0).ok_or(())
    }
}

/// cf. https://httpwg.org/specs/rfc9113.html#SettingValues
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Maximum size of the compression table used to decode field blocks, in
    /// octets. The initial value is 4,096 octets.
    pub header_table_size: u32,

    /// Whether the sender is willing to receive PUSH_PROMISE frames. Only a
    /// client may set this to 1.
    pub enable_push: bool,

    /// Maximum number of concurrent streams that the sender will allow the
    /// receiver to create. Initially unlimited.
    pub max_concurrent_streams: Option<u32>,

    /// The sender's initial window size for stream-level flow control. The
    /// initial value is 2^16-1 (65,535) octets. Values above 2^31-1 are a
    /// FLOW_CONTROL_ERROR.
    pub initial_window_size: u32,

    /// Largest frame payload the sender is willing to receive. Must be
    /// between 2^14 and 2^24-1 inclusive.
    pub max_frame_size: u32,

    /// Advisory maximum field section size the sender is prepared to accept.
    pub max_header_list_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        // cf. https://httpwg.org/specs/rfc9113.html#SettingValues
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: Self::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: Self::DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl Settings {
    pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = (1 << 16) - 1;
    pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1 << 14;
    pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;
    pub const MAX_FRAME_SIZE_ALLOWED_RANGE: RangeInclusive<u32> = (1 << 14)..=((1 << 24) - 1);

    /// Validates and stores one setting.
    pub fn apply(&mut self, code: Setting, value: u32) -> Result<(), SettingsError> {
        match code {
            Setting::HeaderTableSize => {
                self.header_table_size = value;
            }
            Setting::EnablePush => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return Err(SettingsError::InvalidEnablePushValue { actual: value }),
            },
            Setting::MaxConcurrentStreams => {
                self.max_concurrent_streams = Some(value);
            }
            Setting::InitialWindowSize => {
                if value > Self::MAX_INITIAL_WINDOW_SIZE {
                    return Err(SettingsError::InitialWindowSizeTooLarge { actual: value });
                }
                self.initial_window_size = value;
            }
            Setting::MaxFrameSize => {
                if !Self::MAX_FRAME_SIZE_ALLOWED_RANGE.contains(&value) {
                    return Err(SettingsError::SettingsMaxFrameSizeInvalid { actual: value });
                }
                self.max_frame_size = value;
            }
            Setting::MaxHeaderListSize => {
                self.max_header_list_size = value;
            }
        }

        Ok(())
    }

    /// Walks a SETTINGS payload, handing each known identifier to `callback`.
    /// Unknown identifiers are skipped.
    pub fn parse<E>(
        buf: &[u8],
        mut callback: impl FnMut(Setting, u32) -> Result<(), E>,
    ) -> Result<(), E> {
        debug_assert!(
            buf.len() % 6 == 0,
            "buffer length must be a multiple of 6 bytes"
        );

        for chunk in buf.chunks_exact(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            match Setting::from_repr(id) {
                None => {
                    tracing::trace!(%id, %value, "ignoring unknown setting");
                }
                Some(id) => {
                    callback(id, value)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    #[error("ENABLE_PUSH must be 0 or 1, peer sent {actual}")]
    InvalidEnablePushValue { actual: u32 },

    #[error("INITIAL_WINDOW_SIZE {actual} is above 2^31-1")]
    InitialWindowSizeTooLarge { actual: u32 },

    #[error("MAX_FRAME_SIZE {actual} is outside 2^14..=2^24-1")]
    SettingsMaxFrameSizeInvalid { actual: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Setting {
    HeaderTableSize = 0x01,
    EnablePush = 0x02,
    MaxConcurrentStreams = 0x03,
    InitialWindowSize = 0x04,
    MaxFrameSize = 0x05,
    MaxHeaderListSize = 0x06,
}

impl Setting {
    pub fn repr(self) -> u16 {
        self as u16
    }

    pub fn from_repr(id: u16) -> Option<Self> {
        Some(match id {
            0x01 => Self::HeaderTableSize,
            0x02 => Self::EnablePush,
            0x03 => Self::MaxConcurrentStreams,
            0x04 => Self::InitialWindowSize,
            0x05 => Self::MaxFrameSize,
            0x06 => Self::MaxHeaderListSize,
            _ => return None,
        })
    }
}

pub struct SettingPairs<'a>(pub &'a [(Setting, u32)]);

impl<'a> From<&'a [(Setting, u32)]> for SettingPairs<'a> {
    fn from(value: &'a [(Setting, u32)]) -> Self {
        Self(value)
    }
}

impl SettingPairs<'_> {
    pub fn len(&self) -> usize {
        self.0.len() * 6
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        for (id, value) in self.0.iter() {
            w.write_u16::<BigEndian>(id.repr())?;
            w.write_u32::<BigEndian>(*value)?;
        }
        Ok(())
    }
}

/// Payload for a GOAWAY frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub additional_debug_data: Bytes,
}

impl GoAway {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, ((_, last_stream_id), error_code)) = tuple((parse_bit_and_u31, be_u32))(i)?;

        Ok((
            &rest[rest.len()..],
            Self {
                last_stream_id: StreamId(last_stream_id),
                error_code: ErrorCode(error_code),
                additional_debug_data: Bytes::copy_from_slice(rest),
            },
        ))
    }

    pub fn len(&self) -> usize {
        8 + self.additional_debug_data.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&pack_bit_and_u31(0, self.last_stream_id.0))?;
        w.write_u32::<BigEndian>(self.error_code.0)?;
        w.write_all(&self.additional_debug_data[..])?;
        Ok(())
    }
}

/// Payload for a RST_STREAM frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStream {
    pub error_code: ErrorCode,
}

impl RstStream {
    pub const LEN: usize = 4;

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, error_code) = be_u32(i)?;
        Ok((
            rest,
            Self {
                error_code: ErrorCode(error_code),
            },
        ))
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_u32::<BigEndian>(self.error_code.0)
    }
}

/// Payload for a WINDOW_UPDATE frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub reserved: u8,
    pub increment: u32,
}

impl WindowUpdate {
    pub const LEN: usize = 4;

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, (reserved, increment)) = parse_bit_and_u31(i)?;
        Ok((
            rest,
            Self {
                reserved,
                increment,
            },
        ))
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&pack_bit_and_u31(self.reserved, self.increment))
    }
}

/// Payload for a PING frame: eight opaque octets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub opaque_data: [u8; 8],
}

impl Ping {
    pub const LEN: usize = 8;

    pub fn from_id(id: u64) -> Self {
        Self {
            opaque_data: id.to_be_bytes(),
        }
    }

    pub fn id(&self) -> u64 {
        u64::from_be_bytes(self.opaque_data)
    }

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, data) = nom::bytes::streaming::take(Self::LEN)(i)?;
        let mut opaque_data = [0u8; 8];
        opaque_data.copy_from_slice(data);
        Ok((rest, Self { opaque_data }))
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&self.opaque_data)
    }
}

/// Fixed part of a PUSH_PROMISE payload, the header block fragment follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushPromise {
    pub promised_stream_id: StreamId,
}

impl PushPromise {
    pub const LEN: usize = 4;

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, (_, promised_stream_id)) = parse_reserved_and_stream_id(i)?;
        Ok((rest, Self { promised_stream_id }))
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&pack_reserved_and_stream_id(0, self.promised_stream_id))
    }
}
