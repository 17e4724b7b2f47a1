//! Buffered framer: turns transport bytes into [FrameEvent]s and builds
//! serialized frames for the write path.

use std::io;

use bytes::{Bytes, BytesMut};
use loona_hpack::decoder::DecoderError;
use pretty_hex::PrettyHex;
use smallvec::{smallvec, SmallVec};
use spdymux_frame::{
    enumflags2::BitFlags, nom, ContinuationFlags, DataFlags, ErrorCode, Frame, FrameType, GoAway,
    HeadersFlags, Ping, PingFlags, PrioritySpec, PushPromise, PushPromiseFlags, RstStream,
    Setting, SettingPairs, Settings, SettingsFlags, StreamId, WindowUpdate, FRAME_HEADER_LEN,
};
use tracing::{debug, trace};

use crate::{
    error::{SpdyError, StreamProtocolError},
    headers::HeaderBlock,
    priority::RequestPriority,
};

/// Malformed input that leaves the framer unable to continue.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum FramingError {
    #[error("frame too large: {frame_type:?} frame of size {frame_size} exceeds max frame size of {max_frame_size}")]
    FrameTooLarge {
        frame_type: FrameType,
        frame_size: u32,
        max_frame_size: u32,
    },

    #[error("received {frame_type:?} frame with invalid length {len}")]
    InvalidLength { frame_type: FrameType, len: u32 },

    #[error("stream-specific frame {frame_type:?} sent to stream ID 0 (connection-wide)")]
    StreamSpecificFrameToConnection { frame_type: FrameType },

    #[error("connection-wide frame {frame_type:?} sent to stream {stream_id}")]
    ConnectionFrameToStream {
        frame_type: FrameType,
        stream_id: StreamId,
    },

    #[error("received {frame_type:?} with Padded flag but payload was shorter than padding")]
    PaddedFrameTooShort {
        frame_type: FrameType,
        padding_length: usize,
        frame_size: u32,
    },

    #[error("on stream {stream_id}, expected continuation frame, but got {frame_type:?}")]
    ExpectedContinuationFrame {
        stream_id: StreamId,
        frame_type: FrameType,
    },

    #[error("expected continuation for stream {stream_id}, but got continuation for stream {continuation_stream_id}")]
    ExpectedContinuationForStream {
        stream_id: StreamId,
        continuation_stream_id: StreamId,
    },

    #[error("on stream {stream_id}, received unexpected continuation frame")]
    UnexpectedContinuationFrame { stream_id: StreamId },

    #[error("header block on stream {stream_id} reached {size} bytes, past the {capacity} byte header buffer")]
    HeaderBufferExhausted {
        stream_id: StreamId,
        size: usize,
        capacity: usize,
    },

    #[error("hpack decoding error: {0:?}")]
    HpackDecodingError(#[from] DecoderError),
}

impl FramingError {
    pub(crate) fn status(&self) -> SpdyError {
        match self {
            FramingError::FrameTooLarge { .. } | FramingError::InvalidLength { .. } => {
                SpdyError::FrameSizeError
            }
            FramingError::HpackDecodingError(_) | FramingError::HeaderBufferExhausted { .. } => {
                SpdyError::CompressionError
            }
            _ => SpdyError::ProtocolError,
        }
    }
}

/// One fully-parsed unit of input. Header blocks are delivered once all of
/// their CONTINUATION frames have arrived.
#[derive(Debug)]
pub enum FrameEvent {
    Data {
        stream_id: StreamId,
        payload: Bytes,
        end_stream: bool,
        /// Length counted against flow control, padding included
        flow_controlled_len: u32,
    },
    Headers {
        stream_id: StreamId,
        priority: Option<PrioritySpec>,
        end_stream: bool,
        headers: HeaderBlock,
    },
    Priority {
        stream_id: StreamId,
        spec: PrioritySpec,
    },
    RstStream {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        values: SmallVec<[(Setting, u32); 6]>,
    },
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: HeaderBlock,
    },
    Ping {
        ack: bool,
        ping: Ping,
    },
    GoAway(GoAway),
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    /// A problem confined to one stream; the framer keeps going
    StreamError {
        stream_id: StreamId,
        error: StreamProtocolError,
    },
}

#[derive(Debug, Clone, Copy)]
enum BlockKind {
    Headers {
        priority: Option<PrioritySpec>,
        end_stream: bool,
    },
    PushPromise {
        promised_stream_id: StreamId,
    },
}

/// The header block currently being reassembled. Only one may be in
/// progress: the next frame on the wire must continue it.
struct HeaderAssembly {
    stream_id: StreamId,
    kind: BlockKind,
    fragments: SmallVec<[Bytes; 2]>,
    size: usize,
    overflowed: bool,
}

impl HeaderAssembly {
    /// Stream the error is reported on: the promised stream for pushes
    fn target_stream(&self) -> StreamId {
        match self.kind {
            BlockKind::Headers { .. } => self.stream_id,
            BlockKind::PushPromise { promised_stream_id } => promised_stream_id,
        }
    }
}

/// How far past `max_header_block_size` a block is still buffered so it can
/// be decoded and refused on its stream alone.
const HEADER_BUFFER_SLACK: usize = 4;

pub struct FrameCodec {
    inbuf: BytesMut,

    /// largest payload we accept (what we advertised)
    max_recv_frame_size: u32,
    /// largest payload the peer accepts
    max_send_frame_size: u32,

    /// blocks above this are refused on their stream
    max_header_block_size: usize,
    /// blocks above this can't be decoded at all, which loses HPACK state
    header_buffer_capacity: usize,
    assembly: Option<HeaderAssembly>,

    hpack_dec: loona_hpack::Decoder<'static>,
    hpack_enc: loona_hpack::Encoder<'static>,

    frames_received: u64,
}

impl FrameCodec {
    pub fn new(max_header_block_size: usize) -> Self {
        let mut hpack_dec = loona_hpack::Decoder::new();
        hpack_dec.set_max_allowed_table_size(Settings::default().header_table_size as usize);

        Self {
            inbuf: BytesMut::new(),
            max_recv_frame_size: Settings::DEFAULT_MAX_FRAME_SIZE,
            max_send_frame_size: Settings::DEFAULT_MAX_FRAME_SIZE,
            max_header_block_size,
            header_buffer_capacity: max_header_block_size.saturating_mul(HEADER_BUFFER_SLACK),
            assembly: None,
            hpack_dec,
            hpack_enc: loona_hpack::Encoder::new(),
            frames_received: 0,
        }
    }

    /// Frames parsed so far, for diagnostics
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn max_send_frame_size(&self) -> u32 {
        self.max_send_frame_size
    }

    pub fn set_max_send_frame_size(&mut self, size: u32) {
        self.max_send_frame_size = size;
    }

    /// Applies the peer's HEADER_TABLE_SIZE to our encoder
    pub fn set_encoder_table_size(&mut self, size: usize) {
        self.hpack_enc.set_max_table_size(size);
    }

    /// Bytes received but not yet turned into events
    pub fn buffered_len(&self) -> usize {
        self.inbuf.len()
    }

    pub fn is_assembling_headers(&self) -> bool {
        self.assembly.is_some()
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.inbuf.extend_from_slice(bytes);
    }

    /// Buffers `bytes` and parses everything that is complete.
    pub fn process_input(&mut self, bytes: &[u8]) -> Result<Vec<FrameEvent>, FramingError> {
        self.push_input(bytes);
        let mut events = vec![];
        while let Some(ev) = self.next_event()? {
            events.push(ev);
        }
        Ok(events)
    }

    /// Parses the next complete event out of the buffered input. Returns
    /// `Ok(None)` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<FrameEvent>, FramingError> {
        loop {
            let frame = match Frame::parse(&self.inbuf[..]) {
                Ok((_, frame)) => frame,
                Err(nom::Err::Incomplete(_)) => return Ok(None),
                Err(e) => {
                    // fixed-size header, streaming parsers only ever ask for more
                    debug!(?e, "frame header parse failed");
                    return Ok(None);
                }
            };

            if frame.len > self.max_recv_frame_size {
                trace!(
                    "oversized frame header:\n{:?}",
                    self.inbuf[..FRAME_HEADER_LEN].hex_dump()
                );
                return Err(FramingError::FrameTooLarge {
                    frame_type: frame.frame_type,
                    frame_size: frame.len,
                    max_frame_size: self.max_recv_frame_size,
                });
            }

            let total = FRAME_HEADER_LEN + frame.len as usize;
            if self.inbuf.len() < total {
                trace!(have = %self.inbuf.len(), need = %total, "waiting for frame payload");
                return Ok(None);
            }

            let mut raw = self.inbuf.split_to(total).freeze();
            let payload = raw.split_off(FRAME_HEADER_LEN);
            self.frames_received += 1;
            debug!(?frame, "<");

            if let Some(ev) = self.on_frame(frame, payload)? {
                return Ok(Some(ev));
            }
        }
    }

    fn on_frame(
        &mut self,
        frame: Frame,
        payload: Bytes,
    ) -> Result<Option<FrameEvent>, FramingError> {
        if let Some(assembly) = &self.assembly {
            match frame.frame_type {
                FrameType::Continuation(_) if frame.stream_id == assembly.stream_id => {}
                FrameType::Continuation(_) => {
                    return Err(FramingError::ExpectedContinuationForStream {
                        stream_id: assembly.stream_id,
                        continuation_stream_id: frame.stream_id,
                    })
                }
                frame_type => {
                    return Err(FramingError::ExpectedContinuationFrame {
                        stream_id: assembly.stream_id,
                        frame_type,
                    })
                }
            }
        }

        let frame_type = frame.frame_type;
        let needs_stream = matches!(
            frame_type,
            FrameType::Data(_)
                | FrameType::Headers(_)
                | FrameType::Priority
                | FrameType::RstStream
                | FrameType::PushPromise(_)
                | FrameType::Continuation(_)
        );
        let needs_connection = matches!(
            frame_type,
            FrameType::Settings(_) | FrameType::Ping(_) | FrameType::GoAway
        );
        if needs_stream && frame.stream_id == StreamId::CONNECTION {
            return Err(FramingError::StreamSpecificFrameToConnection { frame_type });
        }
        if needs_connection && frame.stream_id != StreamId::CONNECTION {
            return Err(FramingError::ConnectionFrameToStream {
                frame_type,
                stream_id: frame.stream_id,
            });
        }

        let invalid_length = || FramingError::InvalidLength {
            frame_type,
            len: frame.len,
        };

        let ev = match frame_type {
            FrameType::Data(flags) => {
                let payload = Self::strip_padding(&frame, payload)?;
                Some(FrameEvent::Data {
                    stream_id: frame.stream_id,
                    payload,
                    end_stream: flags.contains(DataFlags::EndStream),
                    flow_controlled_len: frame.len,
                })
            }
            FrameType::Headers(flags) => {
                let mut payload = Self::strip_padding(&frame, payload)?;
                let mut priority = None;
                if flags.contains(HeadersFlags::Priority) {
                    if payload.len() < PrioritySpec::LEN {
                        return Err(invalid_length());
                    }
                    let (_, spec) =
                        PrioritySpec::parse(&payload[..]).map_err(|_| invalid_length())?;
                    priority = Some(spec);
                    payload = payload.split_off(PrioritySpec::LEN);
                }

                self.begin_block(
                    frame.stream_id,
                    BlockKind::Headers {
                        priority,
                        end_stream: flags.contains(HeadersFlags::EndStream),
                    },
                    payload,
                )?;
                if flags.contains(HeadersFlags::EndHeaders) {
                    self.finish_block()?
                } else {
                    None
                }
            }
            FrameType::Priority => match PrioritySpec::parse(&payload[..]) {
                Ok((_, spec)) if payload.len() == PrioritySpec::LEN => Some(FrameEvent::Priority {
                    stream_id: frame.stream_id,
                    spec,
                }),
                _ => Some(FrameEvent::StreamError {
                    stream_id: frame.stream_id,
                    error: StreamProtocolError::InvalidFrameSize {
                        frame_type: "PRIORITY",
                        len: frame.len,
                    },
                }),
            },
            FrameType::RstStream => {
                if payload.len() != RstStream::LEN {
                    return Err(invalid_length());
                }
                let (_, rst) = RstStream::parse(&payload[..]).map_err(|_| invalid_length())?;
                Some(FrameEvent::RstStream {
                    stream_id: frame.stream_id,
                    error_code: rst.error_code,
                })
            }
            FrameType::Settings(flags) => {
                let ack = flags.contains(SettingsFlags::Ack);
                if payload.len() % 6 != 0 || (ack && !payload.is_empty()) {
                    return Err(invalid_length());
                }
                let mut values = SmallVec::new();
                Settings::parse::<()>(&payload[..], |code, value| {
                    values.push((code, value));
                    Ok(())
                })
                .map_err(|_| invalid_length())?;
                Some(FrameEvent::Settings { ack, values })
            }
            FrameType::PushPromise(flags) => {
                let mut payload = Self::strip_padding(&frame, payload)?;
                if payload.len() < PushPromise::LEN {
                    return Err(invalid_length());
                }
                let (_, pp) = PushPromise::parse(&payload[..]).map_err(|_| invalid_length())?;
                payload = payload.split_off(PushPromise::LEN);

                self.begin_block(
                    frame.stream_id,
                    BlockKind::PushPromise {
                        promised_stream_id: pp.promised_stream_id,
                    },
                    payload,
                )?;
                if flags.contains(PushPromiseFlags::EndHeaders) {
                    self.finish_block()?
                } else {
                    None
                }
            }
            FrameType::Ping(flags) => {
                if payload.len() != Ping::LEN {
                    return Err(invalid_length());
                }
                let (_, ping) = Ping::parse(&payload[..]).map_err(|_| invalid_length())?;
                Some(FrameEvent::Ping {
                    ack: flags.contains(PingFlags::Ack),
                    ping,
                })
            }
            FrameType::GoAway => {
                if payload.len() < 8 {
                    return Err(invalid_length());
                }
                let (_, goaway) = GoAway::parse(&payload[..]).map_err(|_| invalid_length())?;
                Some(FrameEvent::GoAway(goaway))
            }
            FrameType::WindowUpdate => {
                if payload.len() != WindowUpdate::LEN {
                    return Err(invalid_length());
                }
                let (_, update) =
                    WindowUpdate::parse(&payload[..]).map_err(|_| invalid_length())?;
                Some(FrameEvent::WindowUpdate {
                    stream_id: frame.stream_id,
                    increment: update.increment,
                })
            }
            FrameType::Continuation(flags) => {
                if self.assembly.is_none() {
                    return Err(FramingError::UnexpectedContinuationFrame {
                        stream_id: frame.stream_id,
                    });
                }
                self.add_fragment(payload)?;
                if flags.contains(ContinuationFlags::EndHeaders) {
                    self.finish_block()?
                } else {
                    None
                }
            }
            FrameType::Unknown(ft) => {
                trace!(
                    "ignoring unknown frame with type 0x{:x}, flags 0x{:x}",
                    ft.ty,
                    ft.flags
                );
                None
            }
        };

        Ok(ev)
    }

    fn strip_padding(frame: &Frame, mut payload: Bytes) -> Result<Bytes, FramingError> {
        if !frame.is_padded() {
            return Ok(payload);
        }

        if payload.is_empty() {
            return Err(FramingError::InvalidLength {
                frame_type: frame.frame_type,
                len: frame.len,
            });
        }

        let padding_length = payload[0] as usize;
        payload = payload.split_off(1);
        if payload.len() < padding_length {
            return Err(FramingError::PaddedFrameTooShort {
                frame_type: frame.frame_type,
                padding_length,
                frame_size: frame.len,
            });
        }

        // padding is on the end of the payload
        payload.truncate(payload.len() - padding_length);
        Ok(payload)
    }

    fn begin_block(
        &mut self,
        stream_id: StreamId,
        kind: BlockKind,
        fragment: Bytes,
    ) -> Result<(), FramingError> {
        self.assembly = Some(HeaderAssembly {
            stream_id,
            kind,
            fragments: smallvec![],
            size: 0,
            overflowed: false,
        });
        self.add_fragment(fragment)
    }

    fn add_fragment(&mut self, fragment: Bytes) -> Result<(), FramingError> {
        let limit = self.max_header_block_size;
        let capacity = self.header_buffer_capacity;
        let Some(assembly) = self.assembly.as_mut() else {
            return Ok(());
        };

        assembly.size += fragment.len();
        if assembly.size > capacity {
            let stream_id = assembly.stream_id;
            let size = assembly.size;
            self.assembly = None;
            return Err(FramingError::HeaderBufferExhausted {
                stream_id,
                size,
                capacity,
            });
        }
        if !assembly.overflowed && assembly.size > limit {
            debug!(stream_id = %assembly.stream_id, size = %assembly.size, %limit, "header block overflowed");
            assembly.overflowed = true;
        }
        // oversized blocks are still decoded, the HPACK table is shared
        assembly.fragments.push(fragment);
        Ok(())
    }

    fn finish_block(&mut self) -> Result<Option<FrameEvent>, FramingError> {
        let assembly = match self.assembly.take() {
            Some(assembly) => assembly,
            None => return Ok(None),
        };

        let block: Bytes = match assembly.fragments.len() {
            1 => assembly.fragments[0].clone(),
            _ => {
                let mut joined = BytesMut::with_capacity(assembly.size);
                for fragment in assembly.fragments.iter() {
                    joined.extend_from_slice(fragment);
                }
                joined.freeze()
            }
        };

        // decoding must run to completion even for blocks we end up
        // rejecting, the decoder's dynamic table depends on it
        let mut headers = HeaderBlock::new();
        self.hpack_dec
            .decode_with_cb(&block[..], |name, value| {
                headers.push(name.into_owned(), value.into_owned());
            })
            .map_err(|e| {
                trace!("undecodable header block:\n{:?}", block.hex_dump());
                FramingError::HpackDecodingError(e)
            })?;

        if assembly.overflowed {
            return Ok(Some(FrameEvent::StreamError {
                stream_id: assembly.target_stream(),
                error: StreamProtocolError::HeaderBlockTooLarge {
                    size: assembly.size,
                    limit: self.max_header_block_size,
                },
            }));
        }

        if let Err(error) = headers.validate() {
            debug!(stream_id = %assembly.target_stream(), %error, "rejecting header block");
            return Ok(Some(FrameEvent::StreamError {
                stream_id: assembly.target_stream(),
                error,
            }));
        }

        let ev = match assembly.kind {
            BlockKind::Headers {
                priority,
                end_stream,
            } => FrameEvent::Headers {
                stream_id: assembly.stream_id,
                priority,
                end_stream,
                headers,
            },
            BlockKind::PushPromise { promised_stream_id } => FrameEvent::PushPromise {
                stream_id: assembly.stream_id,
                promised_stream_id,
                headers,
            },
        };
        Ok(Some(ev))
    }

    /// HEADERS opening a stream, carrying its priority
    pub fn create_syn_stream(
        &mut self,
        stream_id: StreamId,
        priority: RequestPriority,
        headers: &HeaderBlock,
        end_stream: bool,
    ) -> io::Result<Bytes> {
        let spec = PrioritySpec {
            exclusive: false,
            stream_dependency: StreamId::CONNECTION,
            weight: priority.wire_weight(),
        };
        let mut prefix = Vec::with_capacity(PrioritySpec::LEN);
        spec.write_into(&mut prefix)?;

        let mut flags = BitFlags::from(HeadersFlags::Priority);
        if end_stream {
            flags |= HeadersFlags::EndStream;
        }
        self.create_header_frames(stream_id, HeaderFrameKind::Headers(flags), &prefix, headers)
    }

    /// HEADERS without priority, e.g. trailers
    pub fn create_headers(
        &mut self,
        stream_id: StreamId,
        headers: &HeaderBlock,
        end_stream: bool,
    ) -> io::Result<Bytes> {
        let mut flags = BitFlags::<HeadersFlags>::empty();
        if end_stream {
            flags |= HeadersFlags::EndStream;
        }
        self.create_header_frames(stream_id, HeaderFrameKind::Headers(flags), &[], headers)
    }

    pub fn create_push_promise(
        &mut self,
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: &HeaderBlock,
    ) -> io::Result<Bytes> {
        let mut prefix = Vec::with_capacity(PushPromise::LEN);
        PushPromise { promised_stream_id }.write_into(&mut prefix)?;
        self.create_header_frames(stream_id, HeaderFrameKind::PushPromise, &prefix, headers)
    }

    /// Encodes `headers` and splits the block over one HEADERS (or
    /// PUSH_PROMISE) frame and as many CONTINUATION frames as the peer's
    /// max frame size requires. The frames are returned back to back.
    fn create_header_frames(
        &mut self,
        stream_id: StreamId,
        kind: HeaderFrameKind,
        prefix: &[u8],
        headers: &HeaderBlock,
    ) -> io::Result<Bytes> {
        let mut block = Vec::new();
        self.hpack_enc.encode_into(headers.iter(), &mut block)?;

        let max = self.max_send_frame_size as usize;
        let first_room = max.saturating_sub(prefix.len());
        let (first, mut rest) = block.split_at(block.len().min(first_room));

        let mut out = Vec::with_capacity(block.len() + prefix.len() + 2 * FRAME_HEADER_LEN);
        let end_headers = rest.is_empty();
        let frame_type = match kind {
            HeaderFrameKind::Headers(mut flags) => {
                if end_headers {
                    flags |= HeadersFlags::EndHeaders;
                }
                FrameType::Headers(flags)
            }
            HeaderFrameKind::PushPromise => {
                let mut flags = BitFlags::<PushPromiseFlags>::empty();
                if end_headers {
                    flags |= PushPromiseFlags::EndHeaders;
                }
                FrameType::PushPromise(flags)
            }
        };
        let frame = Frame::new(frame_type, stream_id).with_len((prefix.len() + first.len()) as u32);
        debug!(?frame, ">");
        frame.write_into(&mut out)?;
        out.extend_from_slice(prefix);
        out.extend_from_slice(first);

        while !rest.is_empty() {
            let (chunk, next) = rest.split_at(rest.len().min(max));
            rest = next;
            let mut flags = BitFlags::<ContinuationFlags>::empty();
            if rest.is_empty() {
                flags |= ContinuationFlags::EndHeaders;
            }
            let frame =
                Frame::new(FrameType::Continuation(flags), stream_id).with_len(chunk.len() as u32);
            debug!(?frame, ">");
            frame.write_into(&mut out)?;
            out.extend_from_slice(chunk);
        }

        Ok(out.into())
    }

    pub fn create_data(
        &self,
        stream_id: StreamId,
        data: &[u8],
        end_stream: bool,
    ) -> io::Result<Bytes> {
        let mut flags = BitFlags::<DataFlags>::empty();
        if end_stream {
            flags |= DataFlags::EndStream;
        }
        Self::create_frame(Frame::new(FrameType::Data(flags), stream_id), data.len(), |w| {
            w.extend_from_slice(data);
            Ok(())
        })
    }

    pub fn create_settings(&self, values: &[(Setting, u32)]) -> io::Result<Bytes> {
        let pairs = SettingPairs(values);
        Self::create_frame(
            Frame::new(FrameType::Settings(Default::default()), StreamId::CONNECTION),
            pairs.len(),
            |w| pairs.write_into(w),
        )
    }

    pub fn create_settings_ack(&self) -> io::Result<Bytes> {
        Self::create_frame(
            Frame::new(
                FrameType::Settings(SettingsFlags::Ack.into()),
                StreamId::CONNECTION,
            ),
            0,
            |_| Ok(()),
        )
    }

    pub fn create_ping(&self, ping: Ping, ack: bool) -> io::Result<Bytes> {
        let mut flags = BitFlags::<PingFlags>::empty();
        if ack {
            flags |= PingFlags::Ack;
        }
        Self::create_frame(
            Frame::new(FrameType::Ping(flags), StreamId::CONNECTION),
            Ping::LEN,
            |w| ping.write_into(w),
        )
    }

    pub fn create_rst_stream(&self, stream_id: StreamId, error_code: ErrorCode) -> io::Result<Bytes> {
        Self::create_frame(
            Frame::new(FrameType::RstStream, stream_id),
            RstStream::LEN,
            |w| RstStream { error_code }.write_into(w),
        )
    }

    pub fn create_goaway(
        &self,
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: &[u8],
    ) -> io::Result<Bytes> {
        let goaway = GoAway {
            last_stream_id,
            error_code,
            additional_debug_data: Bytes::copy_from_slice(debug_data),
        };
        Self::create_frame(
            Frame::new(FrameType::GoAway, StreamId::CONNECTION),
            goaway.len(),
            |w| goaway.write_into(w),
        )
    }

    pub fn create_window_update(&self, stream_id: StreamId, increment: u32) -> io::Result<Bytes> {
        Self::create_frame(
            Frame::new(FrameType::WindowUpdate, stream_id),
            WindowUpdate::LEN,
            |w| {
                WindowUpdate {
                    reserved: 0,
                    increment,
                }
                .write_into(w)
            },
        )
    }

    fn create_frame(
        frame: Frame,
        payload_len: usize,
        write_payload: impl FnOnce(&mut Vec<u8>) -> io::Result<()>,
    ) -> io::Result<Bytes> {
        let frame = frame.with_len(payload_len as u32);
        debug!(?frame, ">");
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload_len);
        frame.write_into(&mut out)?;
        write_payload(&mut out)?;
        debug_assert_eq!(out.len(), FRAME_HEADER_LEN + payload_len);
        Ok(out.into())
    }
}

#[derive(Clone, Copy)]
enum HeaderFrameKind {
    Headers(BitFlags<HeadersFlags>),
    PushPromise,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use spdymux_frame::KnownErrorCode;

    fn request_headers() -> HeaderBlock {
        HeaderBlock::new()
            .with(":method", "GET")
            .with(":scheme", "https")
            .with(":authority", "example.org")
            .with(":path", "/index.html")
            .with("accept", "*/*")
            .with("cookie", "a=1")
            .with("cookie", "b=2")
    }

    fn decode_all(codec: &mut FrameCodec, bytes: &[u8]) -> Vec<FrameEvent> {
        codec.process_input(bytes).unwrap()
    }

    #[test]
    fn header_block_round_trip() {
        let mut client = FrameCodec::new(64 * 1024);
        let mut server = FrameCodec::new(64 * 1024);

        let wire = client
            .create_syn_stream(StreamId(1), RequestPriority::Medium, &request_headers(), true)
            .unwrap();
        let events = decode_all(&mut server, &wire);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::Headers {
                stream_id,
                priority,
                end_stream,
                headers,
            } => {
                assert_eq!(*stream_id, StreamId(1));
                assert!(*end_stream);
                assert_eq!(
                    priority.map(|p| p.weight),
                    Some(RequestPriority::Medium.wire_weight())
                );
                assert_eq!(headers, &request_headers());
            }
            other => panic!("unexpected event {other:?}"),
        }

        // the dynamic table stays in sync across blocks
        let wire = client
            .create_headers(StreamId(3), &request_headers(), false)
            .unwrap();
        match &decode_all(&mut server, &wire)[0] {
            FrameEvent::Headers { headers, .. } => assert_eq!(headers, &request_headers()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn large_header_blocks_use_continuations() {
        let mut client = FrameCodec::new(64 * 1024);
        let mut server = FrameCodec::new(64 * 1024);

        let big = "x".repeat(40_000);
        let headers = HeaderBlock::new()
            .with(":status", "200")
            .with("x-big", big.clone());
        let wire = client.create_headers(StreamId(1), &headers, false).unwrap();

        let (_, first) = Frame::parse(&wire).unwrap();
        assert!(matches!(first.frame_type, FrameType::Headers(_)));
        assert!(!first.is_end_headers());
        assert_eq!(first.len, Settings::DEFAULT_MAX_FRAME_SIZE);

        // feed it a byte at a time: nothing surfaces until the last fragment
        let mut events = vec![];
        for b in wire.iter() {
            events.extend(server.process_input(&[*b]).unwrap());
        }
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::Headers { headers, .. } => {
                assert_eq!(headers.get_str("x-big"), Some(big.as_str()))
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(server.frames_received(), 3);
    }

    #[test]
    fn interleaved_header_blocks_are_fatal() {
        let mut client = FrameCodec::new(64 * 1024);
        let mut server = FrameCodec::new(64 * 1024);

        let big = "y".repeat(20_000);
        let wire = client
            .create_headers(StreamId(1), &HeaderBlock::new().with("x-big", big), false)
            .unwrap();
        // first frame only, then DATA for another stream
        let first_len = FRAME_HEADER_LEN + Settings::DEFAULT_MAX_FRAME_SIZE as usize;
        assert!(decode_all(&mut server, &wire[..first_len]).is_empty());
        assert!(server.is_assembling_headers());

        let data = client.create_data(StreamId(3), b"hi", false).unwrap();
        let err = server.process_input(&data).unwrap_err();
        assert!(matches!(
            err,
            FramingError::ExpectedContinuationFrame {
                stream_id: StreamId(1),
                ..
            }
        ));
    }

    #[test]
    fn oversized_header_block_is_a_stream_error() {
        let mut client = FrameCodec::new(64 * 1024);
        let mut server = FrameCodec::new(1024);

        let headers = HeaderBlock::new()
            .with("x-tag", "shared")
            .with("x-big", "z".repeat(2048));
        let wire = client.create_headers(StreamId(5), &headers, false).unwrap();
        let events = decode_all(&mut server, &wire);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::StreamError { stream_id, error } => {
                assert_eq!(*stream_id, StreamId(5));
                assert!(matches!(
                    error,
                    StreamProtocolError::HeaderBlockTooLarge { limit: 1024, .. }
                ));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!server.is_assembling_headers());

        // the framer keeps going
        let ping = client.create_ping(Ping::from_id(9), false).unwrap();
        assert!(matches!(
            &decode_all(&mut server, &ping)[..],
            [FrameEvent::Ping { ack: false, .. }]
        ));

        // and the decoder table is still in step with the peer's encoder
        let small = HeaderBlock::new().with("x-tag", "shared");
        let wire = client.create_headers(StreamId(7), &small, true).unwrap();
        match &decode_all(&mut server, &wire)[..] {
            [FrameEvent::Headers { headers, .. }] => {
                assert_eq!(headers.get_str("x-tag"), Some("shared"));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn uppercase_header_names_are_stream_errors() {
        let mut client = FrameCodec::new(64 * 1024);
        let mut server = FrameCodec::new(64 * 1024);

        let headers = HeaderBlock::new()
            .with(":status", "200")
            .with("X-Upper", "1");
        let wire = client.create_headers(StreamId(1), &headers, false).unwrap();
        match &decode_all(&mut server, &wire)[0] {
            FrameEvent::StreamError { stream_id, error } => {
                assert_eq!(*stream_id, StreamId(1));
                assert_eq!(
                    error,
                    &StreamProtocolError::UppercaseHeaderName {
                        name: "X-Upper".into()
                    }
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn push_promise_errors_target_the_promised_stream() {
        let mut server = FrameCodec::new(64 * 1024);
        let mut client = FrameCodec::new(64 * 1024);

        let headers = HeaderBlock::new()
            .with(":path", "/a")
            .with(":path", "/b");
        let wire = server
            .create_push_promise(StreamId(1), StreamId(2), &headers)
            .unwrap();
        match &decode_all(&mut client, &wire)[0] {
            FrameEvent::StreamError { stream_id, .. } => assert_eq!(*stream_id, StreamId(2)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn control_frames_round_trip() {
        let mut codec = FrameCodec::new(64 * 1024);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(
            &codec
                .create_settings(&[(Setting::InitialWindowSize, 1000), (Setting::EnablePush, 0)])
                .unwrap(),
        );
        wire.extend_from_slice(&codec.create_settings_ack().unwrap());
        wire.extend_from_slice(&codec.create_ping(Ping::from_id(42), true).unwrap());
        wire.extend_from_slice(
            &codec
                .create_rst_stream(StreamId(3), KnownErrorCode::RefusedStream.into())
                .unwrap(),
        );
        wire.extend_from_slice(
            &codec
                .create_goaway(StreamId(7), KnownErrorCode::NoError.into(), b"bye")
                .unwrap(),
        );
        wire.extend_from_slice(&codec.create_window_update(StreamId(0), 12345).unwrap());
        wire.extend_from_slice(&codec.create_data(StreamId(3), b"body", true).unwrap());

        let events = decode_all(&mut codec, &wire);
        assert_eq!(events.len(), 7);

        match &events[0] {
            FrameEvent::Settings { ack, values } => {
                assert!(!ack);
                assert_eq!(
                    &values[..],
                    &[(Setting::InitialWindowSize, 1000), (Setting::EnablePush, 0)]
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events[1], FrameEvent::Settings { ack: true, .. }));
        match &events[2] {
            FrameEvent::Ping { ack, ping } => {
                assert!(ack);
                assert_eq!(ping.id(), 42);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[3] {
            FrameEvent::RstStream {
                stream_id,
                error_code,
            } => {
                assert_eq!(*stream_id, StreamId(3));
                assert_eq!(error_code.known(), Some(KnownErrorCode::RefusedStream));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[4] {
            FrameEvent::GoAway(goaway) => {
                assert_eq!(goaway.last_stream_id, StreamId(7));
                assert_eq!(&goaway.additional_debug_data[..], b"bye");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            events[5],
            FrameEvent::WindowUpdate {
                stream_id: StreamId(0),
                increment: 12345
            }
        ));
        match &events[6] {
            FrameEvent::Data {
                stream_id,
                payload,
                end_stream,
                flow_controlled_len,
            } => {
                assert_eq!(*stream_id, StreamId(3));
                assert_eq!(&payload[..], b"body");
                assert!(end_stream);
                assert_eq!(*flow_controlled_len, 4);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn endless_continuations_exhaust_the_header_buffer() {
        let mut server = FrameCodec::new(1024);
        let fragment = [0u8; 1000];
        let frame = |frame_type: FrameType| {
            let mut wire = vec![];
            Frame::new(frame_type, StreamId(1))
                .with_len(fragment.len() as u32)
                .write_into(&mut wire)
                .unwrap();
            wire.extend_from_slice(&fragment);
            wire
        };

        // none of these end the block
        assert!(decode_all(&mut server, &frame(FrameType::Headers(Default::default()))).is_empty());
        for _ in 0..3 {
            let continuation = frame(FrameType::Continuation(Default::default()));
            assert!(decode_all(&mut server, &continuation).is_empty());
        }
        assert!(server.is_assembling_headers());

        let continuation = frame(FrameType::Continuation(Default::default()));
        let err = server.process_input(&continuation).unwrap_err();
        match &err {
            FramingError::HeaderBufferExhausted {
                stream_id,
                size,
                capacity,
            } => {
                assert_eq!(*stream_id, StreamId(1));
                assert_eq!(*size, 5000);
                assert_eq!(*capacity, 4096);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.status(), SpdyError::CompressionError);
        assert!(!server.is_assembling_headers());
    }

    #[test]
    fn padded_data_counts_padding_against_flow_control() {
        let mut codec = FrameCodec::new(64 * 1024);
        let mut wire = vec![];
        Frame::new(FrameType::Data(DataFlags::Padded.into()), StreamId(1))
            .with_len(1 + 3 + 2)
            .write_into(&mut wire)
            .unwrap();
        wire.extend_from_slice(&[2, b'a', b'b', b'c', 0, 0]);

        match &decode_all(&mut codec, &wire)[0] {
            FrameEvent::Data {
                payload,
                flow_controlled_len,
                ..
            } => {
                assert_eq!(&payload[..], b"abc");
                assert_eq!(*flow_controlled_len, 6);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_fatal() {
        let mut codec = FrameCodec::new(64 * 1024);
        let mut wire = vec![];
        Frame::new(FrameType::Ping(Default::default()), StreamId::CONNECTION)
            .with_len(4)
            .write_into(&mut wire)
            .unwrap();
        wire.extend_from_slice(&[0; 4]);
        assert!(matches!(
            codec.process_input(&wire),
            Err(FramingError::InvalidLength { len: 4, .. })
        ));

        let mut codec = FrameCodec::new(64 * 1024);
        let mut wire = vec![];
        Frame::new(FrameType::Data(Default::default()), StreamId(1))
            .with_len(Settings::DEFAULT_MAX_FRAME_SIZE + 1)
            .write_into(&mut wire)
            .unwrap();
        let err = codec.process_input(&wire).unwrap_err();
        assert_eq!(err.status(), SpdyError::FrameSizeError);

        let mut codec = FrameCodec::new(64 * 1024);
        let mut wire = vec![];
        Frame::new(FrameType::Data(Default::default()), StreamId::CONNECTION)
            .write_into(&mut wire)
            .unwrap();
        assert!(matches!(
            codec.process_input(&wire),
            Err(FramingError::StreamSpecificFrameToConnection { .. })
        ));
    }

    #[test]
    fn unknown_frames_are_skipped() {
        let mut codec = FrameCodec::new(64 * 1024);
        let mut wire = vec![0, 0, 2, 0xbb, 0, 0, 0, 0, 1, 0xde, 0xad];
        wire.extend_from_slice(&codec.create_ping(Ping::from_id(1), false).unwrap());
        let events = decode_all(&mut codec, &wire);
        assert_eq!(events.len(), 1);
        assert_eq!(codec.frames_received(), 2);
    }
}
