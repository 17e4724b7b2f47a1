use std::{collections::VecDeque, io};

use b_x::{BxForResults, BX};
use bytes::Bytes;
use spdymux::{
    frame::{KnownErrorCode, Setting, StreamId, PREFACE},
    FrameCodec, FrameEvent, HeaderBlock,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

/// The server end of a session's transport, scripted by the test.
pub(crate) struct FakePeer {
    io: DuplexStream,
    pub(crate) codec: FrameCodec,
    preface: Vec<u8>,
    preface_seen: bool,
    events: VecDeque<FrameEvent>,
}

impl FakePeer {
    pub(crate) fn new(io: DuplexStream) -> Self {
        Self {
            io,
            codec: FrameCodec::new(64 * 1024),
            preface: Vec::with_capacity(PREFACE.len()),
            preface_seen: false,
            events: Default::default(),
        }
    }

    /// Next frame the session wrote, `None` once it hung up
    pub(crate) async fn next_event(&mut self) -> Result<Option<FrameEvent>, BX> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(ev) = self.events.pop_front() {
                return Ok(Some(ev));
            }

            let n = self.io.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            let mut input = &buf[..n];

            if !self.preface_seen {
                let wanted = (PREFACE.len() - self.preface.len()).min(input.len());
                self.preface.extend_from_slice(&input[..wanted]);
                input = &input[wanted..];
                if self.preface.len() < PREFACE.len() {
                    continue;
                }
                if self.preface != PREFACE {
                    return Err(BX::from_string(format!(
                        "bad connection preface: {:?}",
                        String::from_utf8_lossy(&self.preface)
                    )));
                }
                self.preface_seen = true;
            }

            let events = self.codec.process_input(input).bx()?;
            self.events.extend(events);
        }
    }

    /// Skips frames until `pick` accepts one
    pub(crate) async fn expect<T>(
        &mut self,
        what: &str,
        mut pick: impl FnMut(&FrameEvent) -> Option<T>,
    ) -> Result<T, BX> {
        while let Some(ev) = self.next_event().await? {
            if let Some(picked) = pick(&ev) {
                return Ok(picked);
            }
            debug!(?ev, "skipping frame while waiting for {what}");
        }
        Err(BX::from_string(format!(
            "connection closed while waiting for {what}"
        )))
    }

    /// Reads until the session hangs up, returning everything it wrote
    pub(crate) async fn drain(&mut self) -> Result<Vec<FrameEvent>, BX> {
        let mut events = vec![];
        while let Some(ev) = self.next_event().await? {
            events.push(ev);
        }
        Ok(events)
    }

    pub(crate) async fn send(&mut self, frame: io::Result<Bytes>) -> Result<(), BX> {
        self.io.write_all(&frame?).await?;
        Ok(())
    }

    /// Exchanges SETTINGS with the session. Returns once the session has
    /// acknowledged ours, so they are in effect.
    pub(crate) async fn handshake(&mut self, settings: &[(Setting, u32)]) -> Result<(), BX> {
        self.expect("client SETTINGS", |ev| {
            matches!(ev, FrameEvent::Settings { ack: false, .. }).then_some(())
        })
        .await?;
        let frame = self.codec.create_settings(settings);
        self.send(frame).await?;
        let frame = self.codec.create_settings_ack();
        self.send(frame).await?;

        self.expect("SETTINGS ack", |ev| {
            matches!(ev, FrameEvent::Settings { ack: true, .. }).then_some(())
        })
        .await
    }

    /// Waits for request headers and returns their stream id and path
    pub(crate) async fn expect_request(&mut self) -> Result<(StreamId, String), BX> {
        self.expect("request HEADERS", |ev| match ev {
            FrameEvent::Headers {
                stream_id, headers, ..
            } => Some((*stream_id, headers.get_str(":path")?.to_string())),
            _ => None,
        })
        .await
    }

    pub(crate) async fn respond(
        &mut self,
        stream_id: StreamId,
        status: u16,
        end_stream: bool,
    ) -> Result<(), BX> {
        let headers = HeaderBlock::new().with(":status", status.to_string());
        let frame = self.codec.create_headers(stream_id, &headers, end_stream);
        self.send(frame).await
    }

    pub(crate) async fn data(
        &mut self,
        stream_id: StreamId,
        payload: &[u8],
        end_stream: bool,
    ) -> Result<(), BX> {
        let frame = self.codec.create_data(stream_id, payload, end_stream);
        self.send(frame).await
    }

    pub(crate) async fn goaway(
        &mut self,
        last_stream_id: StreamId,
        code: KnownErrorCode,
    ) -> Result<(), BX> {
        let frame = self
            .codec
            .create_goaway(last_stream_id, code.into(), b"going away");
        self.send(frame).await
    }

    /// Hangs up without a GOAWAY
    pub(crate) async fn hang_up(&mut self) -> Result<(), BX> {
        self.io.shutdown().await?;
        Ok(())
    }
}
