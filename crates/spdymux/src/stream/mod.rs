//! Per-stream state owned by the session, and the [Stream] handle given to
//! callers.

use std::collections::VecDeque;

use bytes::Bytes;
use http::Uri;
use spdymux_frame::StreamId;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::{
    error::{SpdyError, StreamProtocolError},
    flow::{RecvWindow, SendWindow, WindowOverflow},
    headers::HeaderBlock,
    priority::RequestPriority,
};

mod handle;
pub use handle::Stream;

/// Session-local identity of a stream. Unlike the wire id it exists from
/// creation on, and is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StreamKey(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Admitted by the session, no request headers yet
    Created,
    /// Request headers queued, waiting for a stream id
    Open,
    /// Stream id assigned, frames flow both ways
    Active,
    /// We sent END_STREAM
    HalfClosedLocal,
    /// The peer sent END_STREAM
    HalfClosedRemote,
    /// Promised by the peer, response not started
    ReservedRemote,
    Closed,
}

/// What a [Stream] observes, in wire order. `Closed` comes last, exactly
/// once.
#[derive(Debug)]
pub enum StreamEvent {
    Headers(HeaderBlock),
    Data(Bytes),
    Closed(Result<(), SpdyError>),
}

pub(crate) type WriteDone = oneshot::Sender<Result<(), SpdyError>>;

/// Body bytes handed to the stream but not yet framed
pub(crate) struct PendingData {
    pub(crate) data: Bytes,
    pub(crate) end_stream: bool,
    pub(crate) done: Option<WriteDone>,
}

pub(crate) struct StreamCore {
    pub(crate) key: StreamKey,
    pub(crate) id: Option<StreamId>,
    pub(crate) state: StreamState,
    pub(crate) priority: RequestPriority,
    pub(crate) url: Uri,
    pub(crate) pushed: bool,

    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: RecvWindow,
    pub(crate) send_stalled_by_flow_control: bool,

    /// A DATA write entry for this stream is queued or in flight
    pub(crate) data_scheduled: bool,

    pub(crate) request_headers: Option<HeaderBlock>,
    pub(crate) headers_end_stream: bool,
    /// END_STREAM has been queued, no more body may follow
    pub(crate) local_end_queued: bool,
    pub(crate) pending_send: VecDeque<PendingData>,

    pub(crate) response_headers_received: bool,

    /// Bytes delivered to the consumer and not reported consumed yet
    pub(crate) unconsumed: usize,

    events: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl StreamCore {
    pub(crate) fn new(
        key: StreamKey,
        url: Uri,
        priority: RequestPriority,
        send_window_size: u32,
        recv_window_size: u32,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = Self {
            key,
            id: None,
            state: StreamState::Created,
            priority,
            url,
            pushed: false,
            send_window: SendWindow::new(send_window_size),
            recv_window: RecvWindow::new(recv_window_size),
            send_stalled_by_flow_control: false,
            data_scheduled: false,
            request_headers: None,
            headers_end_stream: false,
            local_end_queued: false,
            pending_send: Default::default(),
            response_headers_received: false,
            unconsumed: 0,
            events: Some(tx),
        };
        (stream, rx)
    }

    /// A stream promised by the peer: it has an id from the start and we
    /// never send on it.
    pub(crate) fn new_pushed(
        key: StreamKey,
        id: StreamId,
        url: Uri,
        send_window_size: u32,
        recv_window_size: u32,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (mut stream, rx) = Self::new(
            key,
            url,
            RequestPriority::Lowest,
            send_window_size,
            recv_window_size,
        );
        stream.id = Some(id);
        stream.state = StreamState::ReservedRemote;
        stream.pushed = true;
        stream.local_end_queued = true;
        (stream, rx)
    }

    pub(crate) fn can_send(&self) -> bool {
        matches!(
            self.state,
            StreamState::Active | StreamState::HalfClosedRemote
        )
    }

    pub(crate) fn is_remote_closed(&self) -> bool {
        matches!(
            self.state,
            StreamState::HalfClosedRemote | StreamState::Closed
        )
    }

    /// Credit from a WINDOW_UPDATE. Overflowing 2^31-1 is the peer's fault
    /// and kills the stream.
    pub(crate) fn increase_send_window(&mut self, delta: u32) -> Result<(), StreamProtocolError> {
        self.send_window
            .increase(delta)
            .map_err(|_| StreamProtocolError::WindowUpdateOverflow)
    }

    pub(crate) fn decrease_send_window(&mut self, len: usize) {
        self.send_window.decrease(len);
    }

    /// Applies an INITIAL_WINDOW_SIZE change; may leave the window negative
    pub(crate) fn adjust_send_window(&mut self, delta: i64) -> Result<(), WindowOverflow> {
        self.send_window.adjust(delta)
    }

    /// Clears the stall flag if the window opened back up. Returns whether
    /// the stream should be rescheduled.
    pub(crate) fn possibly_resume(&mut self) -> bool {
        if self.send_stalled_by_flow_control && !self.send_window.is_stalled() {
            trace!(stream_id = ?self.id, "resuming send-stalled stream");
            self.send_stalled_by_flow_control = false;
            return true;
        }
        false
    }

    /// Our END_STREAM reached the wire. Returns true once both sides are done.
    pub(crate) fn on_local_end(&mut self) -> bool {
        self.state = match self.state {
            StreamState::Active => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        self.state == StreamState::Closed
    }

    /// The peer's END_STREAM arrived. Returns true once both sides are done.
    pub(crate) fn on_remote_end(&mut self) -> bool {
        self.state = match self.state {
            StreamState::Active => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal | StreamState::ReservedRemote => StreamState::Closed,
            other => other,
        };
        self.state == StreamState::Closed
    }

    /// Hands an event to the consumer. Returns false if nobody is listening
    /// anymore.
    pub(crate) fn deliver(&mut self, ev: StreamEvent) -> bool {
        let len = match &ev {
            StreamEvent::Data(data) => data.len(),
            _ => 0,
        };
        match &self.events {
            Some(tx) if tx.send(ev).is_ok() => {
                self.unconsumed += len;
                true
            }
            _ => false,
        }
    }

    /// Delivers the terminal status and fails every write still waiting.
    pub(crate) fn on_close(&mut self, status: Result<(), SpdyError>) {
        self.state = StreamState::Closed;

        let write_status = match &status {
            Ok(()) => SpdyError::NotConnected,
            Err(e) => e.clone(),
        };
        for pending in self.pending_send.drain(..) {
            if let Some(done) = pending.done {
                let _ = done.send(Err(write_status.clone()));
            }
        }

        if let Some(tx) = self.events.take() {
            let _ = tx.send(StreamEvent::Closed(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stream() -> (StreamCore, mpsc::UnboundedReceiver<StreamEvent>) {
        StreamCore::new(
            StreamKey(1),
            Uri::from_static("https://example.org/"),
            RequestPriority::Medium,
            100,
            100,
        )
    }

    #[test]
    fn half_close_from_either_side() {
        let (mut s, _rx) = stream();
        s.state = StreamState::Active;
        assert!(!s.on_local_end());
        assert_eq!(s.state, StreamState::HalfClosedLocal);
        assert!(s.on_remote_end());

        let (mut s, _rx) = stream();
        s.state = StreamState::Active;
        assert!(!s.on_remote_end());
        assert!(s.is_remote_closed());
        assert!(s.can_send());
        assert!(s.on_local_end());
    }

    #[test]
    fn close_is_delivered_once_and_fails_writes() {
        let (mut s, mut rx) = stream();
        let (done, mut done_rx) = oneshot::channel();
        s.pending_send.push_back(PendingData {
            data: Bytes::from_static(b"hello"),
            end_stream: true,
            done: Some(done),
        });

        assert!(s.deliver(StreamEvent::Data(Bytes::from_static(b"abc"))));
        assert_eq!(s.unconsumed, 3);

        s.on_close(Err(SpdyError::Cancelled));
        s.on_close(Err(SpdyError::ConnectionClosed));
        assert!(!s.deliver(StreamEvent::Data(Bytes::from_static(b"late"))));

        assert_eq!(done_rx.try_recv().unwrap(), Err(SpdyError::Cancelled));
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Data(_))));
        assert!(matches!(
            rx.try_recv(),
            Ok(StreamEvent::Closed(Err(SpdyError::Cancelled)))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn window_adjustments() {
        let (mut s, _rx) = stream();
        s.decrease_send_window(100);
        s.send_stalled_by_flow_control = true;
        assert!(!s.possibly_resume());

        s.adjust_send_window(-50).unwrap();
        assert_eq!(s.send_window.size(), -50);
        s.increase_send_window(60).unwrap();
        assert!(s.possibly_resume());
        assert!(!s.send_stalled_by_flow_control);

        assert_eq!(
            s.increase_send_window(u32::MAX >> 1),
            Err(StreamProtocolError::WindowUpdateOverflow)
        );
    }
}
