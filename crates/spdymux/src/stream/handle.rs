use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::Weak,
};

use bytes::Bytes;
use http::Uri;
use spdymux_frame::StreamId;
use tokio::sync::mpsc;
use tracing::debug;

use super::{StreamEvent, StreamKey, StreamState};
use crate::{
    error::SpdyError, headers::HeaderBlock, priority::RequestPriority, session::Session,
};

/// A caller's end of one multiplexed stream.
///
/// Events arrive in wire order. Dropping the handle before the stream is
/// closed cancels it.
pub struct Stream {
    session: Weak<RefCell<Session>>,
    key: StreamKey,
    url: Uri,
    priority: RequestPriority,
    events: mpsc::UnboundedReceiver<StreamEvent>,

    /// Body chunks received but not yet handed out
    buffered: VecDeque<Bytes>,

    /// Set once the terminal event has been pulled off the channel
    status: Option<Result<(), SpdyError>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("key", &self.key)
            .field("url", &self.url)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(
        session: Weak<RefCell<Session>>,
        key: StreamKey,
        url: Uri,
        priority: RequestPriority,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Self {
        Self {
            session,
            key,
            url,
            priority,
            events,
            buffered: Default::default(),
            status: None,
        }
    }

    /// Forgets the session so that dropping the handle has no effect. Used
    /// when a handle could not be delivered and the session cleans up itself.
    pub(crate) fn detach(mut self) -> StreamKey {
        self.session = Weak::new();
        self.key
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let session = self.session.upgrade()?;
        let mut session = session.borrow_mut();
        Some(f(&mut session))
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    /// Wire id, assigned once the request headers are written
    pub fn stream_id(&self) -> Option<StreamId> {
        let key = self.key;
        self.with_session(|s| s.stream_id(key)).flatten()
    }

    pub fn state(&self) -> StreamState {
        let key = self.key;
        self.with_session(|s| s.stream_state(key))
            .flatten()
            .unwrap_or(StreamState::Closed)
    }

    /// Queues the request headers. The stream gets its id when they reach
    /// the wire. Pass `more_data = false` for requests without a body.
    pub fn send_request_headers(
        &mut self,
        headers: HeaderBlock,
        more_data: bool,
    ) -> Result<(), SpdyError> {
        let key = self.key;
        self.with_session(|s| s.send_request_headers(key, headers, !more_data))
            .unwrap_or(Err(SpdyError::NotConnected))
    }

    /// Queues body bytes and waits until they have all been written. They may
    /// go out as several frames, interleaved with other streams.
    pub async fn write_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), SpdyError> {
        let key = self.key;
        let done = self
            .with_session(|s| s.queue_data(key, data, end_stream))
            .unwrap_or(Err(SpdyError::NotConnected))?;
        done.await.unwrap_or(Err(SpdyError::NotConnected))
    }

    /// Pulls the next event off the channel, remembering the terminal status
    async fn recv_event(&mut self) -> Option<StreamEvent> {
        if self.status.is_some() {
            return None;
        }
        let ev = self.events.recv().await;
        match &ev {
            Some(StreamEvent::Closed(status)) => self.status = Some(status.clone()),
            None => self.status = Some(Err(SpdyError::ConnectionClosed)),
            _ => {}
        }
        ev
    }

    fn consumed(&self, len: usize) {
        if len == 0 {
            return;
        }
        let key = self.key;
        self.with_session(|s| s.on_data_consumed(key, len));
    }

    /// Next thing that happened on the stream, `None` after the close event
    /// has been returned.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if let Some(data) = self.buffered.pop_front() {
            self.consumed(data.len());
            return Some(StreamEvent::Data(data));
        }

        let ev = self.recv_event().await;
        if let Some(StreamEvent::Data(data)) = &ev {
            self.consumed(data.len());
        }
        ev
    }

    /// Waits for the response headers
    pub async fn read_response_headers(&mut self) -> Result<HeaderBlock, SpdyError> {
        loop {
            match self.recv_event().await {
                Some(StreamEvent::Headers(headers)) => return Ok(headers),
                Some(StreamEvent::Data(data)) => self.buffered.push_back(data),
                Some(StreamEvent::Closed(status)) => {
                    return Err(status.err().unwrap_or(SpdyError::ConnectionClosed))
                }
                None => return Err(self.close_error()),
            }
        }
    }

    fn close_error(&self) -> SpdyError {
        match &self.status {
            Some(Err(e)) => e.clone(),
            _ => SpdyError::ConnectionClosed,
        }
    }

    /// Reads body bytes into `buf`, merging every chunk that has already
    /// arrived. Returns `Ok(0)` at the end of a cleanly closed stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SpdyError> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.buffered.is_empty() {
            match self.recv_event().await {
                Some(StreamEvent::Data(data)) => {
                    if !data.is_empty() {
                        self.buffered.push_back(data)
                    }
                }
                // trailers are not part of the byte stream
                Some(StreamEvent::Headers(_)) => {}
                Some(StreamEvent::Closed(Ok(()))) => return Ok(0),
                Some(StreamEvent::Closed(Err(e))) => return Err(e),
                None => {
                    return match &self.status {
                        Some(Err(e)) => Err(e.clone()),
                        _ => Ok(0),
                    }
                }
            }
        }

        let mut n = 0;
        loop {
            while n < buf.len() {
                let Some(chunk) = self.buffered.front_mut() else {
                    break;
                };
                let len = chunk.len().min(buf.len() - n);
                buf[n..n + len].copy_from_slice(&chunk.split_to(len));
                n += len;
                if chunk.is_empty() {
                    self.buffered.pop_front();
                }
            }
            if n == buf.len() || self.status.is_some() {
                break;
            }

            match self.events.try_recv() {
                Ok(StreamEvent::Data(data)) => self.buffered.push_back(data),
                Ok(StreamEvent::Headers(_)) => {}
                Ok(StreamEvent::Closed(status)) => {
                    // reported on the next call
                    self.status = Some(status);
                    break;
                }
                Err(_) => break,
            }
        }

        self.consumed(n);
        Ok(n)
    }

    /// Cancels the stream: an active stream is reset with CANCEL, one that
    /// never reached the wire is just forgotten. Does nothing once closed.
    pub fn cancel(&mut self) {
        let key = self.key;
        self.with_session(|s| s.cancel_stream(key));
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match session.try_borrow_mut() {
            Ok(mut session) => session.cancel_stream(self.key),
            Err(_) => debug!(key = ?self.key, "session busy, stream dropped without cancelling"),
        };
    }
}
