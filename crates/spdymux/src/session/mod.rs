//! One connection, many streams.
//!
//! [Session] is a sans-IO state machine: transport bytes go in through
//! [Session::on_read], serialized frames come out of [Session::next_write],
//! and timers fire through [Session::on_timer]. The tasks in `driver` do
//! the actual I/O. Everything runs on one thread; streams and requests hold
//! a `Weak` back to the session and call into it synchronously.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    io,
    rc::{Rc, Weak},
};

use bytes::Bytes;
use http::Uri;
use smallvec::{smallvec, SmallVec};
use spdymux_frame::{ErrorCode, GoAway, KnownErrorCode, Ping, Setting, Settings, StreamId, PREFACE};
use tokio::{
    sync::{oneshot, watch, Notify},
    time::Instant,
};
use tracing::{debug, trace, warn};

use crate::{
    codec::{FrameCodec, FrameEvent},
    config::SessionConf,
    error::{SessionError, SpdyError, StreamProtocolError},
    flow::{RecvWindow, SendWindow},
    headers::HeaderBlock,
    key::{HostPortPair, SessionKey},
    pool::PoolLink,
    priority::{PriorityQueue, RequestPriority},
    settings_cache::SettingsCache,
    stream::{PendingData, Stream, StreamCore, StreamEvent, StreamKey, StreamState},
};

mod driver;
mod push;
mod write_queue;


pub(crate) use driver::spawn_pooled_session;
pub use driver::{spawn_session, Transport};
use push::{UnclaimedPush, UnclaimedPushTable};
use write_queue::{InFlight, WriteEntry, WriteQueue};

pub(crate) type SessionRef = Rc<RefCell<Session>>;

/// Where a session is in its life. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Accepting new streams
    Available,
    /// No new streams, existing ones finish
    GoingAway,
    /// Flushing the last writes, every stream is gone
    Draining,
    Closed,
}

/// Outcome of asking the session for a stream
pub(crate) enum Admission {
    Ready(Stream),
    Queued(oneshot::Receiver<Result<Stream, SpdyError>>),
}

struct PendingRequest {
    url: Uri,
    priority: RequestPriority,
    tx: oneshot::Sender<Result<Stream, SpdyError>>,
}

#[derive(Debug, Clone, Copy)]
struct PingCheck {
    at: Instant,
    /// When the check was planned; activity older than this doesn't count
    planned_at: Instant,
}

pub(crate) struct Session {
    this: Weak<RefCell<Session>>,
    key: SessionKey,
    conf: Rc<SessionConf>,
    state: SessionState,
    close_status: Option<Result<(), SpdyError>>,
    codec: FrameCodec,
    settings_cache: Rc<dyn SettingsCache>,
    pool_link: Option<PoolLink>,

    streams: HashMap<StreamKey, StreamCore>,
    active: BTreeMap<StreamId, StreamKey>,
    num_pushed: usize,
    next_stream_key: u64,
    next_stream_id: u32,
    last_push_id: StreamId,
    max_concurrent_streams: usize,
    peer_settings: Settings,
    pending_requests: PriorityQueue<PendingRequest>,
    unclaimed_pushes: UnclaimedPushTable,

    write_queue: WriteQueue,
    in_flight: Option<InFlight>,
    transport_dead: bool,
    /// Streams waiting for the session send window, by priority
    send_stalled_streams: PriorityQueue<StreamKey>,
    send_window: SendWindow,
    recv_window: RecvWindow,

    pings_in_flight: u32,
    next_ping_id: u64,
    ping_check: Option<PingCheck>,
    last_activity: Instant,

    write_wakeup: Rc<Notify>,
    timer_wakeup: Rc<Notify>,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    pub(crate) fn new_ref(
        key: SessionKey,
        conf: Rc<SessionConf>,
        settings_cache: Rc<dyn SettingsCache>,
        pool_link: Option<PoolLink>,
    ) -> SessionRef {
        Rc::new_cyclic(|this| {
            RefCell::new(Self::new(
                this.clone(),
                key,
                conf,
                settings_cache,
                pool_link,
            ))
        })
    }

    fn new(
        this: Weak<RefCell<Session>>,
        key: SessionKey,
        conf: Rc<SessionConf>,
        settings_cache: Rc<dyn SettingsCache>,
        pool_link: Option<PoolLink>,
    ) -> Self {
        let max_concurrent_streams = settings_cache
            .max_concurrent_streams(&key)
            .map(|v| v as usize)
            .unwrap_or(conf.initial_max_concurrent_streams)
            .min(conf.max_concurrent_streams_limit);
        let (state_tx, _) = watch::channel(SessionState::Available);

        let mut session = Self {
            this,
            codec: FrameCodec::new(conf.max_header_block_size),
            key,
            state: SessionState::Available,
            close_status: None,
            settings_cache,
            pool_link,
            streams: Default::default(),
            active: Default::default(),
            num_pushed: 0,
            next_stream_key: 0,
            next_stream_id: 1,
            last_push_id: StreamId::CONNECTION,
            max_concurrent_streams,
            peer_settings: Default::default(),
            pending_requests: Default::default(),
            unclaimed_pushes: Default::default(),
            write_queue: Default::default(),
            in_flight: None,
            transport_dead: false,
            send_stalled_streams: Default::default(),
            send_window: SendWindow::new(Settings::DEFAULT_INITIAL_WINDOW_SIZE),
            recv_window: RecvWindow::new(Settings::DEFAULT_INITIAL_WINDOW_SIZE),
            pings_in_flight: 0,
            next_ping_id: 1,
            ping_check: None,
            last_activity: Instant::now(),
            write_wakeup: Default::default(),
            timer_wakeup: Default::default(),
            state_tx,
            conf,
        };
        debug!(key = %session.key, %max_concurrent_streams, "session created");
        session.send_initial_frames();
        session
    }

    fn send_initial_frames(&mut self) {
        self.enqueue_write(RequestPriority::Highest, WriteEntry::Preface);

        let mut settings: SmallVec<[(Setting, u32); 4]> = smallvec![
            (Setting::EnablePush, self.conf.enable_push as u32),
            (
                Setting::InitialWindowSize,
                self.conf.stream_initial_recv_window
            ),
        ];
        if self.conf.enable_push {
            settings.push((
                Setting::MaxConcurrentStreams,
                self.conf.max_unclaimed_pushed_streams as u32,
            ));
        }
        self.enqueue_write(RequestPriority::Highest, WriteEntry::Settings(settings));

        if let Some(increment) = self
            .recv_window
            .grow_to(self.conf.session_initial_recv_window)
        {
            self.enqueue_write(
                RequestPriority::Highest,
                WriteEntry::WindowUpdate {
                    stream_id: StreamId::CONNECTION,
                    increment,
                },
            );
        }
    }

    pub(crate) fn key(&self) -> &SessionKey {
        &self.key
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn close_status(&self) -> Option<Result<(), SpdyError>> {
        self.close_status.clone()
    }

    pub(crate) fn num_active_streams(&self) -> usize {
        self.active.len()
    }

    /// Streams admitted but not yet given an id
    pub(crate) fn num_created_streams(&self) -> usize {
        self.streams.values().filter(|s| s.id.is_none()).count()
    }

    pub(crate) fn pending_stream_request_count(&mut self) -> usize {
        self.pending_requests.retain(|r| !r.tx.is_closed());
        self.pending_requests.len()
    }

    pub(crate) fn num_unclaimed_pushed_streams(&self) -> usize {
        self.unclaimed_pushes.len()
    }

    pub(crate) fn frames_received(&self) -> u64 {
        self.codec.frames_received()
    }

    pub(crate) fn max_concurrent_streams(&self) -> usize {
        self.max_concurrent_streams
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn write_wakeup(&self) -> Rc<Notify> {
        self.write_wakeup.clone()
    }

    pub(crate) fn timer_wakeup(&self) -> Rc<Notify> {
        self.timer_wakeup.clone()
    }

    pub(crate) fn stream_id(&self, key: StreamKey) -> Option<StreamId> {
        self.streams.get(&key).and_then(|s| s.id)
    }

    pub(crate) fn stream_state(&self, key: StreamKey) -> Option<StreamState> {
        self.streams.get(&key).map(|s| s.state)
    }

    fn set_state(&mut self, state: SessionState) {
        debug_assert!(state >= self.state);
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn wake_writer(&self) {
        self.write_wakeup.notify_one();
    }

    fn wake_timer(&self) {
        self.timer_wakeup.notify_one();
    }

    fn enqueue_write(&mut self, priority: RequestPriority, entry: WriteEntry) {
        if self.state == SessionState::Closed || self.transport_dead {
            trace!(?entry, "transport is gone, dropping write");
            return;
        }
        self.write_queue.push(priority, entry);
        self.wake_writer();
    }

    // ---------------------------------------------------------------------
    // stream admission
    // ---------------------------------------------------------------------

    /// Streams counted against the concurrency cap. Pushed streams are
    /// bounded by the unclaimed table instead.
    fn num_capped_streams(&self) -> usize {
        self.streams.len() - self.num_pushed
    }

    /// Hands out a pushed stream for `url` if there is one, else creates a
    /// stream or queues the request.
    pub(crate) fn request_stream(
        &mut self,
        url: Uri,
        priority: RequestPriority,
    ) -> Result<Admission, SpdyError> {
        if let Some(push) = self.unclaimed_pushes.claim(&url.to_string()) {
            debug!(%url, finished = %push.finished_unread.is_some(), "claimed pushed stream");
            if let Some(stream) = self.streams.get_mut(&push.key) {
                stream.priority = priority;
            }
            // the stream is gone already, its buffered body is the claimer's
            self.credit_session_recv(push.finished_unread.unwrap_or(0));
            return Ok(Admission::Ready(Stream::new(
                self.this.clone(),
                push.key,
                url,
                priority,
                push.events,
            )));
        }

        match self.state {
            SessionState::Available => {}
            SessionState::GoingAway => return Err(SpdyError::Failed),
            SessionState::Draining | SessionState::Closed => {
                return Err(SpdyError::ConnectionClosed)
            }
        }

        // the queue is only ever non-empty while we're at the cap, so a
        // fresh request can't jump ahead of queued ones
        if self.num_capped_streams() < self.max_concurrent_streams {
            return Ok(Admission::Ready(self.create_stream(url, priority)));
        }

        let (tx, rx) = oneshot::channel();
        trace!(%url, ?priority, "at stream cap, queueing request");
        self.pending_requests
            .push_back(priority, PendingRequest { url, priority, tx });
        Ok(Admission::Queued(rx))
    }

    fn create_stream(&mut self, url: Uri, priority: RequestPriority) -> Stream {
        let key = StreamKey(self.next_stream_key);
        self.next_stream_key += 1;

        let (core, events) = StreamCore::new(
            key,
            url.clone(),
            priority,
            self.peer_settings.initial_window_size,
            self.conf.stream_initial_recv_window,
        );
        self.streams.insert(key, core);
        trace!(?key, %url, ?priority, "stream created");
        Stream::new(self.this.clone(), key, url, priority, events)
    }

    /// Admits queued requests, most urgent first, while there is room.
    fn process_pending_requests(&mut self) {
        while self.state == SessionState::Available
            && self.num_capped_streams() < self.max_concurrent_streams
        {
            let Some((_, req)) = self.pending_requests.pop() else {
                break;
            };
            if req.tx.is_closed() {
                trace!("skipping abandoned stream request");
                continue;
            }

            let stream = self.create_stream(req.url, req.priority);
            if let Err(Ok(stream)) = req.tx.send(Ok(stream)) {
                let key = stream.detach();
                self.streams.remove(&key);
            }
        }
    }

    pub(crate) fn send_request_headers(
        &mut self,
        key: StreamKey,
        headers: HeaderBlock,
        end_stream: bool,
    ) -> Result<(), SpdyError> {
        let Some(stream) = self.streams.get_mut(&key) else {
            return Err(SpdyError::NotConnected);
        };
        if stream.state != StreamState::Created {
            return Err(SpdyError::ProtocolError);
        }

        stream.request_headers = Some(headers);
        stream.headers_end_stream = end_stream;
        stream.local_end_queued = end_stream;
        stream.state = StreamState::Open;
        let priority = stream.priority;
        self.enqueue_write(priority, WriteEntry::SynStream { key });
        Ok(())
    }

    pub(crate) fn queue_data(
        &mut self,
        key: StreamKey,
        data: Bytes,
        end_stream: bool,
    ) -> Result<oneshot::Receiver<Result<(), SpdyError>>, SpdyError> {
        let Some(stream) = self.streams.get_mut(&key) else {
            return Err(SpdyError::NotConnected);
        };
        if stream.local_end_queued {
            return Err(SpdyError::NotConnected);
        }
        if stream.state == StreamState::Created {
            // request headers go first
            return Err(SpdyError::ProtocolError);
        }

        let (tx, rx) = oneshot::channel();
        stream.pending_send.push_back(PendingData {
            data,
            end_stream,
            done: Some(tx),
        });
        stream.local_end_queued = end_stream;
        self.schedule_data(key);
        Ok(rx)
    }

    /// Queues a DATA write for `key` unless one is already queued or the
    /// stream is waiting for window.
    fn schedule_data(&mut self, key: StreamKey) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        if stream.data_scheduled
            || stream.send_stalled_by_flow_control
            || !stream.can_send()
            || stream.pending_send.is_empty()
        {
            return;
        }
        stream.data_scheduled = true;
        let priority = stream.priority;
        self.enqueue_write(priority, WriteEntry::Data { key });
    }

    /// Local cancellation: forgets a stream that never reached the wire,
    /// resets one that did.
    pub(crate) fn cancel_stream(&mut self, key: StreamKey) {
        let Some(stream) = self.streams.get(&key) else {
            return;
        };
        if let Some(stream_id) = stream.id {
            let priority = stream.priority;
            self.enqueue_write(
                priority,
                WriteEntry::RstStream {
                    stream_id,
                    error_code: KnownErrorCode::Cancel.into(),
                },
            );
        }
        self.close_stream(key, Err(SpdyError::Cancelled));
    }

    /// The consumer read `len` bytes: return the credit to the peer.
    pub(crate) fn on_data_consumed(&mut self, key: StreamKey, len: usize) {
        let Some(stream) = self.streams.get_mut(&key) else {
            // credited in full when the stream closed
            return;
        };
        let len = len.min(stream.unconsumed);
        stream.unconsumed -= len;
        self.credit_stream_recv(key, len);
    }

    fn credit_stream_recv(&mut self, key: StreamKey, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(stream) = self.streams.get_mut(&key) {
            if let (Some(increment), Some(stream_id)) =
                (stream.recv_window.increase(len as u32), stream.id)
            {
                if !stream.is_remote_closed() {
                    let priority = stream.priority;
                    self.enqueue_write(
                        priority,
                        WriteEntry::WindowUpdate {
                            stream_id,
                            increment,
                        },
                    );
                }
            }
        }
        self.credit_session_recv(len);
    }

    fn credit_session_recv(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(increment) = self.recv_window.increase(len as u32) {
            self.enqueue_write(
                RequestPriority::Highest,
                WriteEntry::WindowUpdate {
                    stream_id: StreamId::CONNECTION,
                    increment,
                },
            );
        }
    }

    // ---------------------------------------------------------------------
    // closing streams
    // ---------------------------------------------------------------------

    /// Removes a stream and delivers its one terminal status.
    fn close_stream(&mut self, key: StreamKey, status: Result<(), SpdyError>) {
        let Some(mut stream) = self.streams.remove(&key) else {
            return;
        };
        if let Some(id) = stream.id {
            self.active.remove(&id);
        }
        // a push the peer finished before anyone asked for it stays
        // claimable, its response buffered in the table
        let mut parked = false;
        if stream.pushed {
            self.num_pushed -= 1;
            parked = status.is_ok() && self.unclaimed_pushes.finish(key, stream.unconsumed);
            if !parked {
                self.unclaimed_pushes.remove(key);
            }
        }
        self.write_queue.remove_for_stream(key);
        self.send_stalled_streams.retain(|k| *k != key);

        if !parked {
            // nobody will read these anymore
            let unconsumed = stream.unconsumed;
            self.credit_session_recv(unconsumed);
        }

        debug!(stream_id = ?stream.id, ?status, "stream closed");
        stream.on_close(status);

        if self.state == SessionState::Available {
            self.process_pending_requests();
        }
        self.maybe_finish_going_away();

        if self.state < SessionState::Draining
            && self.streams.is_empty()
            && self.pool_link.as_ref().is_some_and(|l| l.is_pool_stalled())
        {
            self.drain(Err(SpdyError::ConnectionClosed), "closing idle session for stalled pool");
        }
    }

    /// Sends RST_STREAM for a stream-scoped violation and closes the stream.
    fn reset_stream(&mut self, key: StreamKey, err: StreamProtocolError) {
        let Some(stream) = self.streams.get(&key) else {
            return;
        };
        debug!(stream_id = ?stream.id, %err, "resetting stream");
        if let Some(stream_id) = stream.id {
            let priority = stream.priority;
            self.enqueue_write(
                priority,
                WriteEntry::RstStream {
                    stream_id,
                    error_code: err.as_known_error_code().into(),
                },
            );
        }
        self.close_stream(key, Err(err.status()));
    }

    fn on_local_end(&mut self, key: StreamKey) {
        let closed = match self.streams.get_mut(&key) {
            Some(stream) => stream.on_local_end(),
            None => return,
        };
        if closed {
            self.close_stream(key, Ok(()));
        }
    }

    fn on_remote_end(&mut self, key: StreamKey) {
        let closed = match self.streams.get_mut(&key) {
            Some(stream) => stream.on_remote_end(),
            None => return,
        };
        if closed {
            self.close_stream(key, Ok(()));
        }
    }

    // ---------------------------------------------------------------------
    // going away & draining
    // ---------------------------------------------------------------------

    /// Stops handing out new streams. Existing ones are left alone.
    fn make_unavailable(&mut self) {
        if self.state != SessionState::Available {
            return;
        }
        debug!(key = %self.key, "session going away");
        self.set_state(SessionState::GoingAway);
        if let Some(link) = &self.pool_link {
            link.on_session_unavailable();
        }
    }

    /// Fails queued requests, streams that never got an id, and active
    /// streams above `last_good`.
    fn start_going_away(&mut self, last_good: StreamId, status: SpdyError) {
        for req in self.pending_requests.drain() {
            let _ = req.tx.send(Err(SpdyError::Aborted));
        }

        let mut created: Vec<StreamKey> = self
            .streams
            .values()
            .filter(|s| s.id.is_none())
            .map(|s| s.key)
            .collect();
        created.sort();
        for key in created {
            self.close_stream(key, Err(status.clone()));
        }

        let doomed: Vec<StreamKey> = self
            .active
            .range(StreamId(last_good.0.saturating_add(1))..)
            .map(|(_, key)| *key)
            .collect();
        for key in doomed {
            self.close_stream(key, Err(status.clone()));
        }
    }

    fn maybe_finish_going_away(&mut self) {
        if self.state == SessionState::GoingAway && self.streams.is_empty() {
            self.drain(Ok(()), "finished going away");
        }
    }

    /// Marks the session unavailable and aborts whatever hasn't started.
    pub(crate) fn go_away(&mut self, status: SpdyError) {
        if self.state >= SessionState::Draining {
            return;
        }
        self.make_unavailable();
        self.start_going_away(StreamId::MAX, status);
        self.maybe_finish_going_away();
    }

    /// Closes the session and every stream on it with `status`.
    pub(crate) fn close(&mut self, status: SpdyError) {
        self.drain(Err(status), "closed locally");
    }

    /// Point of no return: every stream is failed, a GOAWAY goes out if the
    /// status warrants one, and the writer closes the transport once the
    /// queue is flushed.
    fn drain(&mut self, status: Result<(), SpdyError>, description: &str) {
        if self.state >= SessionState::Draining {
            return;
        }
        self.make_unavailable();

        if let Err(err) = &status {
            if let Some(code) = err.goaway_code() {
                if !self.transport_dead {
                    debug!(last_stream_id = %self.last_push_id, ?code, "sending GOAWAY");
                    self.write_queue.push_urgent(WriteEntry::GoAway {
                        last_stream_id: self.last_push_id,
                        error_code: code.into(),
                        debug_data: Bytes::copy_from_slice(description.as_bytes()),
                    });
                }
            }
        }

        debug!(key = %self.key, ?status, %description, "session draining");
        self.set_state(SessionState::Draining);
        self.close_status = Some(status.clone());
        if let Err(err) = status {
            self.start_going_away(StreamId::CONNECTION, err);
        }
        self.unclaimed_pushes.clear();
        self.ping_check = None;
        self.wake_writer();
        self.wake_timer();
    }

    fn finish_close(&mut self) {
        let leftover: Vec<StreamKey> = self.streams.keys().copied().collect();
        for key in leftover {
            self.close_stream(key, Err(SpdyError::ConnectionClosed));
        }

        self.set_state(SessionState::Closed);
        self.wake_timer();
        debug!(key = %self.key, status = ?self.close_status, "session closed");
        if let Some(link) = self.pool_link.take() {
            link.on_session_closed();
        }
    }

    fn on_session_error(&mut self, e: SessionError) {
        debug!(%e, code = ?e.as_known_error_code(), "session error");
        self.drain(Err(e.status()), &e.to_string());
    }

    // ---------------------------------------------------------------------
    // transport events
    // ---------------------------------------------------------------------

    pub(crate) fn on_read(&mut self, bytes: &[u8]) {
        if self.state >= SessionState::Draining {
            return;
        }
        self.last_activity = Instant::now();
        self.codec.push_input(bytes);

        while self.state < SessionState::Draining {
            match self.codec.next_event() {
                Ok(Some(ev)) => {
                    if let Err(e) = self.on_frame_event(ev) {
                        self.on_session_error(e);
                    }
                }
                Ok(None) => break,
                Err(e) => self.on_session_error(e.into()),
            }
        }
    }

    pub(crate) fn on_read_eof(&mut self) {
        debug!("peer hung up");
        self.drain(Err(SpdyError::ConnectionClosed), "connection closed");
    }

    pub(crate) fn on_read_error(&mut self, e: &io::Error) {
        debug!(%e, "read error");
        self.transport_dead = true;
        self.write_queue.clear();
        self.drain(Err(SpdyError::from_io(e)), "read error");
    }

    /// Next frame to hand to the transport. `None` while a write is in
    /// flight or when there is nothing to do.
    pub(crate) fn next_write(&mut self) -> Option<Bytes> {
        if self.in_flight.is_some() || self.state == SessionState::Closed {
            return None;
        }

        loop {
            let Some(entry) = self.write_queue.pop() else {
                if self.state == SessionState::Draining {
                    self.finish_close();
                }
                return None;
            };
            match self.produce(entry) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => continue,
                Err(e) => self.on_session_error(e),
            }
        }
    }

    /// Serializes one queued entry. Stream entries may turn out to have
    /// nothing to send anymore.
    fn produce(&mut self, entry: WriteEntry) -> Result<Option<Bytes>, SessionError> {
        let frame = match entry {
            WriteEntry::SynStream { key } => return self.produce_syn_stream(key),
            WriteEntry::Data { key } => return self.produce_data(key),
            WriteEntry::Preface => Ok(Bytes::from_static(PREFACE)),
            WriteEntry::Settings(values) => self.codec.create_settings(&values),
            WriteEntry::SettingsAck => self.codec.create_settings_ack(),
            WriteEntry::Ping { ping, ack } => self.codec.create_ping(ping, ack),
            WriteEntry::RstStream {
                stream_id,
                error_code,
            } => self.codec.create_rst_stream(stream_id, error_code),
            WriteEntry::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => self
                .codec
                .create_goaway(last_stream_id, error_code, &debug_data),
            WriteEntry::WindowUpdate {
                stream_id,
                increment,
            } => self.codec.create_window_update(stream_id, increment),
        }
        .map_err(SessionError::Encode)?;

        self.in_flight = Some(InFlight::Control);
        Ok(Some(frame))
    }

    /// Activation: the stream gets the next id right as its headers are
    /// serialized, so ids hit the wire in increasing order.
    fn produce_syn_stream(&mut self, key: StreamKey) -> Result<Option<Bytes>, SessionError> {
        let Some(stream) = self.streams.get_mut(&key) else {
            return Ok(None);
        };
        let Some(headers) = stream.request_headers.take() else {
            return Ok(None);
        };

        let stream_id = StreamId(self.next_stream_id);
        self.next_stream_id += 2;
        stream.id = Some(stream_id);
        stream.state = StreamState::Active;
        let (priority, end_stream) = (stream.priority, stream.headers_end_stream);
        self.active.insert(stream_id, key);
        debug!(%stream_id, ?priority, %end_stream, "activating stream");

        let frame = self
            .codec
            .create_syn_stream(stream_id, priority, &headers, end_stream)
            .map_err(SessionError::Encode)?;
        self.in_flight = Some(InFlight::Headers { key, end_stream });

        self.maybe_send_preface_ping();

        if self.next_stream_id > StreamId::MAX.0 {
            debug!(last_stream_id = %stream_id, "stream ids exhausted");
            self.make_unavailable();
            self.start_going_away(stream_id, SpdyError::Aborted);
        }
        Ok(Some(frame))
    }

    /// Cuts the next DATA frame for `key` out of its pending writes, sized
    /// against both windows and the peer's max frame size.
    fn produce_data(&mut self, key: StreamKey) -> Result<Option<Bytes>, SessionError> {
        let max_frame = (self.codec.max_send_frame_size() as usize).min(self.conf.max_frame_chunk_size);
        let session_available = self.send_window.available();

        let Some(stream) = self.streams.get_mut(&key) else {
            return Ok(None);
        };
        stream.data_scheduled = false;
        let (Some(stream_id), true) = (stream.id, stream.can_send()) else {
            return Ok(None);
        };
        let Some(front) = stream.pending_send.front_mut() else {
            return Ok(None);
        };

        let len = if front.data.is_empty() {
            0
        } else {
            if stream.send_window.is_stalled() {
                trace!(%stream_id, window = %stream.send_window.size(), "stream send window stalled");
                stream.send_stalled_by_flow_control = true;
                return Ok(None);
            }
            if session_available == 0 {
                trace!(%stream_id, "session send window stalled");
                let priority = stream.priority;
                if !self.send_stalled_streams.contains(|k| *k == key) {
                    self.send_stalled_streams.push_back(priority, key);
                }
                return Ok(None);
            }
            front
                .data
                .len()
                .min(max_frame)
                .min(stream.send_window.available())
                .min(session_available)
        };

        let chunk = front.data.split_to(len);
        let (end_stream, done) = if front.data.is_empty() {
            let end_stream = front.end_stream;
            let done = stream.pending_send.pop_front().and_then(|p| p.done);
            (end_stream, done)
        } else {
            (false, None)
        };
        stream.decrease_send_window(len);
        self.send_window.decrease(len);

        let frame = self
            .codec
            .create_data(stream_id, &chunk, end_stream)
            .map_err(SessionError::Encode)?;
        self.in_flight = Some(InFlight::Data {
            key,
            end_stream,
            done,
        });
        Ok(Some(frame))
    }

    pub(crate) fn on_write_complete(&mut self) {
        match self.in_flight.take() {
            None | Some(InFlight::Control) => {}
            Some(InFlight::Headers { key, end_stream }) => {
                if end_stream {
                    self.on_local_end(key);
                } else {
                    self.schedule_data(key);
                }
            }
            Some(InFlight::Data {
                key,
                end_stream,
                done,
            }) => {
                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }
                if end_stream {
                    self.on_local_end(key);
                } else {
                    self.schedule_data(key);
                }
            }
        }
    }

    pub(crate) fn on_write_error(&mut self, e: &io::Error) {
        debug!(%e, "write error");
        let status = SpdyError::from_io(e);
        if let Some(InFlight::Data {
            done: Some(done), ..
        }) = self.in_flight.take()
        {
            let _ = done.send(Err(status.clone()));
        }
        self.transport_dead = true;
        self.write_queue.clear();
        self.drain(Err(status), "write error");
    }

    // ---------------------------------------------------------------------
    // inbound frames
    // ---------------------------------------------------------------------

    /// Has this id ever been used, by us or by a promise from the peer?
    fn check_opened(&self, frame_type: &'static str, stream_id: StreamId) -> Result<(), SessionError> {
        let opened = if stream_id.is_client_initiated() {
            stream_id.0 < self.next_stream_id
        } else {
            stream_id <= self.last_push_id
        };
        if opened {
            Ok(())
        } else {
            Err(SessionError::FrameForUnopenedStream {
                frame_type,
                stream_id,
            })
        }
    }

    fn on_frame_event(&mut self, ev: FrameEvent) -> Result<(), SessionError> {
        match ev {
            FrameEvent::Data {
                stream_id,
                payload,
                end_stream,
                flow_controlled_len,
            } => self.on_data(stream_id, payload, end_stream, flow_controlled_len)?,
            FrameEvent::Headers {
                stream_id,
                end_stream,
                headers,
                ..
            } => self.on_headers(stream_id, headers, end_stream)?,
            FrameEvent::Priority { stream_id, spec } => {
                trace!(%stream_id, ?spec, "ignoring priority frame");
            }
            FrameEvent::RstStream {
                stream_id,
                error_code,
            } => self.on_rst_stream(stream_id, error_code)?,
            FrameEvent::Settings { ack: true, .. } => {
                trace!("peer acknowledged our settings");
            }
            FrameEvent::Settings { ack: false, values } => {
                for (setting, value) in values {
                    self.apply_setting(setting, value)?;
                }
                self.enqueue_write(RequestPriority::Highest, WriteEntry::SettingsAck);
            }
            FrameEvent::PushPromise {
                stream_id,
                promised_stream_id,
                headers,
            } => self.on_push_promise(stream_id, promised_stream_id, headers)?,
            FrameEvent::Ping { ack: false, ping } => {
                self.enqueue_write(RequestPriority::Highest, WriteEntry::Ping { ping, ack: true });
            }
            FrameEvent::Ping { ack: true, ping } => {
                if self.pings_in_flight == 0 {
                    return Err(SessionError::UnexpectedPingAck);
                }
                self.pings_in_flight -= 1;
                trace!(id = %ping.id(), "ping acknowledged");
            }
            FrameEvent::GoAway(goaway) => self.on_goaway(goaway),
            FrameEvent::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(stream_id, increment)?,
            FrameEvent::StreamError { stream_id, error } => match self.active.get(&stream_id) {
                Some(&key) => self.reset_stream(key, error),
                None => {
                    debug!(%stream_id, %error, "stream error on unknown stream");
                    self.enqueue_write(
                        RequestPriority::Idle,
                        WriteEntry::RstStream {
                            stream_id,
                            error_code: error.as_known_error_code().into(),
                        },
                    );
                }
            },
        }
        Ok(())
    }

    fn on_data(
        &mut self,
        stream_id: StreamId,
        payload: Bytes,
        end_stream: bool,
        flow_controlled_len: u32,
    ) -> Result<(), SessionError> {
        // session window first: the peer overran it no matter which stream
        // the bytes were meant for
        if let Err(e) = self.recv_window.decrease(flow_controlled_len) {
            return Err(SessionError::SessionWindowUnderflow {
                len: e.len,
                window: e.size,
            });
        }
        let flow_len = flow_controlled_len as usize;

        let Some(&key) = self.active.get(&stream_id) else {
            self.check_opened("DATA", stream_id)?;
            trace!(%stream_id, %flow_len, "data for closed stream");
            self.credit_session_recv(flow_len);
            return Ok(());
        };
        let Some(stream) = self.streams.get_mut(&key) else {
            self.credit_session_recv(flow_len);
            return Ok(());
        };

        let violation = if !stream.response_headers_received {
            Some(StreamProtocolError::DataBeforeHeaders { frame_type: "DATA" })
        } else if stream.is_remote_closed() {
            Some(StreamProtocolError::FrameAfterEndStream)
        } else if let Err(e) = stream.recv_window.decrease(flow_controlled_len) {
            Some(StreamProtocolError::WindowUnderflow {
                len: e.len,
                window: e.size,
            })
        } else {
            None
        };
        if let Some(err) = violation {
            self.credit_session_recv(flow_len);
            self.reset_stream(key, err);
            return Ok(());
        }

        let padding = flow_len - payload.len();
        if !payload.is_empty() {
            let len = payload.len();
            if !stream.deliver(StreamEvent::Data(payload)) {
                self.credit_stream_recv(key, len);
            }
        }
        self.credit_stream_recv(key, padding);

        if end_stream {
            self.on_remote_end(key);
        }
        Ok(())
    }

    fn on_headers(
        &mut self,
        stream_id: StreamId,
        headers: HeaderBlock,
        end_stream: bool,
    ) -> Result<(), SessionError> {
        let Some(&key) = self.active.get(&stream_id) else {
            if stream_id.is_server_initiated() && stream_id > self.last_push_id {
                return Err(SessionError::HeadersForUnpromisedStream { stream_id });
            }
            self.check_opened("HEADERS", stream_id)?;
            trace!(%stream_id, "headers for closed stream");
            return Ok(());
        };
        let Some(stream) = self.streams.get_mut(&key) else {
            return Ok(());
        };

        if stream.is_remote_closed() {
            self.reset_stream(key, StreamProtocolError::FrameAfterEndStream);
            return Ok(());
        }
        if !stream.response_headers_received {
            if headers.status().is_none() {
                self.reset_stream(key, StreamProtocolError::MissingStatus);
                return Ok(());
            }
            stream.response_headers_received = true;
            if stream.state == StreamState::ReservedRemote {
                stream.state = StreamState::HalfClosedLocal;
            }
        }
        stream.deliver(StreamEvent::Headers(headers));

        if end_stream {
            self.on_remote_end(key);
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) -> Result<(), SessionError> {
        let Some(&key) = self.active.get(&stream_id) else {
            self.check_opened("RST_STREAM", stream_id)?;
            return Ok(());
        };
        let remote_closed = self
            .streams
            .get(&key)
            .is_some_and(|s| s.is_remote_closed());

        let status = match error_code.known() {
            Some(KnownErrorCode::RefusedStream) => Err(SpdyError::ServerRefusedStream),
            Some(KnownErrorCode::NoError) if remote_closed => Ok(()),
            _ => Err(SpdyError::StreamReset { code: error_code }),
        };
        debug!(%stream_id, ?error_code, "stream reset by peer");
        self.close_stream(key, status);
        Ok(())
    }

    fn on_window_update(&mut self, stream_id: StreamId, increment: u32) -> Result<(), SessionError> {
        if stream_id == StreamId::CONNECTION {
            if increment == 0 {
                return Err(SessionError::SessionWindowUpdateZeroIncrement);
            }
            self.send_window
                .increase(increment)
                .map_err(|_| SessionError::SessionWindowOverflow { increment })?;
            trace!(%increment, window = %self.send_window.size(), "session window update");
            self.resume_send_stalled_streams();
            return Ok(());
        }

        let Some(&key) = self.active.get(&stream_id) else {
            self.check_opened("WINDOW_UPDATE", stream_id)?;
            return Ok(());
        };
        if increment == 0 {
            self.reset_stream(key, StreamProtocolError::WindowUpdateZeroIncrement);
            return Ok(());
        }
        let Some(stream) = self.streams.get_mut(&key) else {
            return Ok(());
        };
        match stream.increase_send_window(increment) {
            Err(e) => self.reset_stream(key, e),
            Ok(()) => {
                trace!(%stream_id, %increment, window = %stream.send_window.size(), "stream window update");
                if stream.possibly_resume() {
                    self.schedule_data(key);
                }
            }
        }
        Ok(())
    }

    /// Session window opened up: reschedule stalled streams, most urgent
    /// first, so they get the new credit in priority order.
    fn resume_send_stalled_streams(&mut self) {
        while !self.send_window.is_stalled() {
            let Some((_, key)) = self.send_stalled_streams.pop() else {
                break;
            };
            self.schedule_data(key);
        }
    }

    fn apply_setting(&mut self, setting: Setting, value: u32) -> Result<(), SessionError> {
        let old_initial_window = self.peer_settings.initial_window_size;
        self.peer_settings.apply(setting, value)?;
        debug!(?setting, %value, "peer setting");

        match setting {
            Setting::MaxConcurrentStreams => {
                self.max_concurrent_streams =
                    (value as usize).min(self.conf.max_concurrent_streams_limit);
                self.settings_cache
                    .set_max_concurrent_streams(&self.key, value);
                self.process_pending_requests();
            }
            Setting::InitialWindowSize => {
                let delta = value as i64 - old_initial_window as i64;
                self.update_streams_send_window(delta)?;
            }
            Setting::HeaderTableSize => self.codec.set_encoder_table_size(value as usize),
            Setting::MaxFrameSize => self.codec.set_max_send_frame_size(value),
            Setting::EnablePush | Setting::MaxHeaderListSize => {}
        }
        Ok(())
    }

    fn update_streams_send_window(&mut self, delta: i64) -> Result<(), SessionError> {
        let mut resumed = vec![];
        for stream in self.streams.values_mut() {
            if stream.adjust_send_window(delta).is_err() {
                return Err(SessionError::StreamWindowOverflowDueToSettings {
                    stream_id: stream.id.unwrap_or(StreamId::CONNECTION),
                });
            }
            if stream.possibly_resume() {
                resumed.push(stream.key);
            }
        }
        resumed.sort();
        for key in resumed {
            self.schedule_data(key);
        }
        Ok(())
    }

    fn on_goaway(&mut self, goaway: GoAway) {
        debug!(
            last_stream_id = %goaway.last_stream_id,
            error_code = ?goaway.error_code,
            debug_data = %String::from_utf8_lossy(&goaway.additional_debug_data),
            "received GOAWAY"
        );
        self.make_unavailable();
        self.start_going_away(goaway.last_stream_id, SpdyError::Aborted);
        self.maybe_finish_going_away();
    }

    // ---------------------------------------------------------------------
    // server push
    // ---------------------------------------------------------------------

    fn on_push_promise(
        &mut self,
        associated: StreamId,
        promised_stream_id: StreamId,
        headers: HeaderBlock,
    ) -> Result<(), SessionError> {
        if !promised_stream_id.is_server_initiated() || promised_stream_id <= self.last_push_id {
            return Err(SessionError::InvalidPromisedStreamId {
                promised_stream_id,
                last_push_id: self.last_push_id,
            });
        }
        if !self.conf.enable_push {
            return Err(SessionError::PushDisabled);
        }
        self.last_push_id = promised_stream_id;

        if self.state != SessionState::Available {
            return self.refuse_push(promised_stream_id, StreamProtocolError::PushWhileGoingAway);
        }

        let associated_url = match self
            .active
            .get(&associated)
            .and_then(|key| self.streams.get(key))
        {
            Some(stream) if !stream.pushed => stream.url.clone(),
            _ => {
                return self.refuse_push(
                    promised_stream_id,
                    StreamProtocolError::PushAssociatedStreamClosed { associated },
                )
            }
        };

        let Some(url) = push_url(&headers) else {
            return self.refuse_push(promised_stream_id, StreamProtocolError::InvalidPushUrl);
        };
        if !same_origin(&url, &associated_url) {
            return self.refuse_push(promised_stream_id, StreamProtocolError::PushCrossOrigin);
        }
        let url_key = url.to_string();
        if self.unclaimed_pushes.contains_url(&url_key) {
            return self.refuse_push(promised_stream_id, StreamProtocolError::DuplicatePush);
        }

        self.evict_expired_pushes();
        if self.conf.max_unclaimed_pushed_streams == 0 {
            return self.refuse_push(promised_stream_id, StreamProtocolError::PushCapacity);
        }
        while self.unclaimed_pushes.len() >= self.conf.max_unclaimed_pushed_streams {
            let Some(oldest) = self.unclaimed_pushes.oldest() else {
                break;
            };
            self.evict_push(oldest, StreamProtocolError::PushCapacity);
        }

        let key = StreamKey(self.next_stream_key);
        self.next_stream_key += 1;
        let (core, events) = StreamCore::new_pushed(
            key,
            promised_stream_id,
            url,
            self.peer_settings.initial_window_size,
            self.conf.stream_initial_recv_window,
        );
        self.streams.insert(key, core);
        self.active.insert(promised_stream_id, key);
        self.num_pushed += 1;
        debug!(%promised_stream_id, %associated, url = %url_key, "accepted pushed stream");
        self.unclaimed_pushes.insert(UnclaimedPush {
            url: url_key,
            key,
            events,
            created_at: Instant::now(),
            finished_unread: None,
        });
        self.wake_timer();
        Ok(())
    }

    fn refuse_push(
        &mut self,
        promised_stream_id: StreamId,
        err: StreamProtocolError,
    ) -> Result<(), SessionError> {
        debug!(%promised_stream_id, %err, "refusing pushed stream");
        self.enqueue_write(
            RequestPriority::Lowest,
            WriteEntry::RstStream {
                stream_id: promised_stream_id,
                error_code: err.as_known_error_code().into(),
            },
        );
        Ok(())
    }

    fn evict_expired_pushes(&mut self) {
        let expired = self
            .unclaimed_pushes
            .expired(Instant::now(), self.conf.pushed_stream_lifetime);
        for key in expired {
            self.evict_push(key, StreamProtocolError::PushExpired);
        }
    }

    /// Drops an unclaimed push. One still open is reset; one the peer
    /// already finished just returns its buffered bytes to the window.
    fn evict_push(&mut self, key: StreamKey, err: StreamProtocolError) {
        if self.streams.contains_key(&key) {
            self.reset_stream(key, err);
        } else if let Some(push) = self.unclaimed_pushes.remove(key) {
            debug!(url = %push.url, %err, "dropping finished pushed stream");
            self.credit_session_recv(push.finished_unread.unwrap_or(0));
        }
    }

    // ---------------------------------------------------------------------
    // keepalive & timers
    // ---------------------------------------------------------------------

    /// Before a new stream on a connection that has been quiet for a while,
    /// make sure the peer is still there.
    fn maybe_send_preface_ping(&mut self) {
        if !self.conf.enable_ping_based_connection_checking || self.pings_in_flight > 0 {
            return;
        }
        let idle = Instant::now().saturating_duration_since(self.last_activity);
        if idle > self.conf.connection_at_risk_of_loss {
            debug!(?idle, "connection idle for a while, sending preface ping");
            self.write_ping();
        }
    }

    fn write_ping(&mut self) {
        let ping = Ping::from_id(self.next_ping_id);
        self.next_ping_id += 2;
        self.pings_in_flight += 1;
        self.enqueue_write(RequestPriority::Highest, WriteEntry::Ping { ping, ack: false });
        self.plan_ping_check();
    }

    fn plan_ping_check(&mut self) {
        if self.ping_check.is_some() {
            return;
        }
        let now = Instant::now();
        self.ping_check = Some(PingCheck {
            at: now + self.conf.hung_interval,
            planned_at: now,
        });
        self.wake_timer();
    }

    fn check_ping_status(&mut self, now: Instant, check: PingCheck) {
        self.ping_check = None;
        if self.pings_in_flight == 0 {
            return;
        }

        let idle = now.saturating_duration_since(self.last_activity);
        if idle >= self.conf.hung_interval || self.last_activity < check.planned_at {
            warn!(?idle, "no activity since ping, connection is dead");
            self.on_session_error(SessionError::PingTimeout);
            return;
        }

        // heard from the peer since: check again a hung interval after that
        self.ping_check = Some(PingCheck {
            at: now + (self.conf.hung_interval - idle),
            planned_at: now,
        });
    }

    pub(crate) fn next_timer_deadline(&self) -> Option<Instant> {
        if self.state >= SessionState::Draining {
            return None;
        }
        let ping = self.ping_check.map(|c| c.at);
        let push = self
            .unclaimed_pushes
            .next_expiry(self.conf.pushed_stream_lifetime);
        match (ping, push) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn on_timer(&mut self) {
        if self.state >= SessionState::Draining {
            return;
        }
        let now = Instant::now();
        if let Some(check) = self.ping_check {
            if check.at <= now {
                self.check_ping_status(now, check);
            }
        }
        if self.state < SessionState::Draining {
            self.evict_expired_pushes();
        }
    }
}

/// The url a PUSH_PROMISE is for, from its request pseudo-headers
fn push_url(headers: &HeaderBlock) -> Option<Uri> {
    let scheme = headers.get_str(":scheme")?;
    let authority = headers.get_str(":authority")?;
    let path = headers.get_str(":path")?;
    if !path.starts_with('/') {
        return None;
    }
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()
        .ok()
}

fn same_origin(a: &Uri, b: &Uri) -> bool {
    a.scheme_str() == b.scheme_str()
        && HostPortPair::from_uri(a).is_some_and(|hp| Some(hp) == HostPortPair::from_uri(b))
}

/// A caller's handle on a session. Cheap to clone; the session lives as
/// long as its driver or any handle does.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) inner: SessionRef,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.inner.borrow();
        f.debug_struct("SessionHandle")
            .field("key", &session.key)
            .field("state", &session.state)
            .finish()
    }
}

impl SessionHandle {
    pub fn key(&self) -> SessionKey {
        self.inner.borrow().key().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.borrow().state()
    }

    /// Whether new streams may be created on this session
    pub fn is_available(&self) -> bool {
        self.state() == SessionState::Available
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn num_active_streams(&self) -> usize {
        self.inner.borrow().num_active_streams()
    }

    pub fn num_created_streams(&self) -> usize {
        self.inner.borrow().num_created_streams()
    }

    pub fn pending_stream_request_count(&self) -> usize {
        self.inner.borrow_mut().pending_stream_request_count()
    }

    pub fn num_unclaimed_pushed_streams(&self) -> usize {
        self.inner.borrow().num_unclaimed_pushed_streams()
    }

    pub fn frames_received(&self) -> u64 {
        self.inner.borrow().frames_received()
    }

    /// Current cap on concurrently created streams
    pub fn max_concurrent_streams(&self) -> usize {
        self.inner.borrow().max_concurrent_streams()
    }

    /// Stops accepting streams; pending requests and streams that haven't
    /// sent headers fail with `status`, active ones run to completion.
    pub fn go_away(&self, status: SpdyError) {
        self.inner.borrow_mut().go_away(status)
    }

    /// Closes the session right away, failing every stream with `status`
    pub fn close(&self, status: SpdyError) {
        self.inner.borrow_mut().close(status)
    }

    /// Waits until the session is fully closed and returns why it closed
    pub async fn closed(&self) -> Result<(), SpdyError> {
        let mut state = self.inner.borrow().subscribe_state();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
        self.inner.borrow().close_status().unwrap_or(Ok(()))
    }
}
