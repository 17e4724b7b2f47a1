use std::time::Duration;

/// Per-session configuration
#[derive(Debug, Clone)]
pub struct SessionConf {
    /// How many streams may be created before the peer's SETTINGS arrive
    pub initial_max_concurrent_streams: usize,

    /// Upper bound applied to the peer's MAX_CONCURRENT_STREAMS
    pub max_concurrent_streams_limit: usize,

    /// Receive window advertised for each stream
    pub stream_initial_recv_window: u32,

    /// Receive window for the session as a whole. Raised from the protocol
    /// default with a WINDOW_UPDATE right after the preface.
    pub session_initial_recv_window: u32,

    /// Capacity of the header-block assembly buffer
    pub max_header_block_size: usize,

    /// Largest DATA payload written in one frame
    pub max_frame_chunk_size: usize,

    /// Size of a single transport read
    pub read_buffer_size: usize,

    /// Bytes processed per read turn before yielding to other tasks
    pub max_read_bytes_per_turn: usize,

    pub enable_ping_based_connection_checking: bool,

    /// Idle time after which a new stream is preceded by a ping
    pub connection_at_risk_of_loss: Duration,

    /// How long to wait for any activity once a ping is in flight
    pub hung_interval: Duration,

    pub enable_push: bool,

    /// Capacity of the unclaimed pushed stream table
    pub max_unclaimed_pushed_streams: usize,

    /// How long a pushed stream may wait to be claimed
    pub pushed_stream_lifetime: Duration,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            initial_max_concurrent_streams: 100,
            max_concurrent_streams_limit: 256,
            stream_initial_recv_window: 65_535,
            session_initial_recv_window: 10 * 1024 * 1024,
            max_header_block_size: 64 * 1024,
            max_frame_chunk_size: 16 * 1024,
            read_buffer_size: 8 * 1024,
            max_read_bytes_per_turn: 32 * 1024,
            enable_ping_based_connection_checking: true,
            connection_at_risk_of_loss: Duration::from_secs(10),
            hung_interval: Duration::from_secs(10),
            enable_push: true,
            max_unclaimed_pushed_streams: 1000,
            pushed_stream_lifetime: Duration::from_secs(300),
        }
    }
}

/// What the pool does with its sessions when the local network changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChangePolicy {
    /// Stop handing out sessions but let active streams finish; the
    /// transport is expected to notice a dead path by itself.
    MarkGoingAway,

    /// Fail every stream right away with [crate::SpdyError::NetworkChanged]
    AbortStreams,
}

impl Default for NetworkChangePolicy {
    fn default() -> Self {
        // platforms whose sockets survive address changes tend to be the
        // ones where aborting is too aggressive
        if cfg!(any(target_os = "android", target_os = "windows")) {
            Self::MarkGoingAway
        } else {
            Self::AbortStreams
        }
    }
}

/// Session pool configuration
#[derive(Debug, Clone)]
pub struct PoolConf {
    /// Reuse sessions for other hosts resolving to the same address
    pub enable_ip_pooling: bool,

    pub network_change_policy: NetworkChangePolicy,

    /// Maximum number of live sessions, `None` for unlimited
    pub max_sessions: Option<usize>,
}

impl Default for PoolConf {
    fn default() -> Self {
        Self {
            enable_ip_pooling: true,
            network_change_policy: Default::default(),
            max_sessions: None,
        }
    }
}
