//! Session and stream multiplexing for SPDY/HTTP2-family connections.
//!
//! A [SessionPool] hands out sessions by destination. A session carries
//! many [Stream]s over one connection; callers get them through a
//! [StreamRequest], which waits when the session is at its concurrency cap.
//! Everything is single-threaded: run it inside a [tokio::task::LocalSet].

mod codec;
pub use codec::{FrameCodec, FrameEvent, FramingError};

mod config;
pub use config::{NetworkChangePolicy, PoolConf, SessionConf};

mod error;
pub use error::{SessionError, SpdyError, StreamProtocolError};

mod flow;

mod headers;
pub use headers::HeaderBlock;

mod key;
pub use key::{HostPortPair, PrivacyMode, ProxyServer, SessionKey};

mod pool;
pub use pool::{Connected, Connector, SessionPool};

mod priority;
pub use priority::RequestPriority;

mod request;
pub use request::StreamRequest;

mod session;
pub use session::{spawn_session, SessionHandle, SessionState, Transport};

mod settings_cache;
pub use settings_cache::{MemorySettingsCache, SettingsCache};

mod stream;
pub use stream::{Stream, StreamEvent, StreamState};

/// re-exported so consumers can build frames and settings by hand
pub use spdymux_frame as frame;

/// re-exported so consumers can use whatever version we use
pub use http;
