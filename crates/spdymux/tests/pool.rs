use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    net::SocketAddr,
    rc::Rc,
};

use b_x::{BxForResults, BX};
use futures_util::FutureExt;
use pretty_assertions::assert_eq;
use spdymux::{
    http::Uri, Connected, Connector, HeaderBlock, HostPortPair, MemorySettingsCache,
    NetworkChangePolicy, PoolConf, PrivacyMode, RequestPriority, SessionConf, SessionHandle,
    SessionKey, SessionPool, SessionState, SettingsCache, SpdyError, Stream, StreamEvent,
    StreamRequest,
};
use tokio::{io::DuplexStream, sync::Notify};

mod helpers;
use helpers::{peer::FakePeer, run};

#[derive(Default)]
struct FakeNetwork {
    hosts: HashMap<String, Vec<SocketAddr>>,
    certificate_names: Vec<String>,
    connects: Cell<usize>,
    peers: RefCell<Vec<(SessionKey, FakePeer)>>,

    /// While set, connection attempts wait for `connects_released`
    hold_connects: Cell<bool>,
    connects_released: Notify,
}

/// Resolves from a fixed table and connects to in-memory peers
#[derive(Clone)]
struct FakeConnector {
    net: Rc<FakeNetwork>,
}

impl Connector for FakeConnector {
    type Transport = DuplexStream;

    async fn resolve(&self, host_port: &HostPortPair) -> io::Result<Vec<SocketAddr>> {
        self.net
            .hosts
            .get(&host_port.host)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
    }

    async fn connect(
        &self,
        key: &SessionKey,
        _addrs: &[SocketAddr],
    ) -> io::Result<Connected<DuplexStream>> {
        while self.net.hold_connects.get() {
            self.net.connects_released.notified().await;
        }
        self.net.connects.set(self.net.connects.get() + 1);
        let (client, server) = tokio::io::duplex(1 << 20);
        self.net
            .peers
            .borrow_mut()
            .push((key.clone(), FakePeer::new(server)));
        Ok(Connected {
            transport: client,
            is_secure: true,
            certificate_names: self.net.certificate_names.clone(),
        })
    }
}

impl FakeNetwork {
    fn take_peer(&self) -> Result<FakePeer, BX> {
        let mut peers = self.peers.borrow_mut();
        if peers.is_empty() {
            return Err(BX::from_string("no connection was made".to_string()));
        }
        Ok(peers.remove(0).1)
    }
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn network() -> Rc<FakeNetwork> {
    let shared = vec![addr("10.0.0.1:443")];
    Rc::new(FakeNetwork {
        hosts: [
            ("www.example.org".to_string(), shared.clone()),
            ("api.example.org".to_string(), shared.clone()),
            ("other.net".to_string(), shared),
            ("solo.example.org".to_string(), vec![addr("10.0.0.2:443")]),
        ]
        .into_iter()
        .collect(),
        certificate_names: vec!["*.example.org".to_string()],
        ..Default::default()
    })
}

fn key(host: &str) -> SessionKey {
    SessionKey::new(HostPortPair::new(host, 443))
}

fn pool(net: &Rc<FakeNetwork>, conf: PoolConf) -> SessionPool<FakeConnector> {
    SessionPool::new(
        FakeConnector { net: net.clone() },
        conf,
        Rc::new(SessionConf::default()),
    )
}

/// Opens a stream and puts its request on the wire
async fn request(handle: &SessionHandle, host: &str) -> Result<Stream, BX> {
    let url: Uri = format!("https://{host}/").parse().unwrap();
    let mut stream = StreamRequest::new(handle, url, RequestPriority::Medium)
        .start()
        .await
        .bx()?;
    let headers = HeaderBlock::new()
        .with(":method", "GET")
        .with(":scheme", "https")
        .with(":authority", host.to_string())
        .with(":path", "/");
    stream.send_request_headers(headers, false).bx()?;
    Ok(stream)
}

async fn close_status(stream: &mut Stream) -> Result<(), SpdyError> {
    while let Some(ev) = stream.next_event().await {
        if let StreamEvent::Closed(status) = ev {
            return status;
        }
    }
    Err(SpdyError::ConnectionClosed)
}

#[test]
fn sessions_are_reused_by_key() {
    run(async {
        let net = network();
        let pool = pool(&net, PoolConf::default());

        let a = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        let b = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        assert_eq!(net.connects.get(), 1);
        assert_eq!(pool.num_sessions(), 1);
        assert_eq!(a.key(), b.key());
        assert!(pool.find_available_session(&key("www.example.org")).is_some());

        Ok(())
    })
}

#[test]
fn sessions_are_shared_across_hosts_with_the_same_address() {
    run(async {
        let net = network();
        let pool = pool(&net, PoolConf::default());

        let www = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        let api = pool.find_or_create_session(&key("api.example.org")).await.bx()?;
        assert_eq!(net.connects.get(), 1);
        // the alias keeps the session's own key
        assert_eq!(api.key(), www.key());
        assert!(pool.find_available_session(&key("api.example.org")).is_some());

        // same address, but the certificate doesn't cover it
        pool.find_or_create_session(&key("other.net")).await.bx()?;
        assert_eq!(net.connects.get(), 2);

        // private requests never share with non-private ones
        let private = key("api.example.org").with_privacy_mode(PrivacyMode::Enabled);
        pool.find_or_create_session(&private).await.bx()?;
        assert_eq!(net.connects.get(), 3);
        assert_eq!(pool.num_sessions(), 3);

        pool.remove_aliases(&key("api.example.org"));
        assert!(pool.find_available_session(&key("api.example.org")).is_none());
        assert!(pool.find_available_session(&key("www.example.org")).is_some());

        Ok(())
    })
}

#[test]
fn ip_pooling_can_be_disabled() {
    run(async {
        let net = network();
        let conf = PoolConf {
            enable_ip_pooling: false,
            ..Default::default()
        };
        let pool = pool(&net, conf);

        pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        pool.find_or_create_session(&key("api.example.org")).await.bx()?;
        assert_eq!(net.connects.get(), 2);

        Ok(())
    })
}

#[test]
fn resolution_failures_are_reported() {
    run(async {
        let net = network();
        let pool = pool(&net, PoolConf::default());

        let err = pool
            .find_or_create_session(&key("nowhere.invalid"))
            .await
            .unwrap_err();
        assert_eq!(err, SpdyError::Transport(io::ErrorKind::NotFound));
        assert_eq!(net.connects.get(), 0);

        Ok(())
    })
}

#[test]
fn sessions_leave_the_pool_when_the_peer_goes_away() {
    run(async {
        let net = network();
        let pool = pool(&net, PoolConf::default());

        let handle = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        pool.find_or_create_session(&key("api.example.org")).await.bx()?;
        let mut peer = net.take_peer()?;
        peer.handshake(&[]).await?;

        peer.goaway(spdymux::frame::StreamId(0), spdymux::frame::KnownErrorCode::NoError)
            .await?;
        peer.drain().await?;
        assert_eq!(handle.closed().await, Ok(()));

        assert_eq!(pool.num_sessions(), 0);
        assert!(pool.find_available_session(&key("www.example.org")).is_none());
        assert!(pool.find_available_session(&key("api.example.org")).is_none());

        pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        assert_eq!(net.connects.get(), 2);

        Ok(())
    })
}

#[test]
fn full_pool_closes_an_idle_session() {
    run(async {
        let net = network();
        let conf = PoolConf {
            max_sessions: Some(1),
            ..Default::default()
        };
        let pool = pool(&net, conf);

        let idle = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        pool.find_or_create_session(&key("solo.example.org")).await.bx()?;

        assert_eq!(idle.closed().await, Err(SpdyError::ConnectionClosed));
        assert_eq!(net.connects.get(), 2);
        assert_eq!(pool.num_sessions(), 1);
        assert!(pool.find_available_session(&key("solo.example.org")).is_some());

        Ok(())
    })
}

#[test]
fn stalled_pool_waits_for_a_session_to_finish() {
    run(async {
        let net = network();
        let conf = PoolConf {
            max_sessions: Some(1),
            ..Default::default()
        };
        let pool = pool(&net, conf);

        let busy = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        let mut peer = net.take_peer()?;
        peer.handshake(&[]).await?;
        let mut stream = request(&busy, "www.example.org").await?;
        let (stream_id, _) = peer.expect_request().await?;

        let solo_key = key("solo.example.org");
        let mut waiting = Box::pin(pool.find_or_create_session(&solo_key));
        assert!((&mut waiting).now_or_never().is_none());
        assert!(pool.is_stalled());
        assert_eq!(busy.state(), SessionState::Available);

        // once its last stream is done, the busy session makes room
        peer.respond(stream_id, 200, true).await?;
        assert_eq!(close_status(&mut stream).await, Ok(()));

        let solo = waiting.await.bx()?;
        assert_eq!(solo.key(), solo_key);
        assert!(busy.is_closed());
        assert!(!pool.is_stalled());
        assert_eq!(pool.num_sessions(), 1);

        Ok(())
    })
}

#[test]
fn network_change_aborts_streams() {
    run(async {
        let net = network();
        let cache = Rc::new(MemorySettingsCache::default());
        let conf = PoolConf {
            network_change_policy: NetworkChangePolicy::AbortStreams,
            ..Default::default()
        };
        let pool = SessionPool::with_settings_cache(
            FakeConnector { net: net.clone() },
            conf,
            Rc::new(SessionConf::default()),
            cache.clone(),
        );

        let handle = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        let mut peer = net.take_peer()?;
        peer.handshake(&[(spdymux::frame::Setting::MaxConcurrentStreams, 50)])
            .await?;
        let mut stream = request(&handle, "www.example.org").await?;
        peer.expect_request().await?;
        assert_eq!(cache.max_concurrent_streams(&key("www.example.org")), Some(50));

        pool.on_ip_address_changed();
        assert_eq!(cache.max_concurrent_streams(&key("www.example.org")), None);
        assert_eq!(close_status(&mut stream).await, Err(SpdyError::NetworkChanged));
        assert_eq!(handle.closed().await, Err(SpdyError::NetworkChanged));
        assert_eq!(pool.num_sessions(), 0);

        Ok(())
    })
}

#[test]
fn network_change_can_let_streams_finish() {
    run(async {
        let net = network();
        let conf = PoolConf {
            network_change_policy: NetworkChangePolicy::MarkGoingAway,
            ..Default::default()
        };
        let pool = pool(&net, conf);

        let handle = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        let mut peer = net.take_peer()?;
        peer.handshake(&[]).await?;
        let mut stream = request(&handle, "www.example.org").await?;
        let (stream_id, _) = peer.expect_request().await?;

        pool.on_ip_address_changed();
        assert_eq!(handle.state(), SessionState::GoingAway);
        assert!(pool.find_available_session(&key("www.example.org")).is_none());

        peer.respond(stream_id, 200, true).await?;
        assert_eq!(close_status(&mut stream).await, Ok(()));
        assert_eq!(handle.closed().await, Ok(()));

        Ok(())
    })
}

#[test]
fn closing_sessions() {
    run(async {
        let net = network();
        let pool = pool(&net, PoolConf::default());

        let www = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        let solo = pool.find_or_create_session(&key("solo.example.org")).await.bx()?;
        let mut peer = net.take_peer()?;
        peer.handshake(&[]).await?;
        let _stream = request(&www, "www.example.org").await?;
        peer.expect_request().await?;

        // only the session without streams is idle
        pool.close_idle_sessions();
        assert_eq!(solo.closed().await, Err(SpdyError::ConnectionClosed));
        assert!(!www.is_closed());
        assert_eq!(pool.num_sessions(), 1);

        pool.close_all_sessions().await;
        assert!(www.is_closed());
        assert_eq!(pool.num_sessions(), 0);

        Ok(())
    })
}

#[test]
fn closing_current_sessions_spares_later_ones() {
    run(async {
        let net = network();
        let pool = pool(&net, PoolConf::default());

        let old = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        let mut peer = net.take_peer()?;
        peer.handshake(&[]).await?;
        let mut stream = request(&old, "www.example.org").await?;
        peer.expect_request().await?;

        pool.close_current_sessions(SpdyError::ProtocolError);
        assert_eq!(close_status(&mut stream).await, Err(SpdyError::ProtocolError));
        assert_eq!(old.closed().await, Err(SpdyError::ProtocolError));

        let new = pool.find_or_create_session(&key("www.example.org")).await.bx()?;
        assert_eq!(net.connects.get(), 2);
        assert_eq!(new.state(), SessionState::Available);
        assert_eq!(pool.num_sessions(), 1);

        Ok(())
    })
}

#[test]
fn sessions_still_connecting_survive_a_sweep() {
    run(async {
        let net = network();
        let pool = pool(&net, PoolConf::default());
        let www = pool.find_or_create_session(&key("www.example.org")).await.bx()?;

        net.hold_connects.set(true);
        let solo_key = key("solo.example.org");
        let mut connecting = Box::pin(pool.find_or_create_session(&solo_key));
        assert!((&mut connecting).now_or_never().is_none());

        pool.close_current_sessions(SpdyError::ProtocolError);
        assert_eq!(www.state(), SessionState::Draining);

        net.hold_connects.set(false);
        net.connects_released.notify_waiters();
        let solo = connecting.await.bx()?;
        assert_eq!(solo.key(), solo_key);
        assert_eq!(solo.state(), SessionState::Available);

        assert_eq!(www.closed().await, Err(SpdyError::ProtocolError));
        assert!(!solo.is_closed());
        assert_eq!(pool.num_sessions(), 1);

        Ok(())
    })
}
