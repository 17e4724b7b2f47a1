use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use super::{Session, SessionHandle, SessionRef, SessionState};
use crate::{config::SessionConf, key::SessionKey, pool::PoolLink, settings_cache::SettingsCache};

/// A connected, bidirectional byte stream. TLS and proxy tunnels are the
/// transport's business.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + 'static {}

/// Starts a session over `transport` and returns a handle to it.
///
/// The session is driven by a task spawned with [tokio::task::spawn_local],
/// so this must be called from within a [tokio::task::LocalSet].
pub fn spawn_session(
    key: SessionKey,
    conf: Rc<SessionConf>,
    settings_cache: Rc<dyn SettingsCache>,
    transport: impl Transport,
) -> SessionHandle {
    spawn_pooled_session(key, conf, settings_cache, None, transport)
}

pub(crate) fn spawn_pooled_session(
    key: SessionKey,
    conf: Rc<SessionConf>,
    settings_cache: Rc<dyn SettingsCache>,
    pool_link: Option<PoolLink>,
    transport: impl Transport,
) -> SessionHandle {
    let session = Session::new_ref(key, conf, settings_cache, pool_link);
    tokio::task::spawn_local(drive(session.clone(), transport));
    SessionHandle { inner: session }
}

async fn drive<T: Transport>(session: SessionRef, transport: T) {
    let (transport_r, transport_w) = tokio::io::split(transport);
    let conf = session.borrow().conf.clone();

    let mut write_task = std::pin::pin!(write_loop(session.clone(), transport_w));
    let mut rest = std::pin::pin!(async {
        tokio::join!(
            read_loop(session.clone(), transport_r, conf),
            timer_loop(session.clone()),
        )
    });

    tokio::select! {
        _ = &mut write_task => {
            debug!("write task finished, dropping reader");
        }
        _ = &mut rest => {
            debug!("read & timer tasks finished, flushing writes");
            (&mut write_task).await;
        }
    }

    let key = session.borrow().key().clone();
    debug!(%key, "session driver done");
}

/// Feeds transport bytes to the session, yielding after
/// `max_read_bytes_per_turn` so one busy connection doesn't hog the thread.
async fn read_loop<T: Transport>(
    session: SessionRef,
    mut transport_r: ReadHalf<T>,
    conf: Rc<SessionConf>,
) {
    let mut buf = vec![0u8; conf.read_buffer_size.max(1)];
    let mut budget = conf.max_read_bytes_per_turn;

    loop {
        if session.borrow().state() >= SessionState::Draining {
            break;
        }

        match transport_r.read(&mut buf).await {
            Ok(0) => {
                session.borrow_mut().on_read_eof();
                break;
            }
            Ok(n) => {
                session.borrow_mut().on_read(&buf[..n]);
                budget = budget.saturating_sub(n);
                if budget == 0 {
                    tokio::task::yield_now().await;
                    budget = conf.max_read_bytes_per_turn;
                }
            }
            Err(e) => {
                session.borrow_mut().on_read_error(&e);
                break;
            }
        }
    }
}

/// Writes one frame at a time until the session is closed, then shuts the
/// transport down.
async fn write_loop<T: Transport>(session: SessionRef, mut transport_w: WriteHalf<T>) {
    let wakeup = session.borrow().write_wakeup();

    loop {
        let frame = session.borrow_mut().next_write();
        match frame {
            Some(frame) => {
                let res = async {
                    transport_w.write_all(&frame).await?;
                    transport_w.flush().await
                }
                .await;
                match res {
                    Ok(()) => session.borrow_mut().on_write_complete(),
                    Err(e) => session.borrow_mut().on_write_error(&e),
                }
            }
            None => {
                if session.borrow().state() == SessionState::Closed {
                    break;
                }
                wakeup.notified().await;
            }
        }
    }

    if let Err(e) = transport_w.shutdown().await {
        debug!(%e, "error shutting down transport");
    }
}

/// Fires ping checks and push expiry. Rearmed whenever the session pokes
/// `timer_wakeup`.
async fn timer_loop(session: SessionRef) {
    let wakeup = session.borrow().timer_wakeup();

    loop {
        let (state, deadline) = {
            let session = session.borrow();
            (session.state(), session.next_timer_deadline())
        };
        if state >= SessionState::Draining {
            break;
        }

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => session.borrow_mut().on_timer(),
                    _ = wakeup.notified() => {}
                }
            }
            None => wakeup.notified().await,
        }
    }
}
