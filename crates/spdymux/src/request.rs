use http::Uri;

use crate::{
    error::SpdyError,
    priority::RequestPriority,
    session::{Admission, SessionHandle},
    stream::Stream,
};

/// A request for a stream on a session, which may have to wait for the
/// session's concurrency cap.
///
/// Queued requests are admitted most urgent first, in submission order
/// within a priority. Dropping the future returned by [StreamRequest::start]
/// withdraws the request.
#[derive(Debug)]
pub struct StreamRequest {
    session: SessionHandle,
    url: Uri,
    priority: RequestPriority,
}

impl StreamRequest {
    pub fn new(session: &SessionHandle, url: Uri, priority: RequestPriority) -> Self {
        Self {
            session: session.clone(),
            url,
            priority,
        }
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    /// Resolves with a stream once the session admits the request, or with
    /// the reason it never will: [SpdyError::Failed] on a session that is
    /// going away, [SpdyError::Aborted] for requests still queued when it
    /// started going away.
    ///
    /// A pushed stream for the same url is handed out instead of a new one.
    pub async fn start(self) -> Result<Stream, SpdyError> {
        let admission = self
            .session
            .inner
            .borrow_mut()
            .request_stream(self.url, self.priority)?;

        match admission {
            Admission::Ready(stream) => Ok(stream),
            Admission::Queued(rx) => rx.await.unwrap_or(Err(SpdyError::Aborted)),
        }
    }
}
