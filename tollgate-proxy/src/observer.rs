//! Response observation.
//!
//! The gateway needs the final status and the number of body bytes it sent
//! for every forwarded request, without buffering or altering the stream.
//! [`ObservedBody`] wraps the outbound body, counts data frames as hyper
//! pulls them and reports once when the stream is finished, fails, or is
//! dropped because the client went away.

use bytes::Buf;
use http::{Response, StatusCode};
use hyper::body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Status and byte counters for one response.
#[derive(Debug, Default, Clone)]
pub struct ResponseObserver {
    status: Option<StatusCode>,
    bytes: u64,
}

impl ResponseObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the response status. Only the first announcement counts.
    pub fn write_header(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    #[inline]
    pub fn record_bytes(&mut self, n: u64) {
        self.bytes += n;
    }

    /// Announced status, or 200 when the body was written without one.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

type Completion = Box<dyn FnOnce(&ResponseObserver) + Send + 'static>;

/// Body decorator that forwards frames unchanged while counting them.
pub struct ObservedBody<B> {
    inner: B,
    observer: ResponseObserver,
    on_complete: Option<Completion>,
}

impl<B> ObservedBody<B> {
    pub fn new<F>(inner: B, observer: ResponseObserver, on_complete: F) -> Self
    where
        F: FnOnce(&ResponseObserver) + Send + 'static,
    {
        Self {
            inner,
            observer,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn observer(&self) -> &ResponseObserver {
        &self.observer
    }

    fn complete(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(&self.observer);
        }
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.observer.record_bytes(data.remaining() as u64);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.complete();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for ObservedBody<B> {
    fn drop(&mut self) {
        // Client disconnects and bodies hyper never polls still report once.
        self.complete();
    }
}

/// Wrap `response` so `on_complete` sees its status and delivered byte count.
pub fn observe<B, F>(response: Response<B>, on_complete: F) -> Response<ObservedBody<B>>
where
    F: FnOnce(&ResponseObserver) + Send + 'static,
{
    let mut observer = ResponseObserver::new();
    observer.write_header(response.status());
    response.map(|body| ObservedBody::new(body, observer, on_complete))
}
