//! Outbound HTTP client for upstream registries and token endpoints.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt as _, TryStreamExt as _};
use http::{HeaderMap, Uri};
use http_body_util::{BodyExt as _, LengthLimitError, Limited};
use hyperdriver::service::SharedService;
use tower::ServiceExt as _;

pub use self::timeout::{TimeoutLayer, TimeoutService};

/// The type-erased service used to reach upstreams.
pub type ClientService = hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A response body as a stream of chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Errors from collecting a response body into memory.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The body is larger than allowed.
    #[error("body exceeds {0} bytes")]
    TooLarge(usize),

    /// The upstream stopped sending data.
    #[error("no data received for {0:?}")]
    TimedOut(Duration),

    /// The body stream failed.
    #[error("reading body: {0}")]
    Body(String),
}

/// A client for upstream registries, with a per-request timeout.
///
/// The timeout bounds the wait for response headers, and separately every
/// wait for the next chunk of a response body.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    inner: ClientService,
    timeout: Duration,
}

impl UpstreamClient {
    /// Create a client speaking HTTP and HTTPS over TCP.
    pub fn new(timeout: Duration) -> Self {
        let inner = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .layer(TimeoutLayer::new(timeout))
            .build_service();
        Self { inner, timeout }
    }

    /// Create a client from any compatible service, e.g. a mock upstream.
    pub fn with_service<S>(inner: S, timeout: Duration) -> Self
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let inner = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(TimeoutLayer::new(timeout))
            .service(inner);
        Self { inner, timeout }
    }

    /// Send a GET request.
    #[tracing::instrument(skip(self, headers), fields(%uri))]
    pub async fn get(
        &self,
        uri: Uri,
        headers: HeaderMap,
    ) -> Result<http::Response<hyperdriver::Body>, hyperdriver::client::Error> {
        let mut request = http::Request::new(hyperdriver::Body::empty());
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;

        let response = self.inner.clone().oneshot(request).await?;
        tracing::trace!(status = %response.status(), "Upstream responded");
        Ok(response)
    }

    /// Stream a response body. The stream fails with
    /// [`io::ErrorKind::TimedOut`] once the upstream sends nothing for the
    /// client's timeout.
    pub fn body_stream(&self, body: hyperdriver::Body) -> BodyStream {
        idle_timeout(body.into_data_stream(), self.timeout)
    }

    /// Collect a response body, refusing bodies over `limit` bytes.
    pub async fn collect_limited(
        &self,
        body: hyperdriver::Body,
        limit: usize,
    ) -> Result<Bytes, CollectError> {
        let mut stream = idle_timeout(Limited::new(body, limit).into_data_stream(), self.timeout);
        let mut data = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(error) if error.kind() == io::ErrorKind::TimedOut => {
                    return Err(CollectError::TimedOut(self.timeout));
                }
                Err(error)
                    if error
                        .get_ref()
                        .is_some_and(|inner| inner.downcast_ref::<LengthLimitError>().is_some()) =>
                {
                    return Err(CollectError::TooLarge(limit));
                }
                Err(error) => return Err(CollectError::Body(error.to_string())),
            }
        }
        Ok(data.freeze())
    }
}

#[cfg(test)]
impl UpstreamClient {
    /// A client whose requests never complete.
    pub(crate) fn stalled() -> Self {
        Self::with_service(stub::Stalled, Duration::from_millis(20))
    }

    /// A client answering every request with `body` after `delay`, and the
    /// number of requests it has seen.
    pub(crate) fn canned(
        body: &'static str,
        delay: Duration,
    ) -> (Self, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        let canned = stub::Canned::new(body, delay);
        let calls = canned.calls.clone();
        (Self::with_service(canned, Duration::from_secs(5)), calls)
    }
}

/// Fail `stream` when no item arrives within `idle`.
fn idle_timeout<S, E>(stream: S, idle: Duration) -> BodyStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    let stream = Box::pin(stream.map_err(io::Error::other));
    Box::pin(futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(stream))),
            Ok(None) => None,
            Err(_) => {
                tracing::debug!(?idle, "Upstream body stalled");
                let error = io::Error::new(io::ErrorKind::TimedOut, "upstream stopped sending data");
                Some((Err(error), None))
            }
        }
    }))
}

mod timeout {
    use std::future::{Future, IntoFuture};
    use std::marker::PhantomData;
    use std::pin::Pin;
    use std::task::{Context, Poll, ready};
    use std::time::Duration;

    use pin_project::pin_project;
    use tokio::time::Timeout;

    /// A layer which fails requests that take longer than a fixed duration.
    #[derive(Debug, Clone)]
    pub struct TimeoutLayer {
        timeout: Duration,
    }

    impl TimeoutLayer {
        /// Create a timeout layer.
        pub fn new(timeout: Duration) -> Self {
            Self { timeout }
        }
    }

    impl<S> tower::Layer<S> for TimeoutLayer {
        type Service = TimeoutService<S>;

        fn layer(&self, inner: S) -> Self::Service {
            TimeoutService {
                service: inner,
                timeout: self.timeout,
            }
        }
    }

    /// A [tower::Service] which reports [`hyperdriver::client::Error::RequestTimeout`]
    /// when the inner service is too slow.
    #[derive(Debug, Clone)]
    pub struct TimeoutService<S> {
        service: S,
        timeout: Duration,
    }

    impl<S, R> tower::Service<R> for TimeoutService<S>
    where
        S: tower::Service<R, Error = hyperdriver::client::Error>,
    {
        type Response = S::Response;
        type Error = hyperdriver::client::Error;
        type Future = TimeoutFuture<S::Future, S::Response>;

        fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.service.poll_ready(cx)
        }

        fn call(&mut self, req: R) -> Self::Future {
            TimeoutFuture::new(self.service.call(req), self.timeout)
        }
    }

    #[pin_project]
    #[derive(Debug)]
    pub struct TimeoutFuture<F, R> {
        #[pin]
        future: Timeout<F>,
        response: PhantomData<fn() -> R>,
    }

    impl<F, R> TimeoutFuture<F, R> {
        fn new<I>(future: I, timeout: Duration) -> Self
        where
            I: IntoFuture<IntoFuture = F>,
        {
            Self {
                future: tokio::time::timeout(timeout, future),
                response: PhantomData,
            }
        }
    }

    impl<F, R> Future for TimeoutFuture<F, R>
    where
        F: Future<Output = Result<R, hyperdriver::client::Error>>,
    {
        type Output = Result<R, hyperdriver::client::Error>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            Poll::Ready(match ready!(self.project().future.poll(cx)) {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(error),
                Err(_) => {
                    tracing::debug!("Upstream request timed out");
                    Err(hyperdriver::client::Error::RequestTimeout)
                }
            })
        }
    }
}
