use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client, Error};
use hyper_util::rt::TokioExecutor;

use tracekit::{KeyValue, SpanKind, Status, TraceContext, TraceContextPropagator, Tracer};

use crate::{HeaderInjector, HttpError};

/// An HTTP client that starts a client span around every request it sends
/// and propagates the span context on the wire.
///
/// The span is named `{method} {path}`, carries [`SpanKind::Client`], and
/// ends when the response headers arrive or the transport fails. The
/// response is returned unchanged either way; instrumentation never alters
/// the outcome of the request.
#[derive(Clone)]
pub struct TracedClient {
    inner: Client<HttpConnector, Full<Bytes>>,
    tracer: Tracer,
    propagator: TraceContextPropagator,
}

impl std::fmt::Debug for TracedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedClient")
            .field("tracer", &self.tracer)
            .finish()
    }
}

impl TracedClient {
    /// Create a new client that records its spans through `tracer`.
    pub fn new(tracer: Tracer) -> Self {
        TracedClient {
            inner: Client::builder(TokioExecutor::new()).build_http(),
            tracer,
            propagator: TraceContextPropagator::new(),
        }
    }

    /// Send `req`, recording it as a child span of the span in `cx`.
    pub async fn request(
        &self,
        cx: &TraceContext,
        mut req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, Error> {
        let mut span = self
            .tracer
            .span_builder(format!("{} {}", req.method(), req.uri().path()))
            .with_kind(SpanKind::Client)
            .start_with_context(&self.tracer, cx);

        self.propagator.inject_span_context(
            span.span_context(),
            &mut HeaderInjector(req.headers_mut()),
        );

        let result = self.inner.request(req).await;
        match &result {
            Ok(response) => {
                span.set_attribute(KeyValue::new(
                    "http.response.status_code",
                    i64::from(response.status().as_u16()),
                ));
                if response.status().is_server_error() {
                    span.set_status(Status::error(
                        response.status().canonical_reason().unwrap_or("server error"),
                    ));
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "request failed");
                span.set_status(Status::error(err.to_string()));
            }
        }
        span.end();
        result
    }

    /// Send a GET request to `uri` with an empty body.
    pub async fn get(
        &self,
        cx: &TraceContext,
        uri: Uri,
    ) -> Result<Response<Incoming>, HttpError> {
        let req = Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))?;
        self.request(cx, req).await.map_err(Into::into)
    }
}
