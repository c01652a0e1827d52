use std::future::Future;

use http::{Request, Response};

use tracekit::{KeyValue, SpanKind, TraceContext, TraceContextPropagator, Tracer};

use crate::HeaderExtractor;

/// Wraps the handling of one inbound request in a server span.
///
/// The parent context is extracted from the request's `traceparent` header;
/// a missing or malformed header starts a fresh trace. The handler receives
/// a [`TraceContext`] carrying the live server span, so events and
/// attributes it records land on that span. The span ends once the handler's
/// response is ready, after the response status code is recorded.
///
/// ```no_run
/// # use http::{Request, Response};
/// # use http_body_util::Full;
/// # use bytes::Bytes;
/// # async fn handle(tracer: tracekit::Tracer, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
/// tracekit_http::traced(&tracer, req, |cx, _req| async move {
///     cx.span().add_event("starting work", vec![]);
///     Response::new(Full::new(Bytes::from("done")))
/// })
/// .await
/// # }
/// ```
pub async fn traced<B, RB, F, Fut>(tracer: &Tracer, req: Request<B>, handler: F) -> Response<RB>
where
    F: FnOnce(TraceContext, Request<B>) -> Fut,
    Fut: Future<Output = Response<RB>>,
{
    let propagator = TraceContextPropagator::new();
    let parent_cx = propagator.extract(&HeaderExtractor(req.headers()));

    let span = tracer
        .span_builder(format!("{} {}", req.method(), req.uri().path()))
        .with_kind(SpanKind::Server)
        .start_with_context(tracer, &parent_cx);
    let cx = TraceContext::with_span(span);

    let response = handler(cx.clone(), req).await;

    cx.span().set_attribute(KeyValue::new(
        "http.response.status_code",
        i64::from(response.status().as_u16()),
    ));
    cx.span().end();
    response
}
