//! Demo HTTP server: serves `GET /toto` with a server span carrying two
//! events, parented to whatever trace the caller propagates.

use std::convert::Infallible;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use tracekit::{StdoutExporter, TraceContext, TraceError, Tracer};
use tracekit_collector::CollectorExporter;
use tracekit_http::traced;

fn init_tracer(service_name: &str) -> Result<Tracer, TraceError> {
    let builder = Tracer::builder();
    match env::var("TRACE_DEMO_COLLECTOR_ENDPOINT") {
        Ok(endpoint) => {
            let mut exporter = CollectorExporter::builder()
                .with_endpoint(endpoint)
                .with_service_name(service_name);
            if let Ok(api_key) = env::var("TRACE_DEMO_API_KEY") {
                exporter = exporter.with_api_key(api_key);
            }
            Ok(builder.with_batch_exporter(exporter.build()?).build())
        }
        Err(_) => Ok(builder.with_batch_exporter(StdoutExporter::new()).build()),
    }
}

async fn handle_toto(cx: TraceContext) -> Response<Full<Bytes>> {
    cx.span().add_event("starting work", vec![]);
    tokio::time::sleep(Duration::from_millis(1)).await;
    cx.span().add_event("pass sleep", vec![]);
    Response::new(Full::new(Bytes::from("toto\ndone\n")))
}

async fn router(tracer: Tracer, req: Request<Incoming>) -> Response<Full<Bytes>> {
    traced(&tracer, req, |cx, req| async move {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/toto") => handle_toto(cx).await,
            _ => {
                let mut not_found = Response::new(Full::new(Bytes::new()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                not_found
            }
        }
    })
    .await
}

async fn serve(tracer: Tracer) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = env::var("TRACE_DEMO_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "toto-server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let tracer = tracer.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let tracer = tracer.clone();
                async move { Ok::<_, Infallible>(router(tracer, req).await) }
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(error = %err, "connection error");
            }
        });
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Build the tracer before entering the runtime so the exporter's
    // blocking transport never touches an async context.
    let tracer = init_tracer("toto-server")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(tracer.clone()));

    if let Err(err) = tracer.shutdown() {
        tracing::warn!(error = %err, "tracer shutdown failed");
    }
    result
}
