//! Demo HTTP client: runs one root span named "Bar" around a `GET /toto`
//! call, then flushes everything out before exiting.

use std::env;

use http_body_util::BodyExt;
use tracing_subscriber::EnvFilter;

use tracekit::{KeyValue, StdoutExporter, TraceContext, TraceError, Tracer};
use tracekit_collector::CollectorExporter;
use tracekit_http::TracedClient;

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

async fn run(tracer: Tracer) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let endpoint = env::var("TRACE_DEMO_SERVER_ENDPOINT")
        .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    let client = TracedClient::new(tracer.clone());

    let span = tracer
        .span_builder("Bar")
        .with_attributes([KeyValue::new("peer.service", "toto-server")])
        .start(&tracer);
    let cx = TraceContext::with_span(span);

    let uri: hyper::Uri = format!("{endpoint}/toto").parse()?;
    let result = async {
        let response = client.get(&cx, uri).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        print!("{}", String::from_utf8_lossy(&body));
        tracing::info!(%status, "response received");
        Ok(())
    }
    .await;

    cx.span().end();
    result
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Build the tracer before entering the runtime so the exporter's
    // blocking transport never touches an async context.
    let tracer = init_tracer("toto-client")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(tracer.clone()));

    if let Err(err) = tracer.force_flush() {
        tracing::warn!(error = %err, "flush failed, some spans may be lost");
    }
    if let Err(err) = tracer.shutdown() {
        tracing::warn!(error = %err, "tracer shutdown failed");
    }
    result
}
