//! A [`SpanExporter`] that posts finished spans as JSON batches to a
//! collector's HTTP endpoint.
//!
//! The exporter is handed batches by a span processor and runs on that
//! processor's thread, so it uses a blocking HTTP client; export never
//! requires an async runtime. Construction validates the endpoint and fails
//! fast, before the exporter is attached to a pipeline.
//!
//! ```no_run
//! use tracekit::Tracer;
//! use tracekit_collector::CollectorExporter;
//!
//! # fn main() -> Result<(), tracekit::TraceError> {
//! let exporter = CollectorExporter::builder()
//!     .with_endpoint("http://localhost:4318/v1/traces")
//!     .with_service_name("toto-server")
//!     .build()?;
//! let tracer = Tracer::builder().with_batch_exporter(exporter).build();
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use serde::Serialize;

use tracekit::{
    ExportResult, KeyValue, SpanData, SpanExporter, SpanKind, Status, TraceError, Value,
};

const DEFAULT_SERVICE_NAME: &str = "unknown_service";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const API_KEY_HEADER: &str = "x-api-key";

/// Exports span batches to a collector over HTTP as JSON.
///
/// Create one with [`CollectorExporter::builder`].
#[derive(Debug)]
pub struct CollectorExporter {
    client: Option<reqwest::blocking::Client>,
    endpoint: reqwest::Url,
    api_key: Option<String>,
    service_name: String,
}

impl CollectorExporter {
    /// Create a builder for a collector exporter.
    pub fn builder() -> CollectorExporterBuilder {
        CollectorExporterBuilder::default()
    }
}

impl SpanExporter for CollectorExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = match &self.client {
            None => Err(TraceError::AlreadyShutdown),
            Some(client) => {
                let payload = WireBatch {
                    service_name: &self.service_name,
                    spans: batch.iter().map(WireSpan::from_span_data).collect(),
                };
                let mut request = client.post(self.endpoint.clone()).json(&payload);
                if let Some(api_key) = &self.api_key {
                    request = request.header(API_KEY_HEADER, api_key);
                }
                request
                    .send()
                    .map_err(|err| TraceError::ExportFailed(Box::new(err)))
                    .and_then(|response| {
                        let status = response.status();
                        if status.is_success() {
                            Ok(())
                        } else {
                            Err(TraceError::ExportFailed(
                                format!("collector returned {status}").into(),
                            ))
                        }
                    })
            }
        };
        if let Err(err) = &result {
            tracing::debug!(error = %err, "collector export failed");
        }
        Box::pin(futures_util::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.client = None;
    }
}

/// Configures and builds a [`CollectorExporter`].
#[derive(Debug, Default)]
pub struct CollectorExporterBuilder {
    endpoint: Option<String>,
    api_key: Option<String>,
    service_name: Option<String>,
    timeout: Option<Duration>,
}

impl CollectorExporterBuilder {
    /// Set the collector endpoint URL the exporter posts batches to.
    /// Required.
    pub fn with_endpoint<T: Into<String>>(mut self, endpoint: T) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set an API key sent with every request in the `x-api-key` header.
    pub fn with_api_key<T: Into<String>>(mut self, api_key: T) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the service name reported with every batch. Defaults to
    /// `unknown_service`.
    pub fn with_service_name<T: Into<String>>(mut self, service_name: T) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Set the per-request timeout. Defaults to 10 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the exporter, validating the configuration.
    ///
    /// Fails with [`TraceError::Configuration`] when the endpoint is missing
    /// or not a valid URL, so a misconfigured pipeline is caught at startup
    /// rather than at the first export.
    pub fn build(self) -> Result<CollectorExporter, TraceError> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| TraceError::Configuration("collector endpoint is required".into()))?;
        let endpoint = endpoint.parse::<reqwest::Url>().map_err(|err| {
            TraceError::Configuration(format!("invalid collector endpoint {endpoint:?}: {err}"))
        })?;
        match endpoint.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(TraceError::Configuration(format!(
                    "unsupported collector endpoint scheme {scheme:?}, expected http or https"
                )))
            }
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|err| TraceError::Configuration(format!("cannot build http client: {err}")))?;

        Ok(CollectorExporter {
            client: Some(client),
            endpoint,
            api_key: self.api_key,
            service_name: self
                .service_name
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireBatch<'a> {
    service_name: &'a str,
    spans: Vec<WireSpan>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireSpan {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: String,
    kind: &'static str,
    start_time_unix_nano: u64,
    end_time_unix_nano: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<WireKeyValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<WireEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireKeyValue {
    key: String,
    value: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    name: String,
    time_unix_nano: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<WireKeyValue>,
}

impl WireSpan {
    fn from_span_data(span: &SpanData) -> Self {
        WireSpan {
            trace_id: span.span_context.trace_id().to_string(),
            span_id: span.span_context.span_id().to_string(),
            parent_span_id: (!span.is_root()).then(|| span.parent_span_id.to_string()),
            name: span.name.to_string(),
            kind: match span.span_kind {
                SpanKind::Client => "client",
                SpanKind::Server => "server",
                SpanKind::Internal => "internal",
            },
            start_time_unix_nano: unix_nanos(span.start_time),
            end_time_unix_nano: unix_nanos(span.end_time),
            attributes: span.attributes.iter().map(wire_key_value).collect(),
            events: span
                .events
                .iter()
                .map(|event| WireEvent {
                    name: event.name.to_string(),
                    time_unix_nano: unix_nanos(event.timestamp),
                    attributes: event.attributes.iter().map(wire_key_value).collect(),
                })
                .collect(),
            error: match &span.status {
                Status::Error { description } => Some(description.to_string()),
                Status::Unset | Status::Ok => None,
            },
        }
    }
}

fn wire_key_value(kv: &KeyValue) -> WireKeyValue {
    WireKeyValue {
        key: kv.key.as_str().to_string(),
        value: match &kv.value {
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::I64(v) => serde_json::Value::from(*v),
            Value::F64(v) => serde_json::Value::from(*v),
            Value::String(v) => serde_json::Value::String(v.to_string()),
        },
    }
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracekit::{Event, SpanContext, SpanId, TraceFlags, TraceId};

    fn sample_span() -> SpanData {
        let start = UNIX_EPOCH + Duration::from_secs(1);
        SpanData {
            span_context: SpanContext::new(
                TraceId::from(0xa3ce929d0e0e4736u128),
                SpanId::from(0x00f067aa0ba902b7u64),
                TraceFlags::SAMPLED,
                false,
            ),
            parent_span_id: SpanId::from(0x1au64),
            span_kind: SpanKind::Server,
            name: "GET /toto".into(),
            start_time: start,
            end_time: start + Duration::from_millis(2),
            attributes: vec![KeyValue::new("http.response.status_code", 200i64)],
            events: vec![Event::new("pass sleep", start + Duration::from_millis(1), vec![])],
            status: Status::error("boom"),
        }
    }

    #[test]
    fn wire_span_serializes_ids_and_times() {
        let wire = serde_json::to_value(WireSpan::from_span_data(&sample_span())).unwrap();
        assert_eq!(wire["traceId"], "0000000000000000a3ce929d0e0e4736");
        assert_eq!(wire["spanId"], "00f067aa0ba902b7");
        assert_eq!(wire["parentSpanId"], "000000000000001a");
        assert_eq!(wire["kind"], "server");
        assert_eq!(wire["startTimeUnixNano"], 1_000_000_000u64);
        assert_eq!(wire["endTimeUnixNano"], 1_002_000_000u64);
        assert_eq!(wire["events"][0]["name"], "pass sleep");
        assert_eq!(wire["events"][0]["timeUnixNano"], 1_001_000_000u64);
        assert_eq!(wire["attributes"][0]["key"], "http.response.status_code");
        assert_eq!(wire["attributes"][0]["value"], 200);
        assert_eq!(wire["error"], "boom");
    }

    #[test]
    fn root_spans_omit_the_parent_field() {
        let mut span = sample_span();
        span.parent_span_id = SpanId::INVALID;
        span.status = Status::Unset;
        let wire = serde_json::to_value(WireSpan::from_span_data(&span)).unwrap();
        assert!(wire.get("parentSpanId").is_none());
        assert!(wire.get("error").is_none());
    }

    #[test]
    fn builder_requires_an_endpoint() {
        let result = CollectorExporter::builder().build();
        assert!(matches!(result, Err(TraceError::Configuration(_))));
    }

    #[test]
    fn builder_rejects_a_malformed_endpoint() {
        let result = CollectorExporter::builder()
            .with_endpoint("not a url")
            .build();
        assert!(matches!(result, Err(TraceError::Configuration(_))));
    }

    #[test]
    fn builder_accepts_an_https_endpoint_with_api_key() {
        // Hosted backends are reached over https; the transport must be
        // able to carry that scheme, so construction accepts it.
        let result = CollectorExporter::builder()
            .with_endpoint("https://api.tracing-backend.test/v1/traces")
            .with_api_key("secret")
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn builder_rejects_an_unsupported_scheme() {
        let result = CollectorExporter::builder()
            .with_endpoint("ftp://collector.local/traces")
            .build();
        assert!(matches!(result, Err(TraceError::Configuration(_))));
    }

    #[test]
    fn export_fails_after_shutdown() {
        let mut exporter = CollectorExporter::builder()
            .with_endpoint("http://localhost:4318/v1/traces")
            .build()
            .unwrap();
        exporter.shutdown();
        let result = futures_executor::block_on(exporter.export(vec![sample_span()]));
        assert!(matches!(result, Err(TraceError::AlreadyShutdown)));
    }
}
