//! Span exporters and the interface between processors and transports.

use std::fmt::Debug;
use std::io::Write;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;

use crate::error::{TraceError, TraceResult};
use crate::span::SpanData;

/// Results of an export attempt.
pub type ExportResult = TraceResult<()>;

/// Delivers batches of finished spans to a backend.
///
/// Exporters receive already-sampled spans from a processor and hand them
/// to a transport or sink. They must not block the span-owning thread; the
/// processor decides how the returned future is driven.
pub trait SpanExporter: Send + Sync + Debug {
    /// Exports a batch of finished spans.
    ///
    /// Batch sizing is the processor's concern; an exporter sees whatever
    /// the processor accumulated, which is never empty.
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter. Buffered state should be released; export
    /// calls after shutdown should fail.
    fn shutdown(&mut self) {}

    /// Flushes any spans the exporter itself buffers. The built-in
    /// exporters buffer nothing, so the default is a no-op.
    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        Box::pin(futures_util::future::ready(Ok(())))
    }
}

/// Writes one line per finished span to stdout.
///
/// Intended for debugging and as the fallback when no collector endpoint is
/// configured.
#[derive(Debug, Default)]
pub struct StdoutExporter {
    is_shutdown: bool,
}

impl StdoutExporter {
    /// Create a new stdout exporter.
    pub fn new() -> Self {
        StdoutExporter::default()
    }
}

impl SpanExporter for StdoutExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        if self.is_shutdown {
            return Box::pin(futures_util::future::ready(Err(
                TraceError::AlreadyShutdown,
            )));
        }
        let result = {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            batch.iter().try_for_each(|span| {
                writeln!(
                    handle,
                    "{} {:?} trace={} span={} parent={} events={}",
                    span.name,
                    span.span_kind,
                    span.span_context.trace_id(),
                    span.span_context.span_id(),
                    span.parent_span_id,
                    span.events.len(),
                )
            })
        };
        Box::pin(futures_util::future::ready(
            result.map_err(|err| TraceError::ExportFailed(Box::new(err))),
        ))
    }

    fn shutdown(&mut self) {
        self.is_shutdown = true;
    }
}

/// Stores finished spans in memory for inspection by tests.
///
/// ```
/// use tracekit::{InMemoryExporter, Tracer};
///
/// let exporter = InMemoryExporter::default();
/// let tracer = Tracer::builder()
///     .with_simple_exporter(exporter.clone())
///     .build();
/// tracer.start("work").end();
/// assert_eq!(exporter.finished_spans().unwrap().len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemoryExporter {
    /// Returns a copy of the finished spans received so far.
    pub fn finished_spans(&self) -> TraceResult<Vec<SpanData>> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .map_err(|err| TraceError::Other(format!("cannot lock span store: {err}")))
    }

    /// Clears the stored spans.
    pub fn reset(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .spans
            .lock()
            .map(|mut spans| spans.extend(batch))
            .map_err(|err| TraceError::Other(format!("cannot lock span store: {err}")));
        Box::pin(futures_util::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::Tracer;

    #[test]
    fn in_memory_exporter_collects_and_resets() {
        let exporter = InMemoryExporter::default();
        let tracer = Tracer::builder()
            .with_simple_exporter(exporter.clone())
            .build();

        tracer.start("first").end();
        tracer.start("second").end();
        assert_eq!(exporter.finished_spans().unwrap().len(), 2);

        exporter.reset();
        assert!(exporter.finished_spans().unwrap().is_empty());
    }

    #[test]
    fn stdout_exporter_fails_after_shutdown() {
        let mut exporter = StdoutExporter::new();
        exporter.shutdown();
        let result = futures_executor::block_on(exporter.export(vec![]));
        assert!(matches!(result, Err(TraceError::AlreadyShutdown)));
    }
}
