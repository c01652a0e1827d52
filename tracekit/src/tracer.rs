//! # Tracer
//!
//! The `Tracer` is the process-wide factory for spans. It is an explicit
//! handle constructed once at startup and passed (cloned) to every
//! component that starts spans; there is no global registry.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::common::KeyValue;
use crate::context::TraceContext;
use crate::error::{TraceError, TraceResult};
use crate::export::SpanExporter;
use crate::id::{IdGenerator, RandomIdGenerator, SpanId, TraceFlags};
use crate::processor::{BatchSpanProcessor, SimpleSpanProcessor, SpanProcessor};
use crate::span::{Span, SpanContext, SpanData, SpanKind, Status};

struct TracerInner {
    id_generator: Box<dyn IdGenerator>,
    processors: Vec<Box<dyn SpanProcessor>>,
    is_shutdown: AtomicBool,
}

/// Creates and manages spans, and owns the processor chain finished spans
/// are handed to.
///
/// `Tracer` is cheap to clone; all clones share the same processors.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("processors", &self.inner.processors.len())
            .finish()
    }
}

impl Tracer {
    /// Create a [`TracerBuilder`] to configure a new tracer.
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    /// Start a new root span with the given name.
    pub fn start<T>(&self, name: T) -> Span
    where
        T: Into<Cow<'static, str>>,
    {
        self.build_with_context(SpanBuilder::from_name(name), &TraceContext::new())
    }

    /// Start a new span with the given name, as a child of the span in
    /// `parent_cx` if one is present.
    pub fn start_with_context<T>(&self, name: T, parent_cx: &TraceContext) -> Span
    where
        T: Into<Cow<'static, str>>,
    {
        self.build_with_context(SpanBuilder::from_name(name), parent_cx)
    }

    /// Create a [`SpanBuilder`] for a span with the given name.
    pub fn span_builder<T>(&self, name: T) -> SpanBuilder
    where
        T: Into<Cow<'static, str>>,
    {
        SpanBuilder::from_name(name)
    }

    /// Starts a span from a [`SpanBuilder`].
    ///
    /// The new span reuses the parent's trace id when `parent_cx` carries a
    /// span (live or remote) and mints a fresh trace id otherwise. A span id
    /// is always newly minted. Root spans are sampled unconditionally;
    /// children inherit the parent's sampled flag.
    pub fn build_with_context(&self, mut builder: SpanBuilder, parent_cx: &TraceContext) -> Span {
        // No point starting a recording span once the tracer has shut down.
        if self.inner.is_shutdown.load(Ordering::Relaxed) {
            return Span::new(SpanContext::empty_context(), None, self.clone());
        }

        let span_id = self.inner.id_generator.new_span_id();
        let parent = parent_cx.span();
        let parent_span_context = parent.span_context();

        let (trace_id, parent_span_id, trace_flags) = if parent_span_context.is_valid() {
            (
                parent_span_context.trace_id(),
                parent_span_context.span_id(),
                parent_span_context.trace_flags() & TraceFlags::SAMPLED,
            )
        } else {
            (
                self.inner.id_generator.new_trace_id(),
                SpanId::INVALID,
                TraceFlags::SAMPLED,
            )
        };

        let span_context = SpanContext::new(trace_id, span_id, trace_flags, false);
        let start_time = builder.start_time.unwrap_or_else(SystemTime::now);

        let data = SpanData {
            span_context: span_context.clone(),
            parent_span_id,
            span_kind: builder.span_kind.take().unwrap_or(SpanKind::Internal),
            name: builder.name,
            start_time,
            end_time: start_time,
            attributes: builder.attributes.take().unwrap_or_default(),
            events: Vec::new(),
            status: Status::Unset,
        };

        Span::new(span_context, Some(data), self.clone())
    }

    /// Hand a finished span to every registered processor.
    ///
    /// Called from `Span::end`; must stay non-blocking beyond the
    /// processors' bounded local hand-off.
    pub(crate) fn on_span_end(&self, span: SpanData) {
        if self.inner.is_shutdown.load(Ordering::Relaxed) {
            tracing::debug!(name = %span.name, "tracer shut down; dropping span");
            return;
        }
        let mut remaining = self.inner.processors.len();
        for processor in &self.inner.processors {
            remaining -= 1;
            if remaining == 0 {
                processor.on_end(span);
                break;
            }
            processor.on_end(span.clone());
        }
    }

    /// Flush all processors, blocking until every span accepted before this
    /// call has been handed to its exporter's transport or the processor's
    /// deadline elapses.
    ///
    /// Returns the first failure; `TraceError::ExportTimedOut` reports a
    /// partial flush.
    pub fn force_flush(&self) -> TraceResult<()> {
        let mut result = Ok(());
        for processor in &self.inner.processors {
            if let Err(err) = processor.force_flush() {
                tracing::warn!(error = %err, "span processor flush failed");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Shut down all processors, flushing buffered spans first.
    ///
    /// Spans started after shutdown are non-recording. Shutting down more
    /// than once returns `TraceError::AlreadyShutdown`.
    pub fn shutdown(&self) -> TraceResult<()> {
        if self.inner.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        let mut result = Ok(());
        for processor in &self.inner.processors {
            if let Err(err) = processor.shutdown() {
                tracing::warn!(error = %err, "span processor shutdown failed");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

/// Entry point for building spans with non-default properties.
///
/// ```
/// use tracekit::{SpanKind, Tracer};
///
/// let tracer = Tracer::builder().build();
/// let mut span = tracer
///     .span_builder("request")
///     .with_kind(SpanKind::Client)
///     .start(&tracer);
/// span.end();
/// ```
#[derive(Clone, Debug, Default)]
pub struct SpanBuilder {
    /// Span name
    pub name: Cow<'static, str>,
    /// Span kind
    pub span_kind: Option<SpanKind>,
    /// Span start time, defaults to the moment the span starts
    pub start_time: Option<SystemTime>,
    /// Span attributes
    pub attributes: Option<Vec<KeyValue>>,
}

impl SpanBuilder {
    /// Create a new span builder from a span name.
    pub fn from_name<T: Into<Cow<'static, str>>>(name: T) -> Self {
        SpanBuilder {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Specify the span kind.
    pub fn with_kind(self, span_kind: SpanKind) -> Self {
        SpanBuilder {
            span_kind: Some(span_kind),
            ..self
        }
    }

    /// Specify the span start time.
    pub fn with_start_time(self, start_time: SystemTime) -> Self {
        SpanBuilder {
            start_time: Some(start_time),
            ..self
        }
    }

    /// Specify the span attributes.
    pub fn with_attributes<I>(self, attributes: I) -> Self
    where
        I: IntoIterator<Item = KeyValue>,
    {
        SpanBuilder {
            attributes: Some(attributes.into_iter().collect()),
            ..self
        }
    }

    /// Start a root span with this builder's properties.
    pub fn start(self, tracer: &Tracer) -> Span {
        tracer.build_with_context(self, &TraceContext::new())
    }

    /// Start a span with this builder's properties, parented to the span in
    /// `parent_cx` if one is present.
    pub fn start_with_context(self, tracer: &Tracer, parent_cx: &TraceContext) -> Span {
        tracer.build_with_context(self, parent_cx)
    }
}

/// Configures and builds a [`Tracer`].
#[derive(Debug, Default)]
pub struct TracerBuilder {
    id_generator: Option<Box<dyn IdGenerator>>,
    processors: Vec<Box<dyn SpanProcessor>>,
}

impl TracerBuilder {
    /// The [`IdGenerator`] the tracer should use, defaults to
    /// [`RandomIdGenerator`].
    pub fn with_id_generator<G: IdGenerator + 'static>(mut self, id_generator: G) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Register a [`SpanProcessor`]. Processors are invoked in registration
    /// order.
    pub fn with_span_processor<P: SpanProcessor + 'static>(mut self, processor: P) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Register the given exporter behind a [`SimpleSpanProcessor`] that
    /// exports each span synchronously as it ends. Useful for debugging and
    /// testing.
    pub fn with_simple_exporter<E: SpanExporter + 'static>(self, exporter: E) -> Self {
        self.with_span_processor(SimpleSpanProcessor::new(Box::new(exporter)))
    }

    /// Register the given exporter behind a [`BatchSpanProcessor`] with the
    /// default batch configuration.
    pub fn with_batch_exporter<E: SpanExporter + Send + 'static>(self, exporter: E) -> Self {
        self.with_span_processor(BatchSpanProcessor::builder(exporter).build())
    }

    /// Build the configured tracer.
    ///
    /// A tracer built without processors is valid: spans can be started and
    /// ended but nothing is ever exported.
    pub fn build(self) -> Tracer {
        Tracer {
            inner: Arc::new(TracerInner {
                id_generator: self
                    .id_generator
                    .unwrap_or_else(|| Box::<RandomIdGenerator>::default()),
                processors: self.processors,
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::InMemoryExporter;
    use crate::id::{SequentialIdGenerator, TraceId};

    fn test_tracer() -> (Tracer, InMemoryExporter) {
        let exporter = InMemoryExporter::default();
        let tracer = Tracer::builder()
            .with_id_generator(SequentialIdGenerator::new())
            .with_simple_exporter(exporter.clone())
            .build();
        (tracer, exporter)
    }

    #[test]
    fn root_span_mints_trace_id_and_has_no_parent() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer.start("root");
        span.end();

        let spans = exporter.finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].is_root());
        assert_ne!(spans[0].span_context.trace_id(), TraceId::INVALID);
        assert!(spans[0].span_context.is_sampled());
    }

    #[test]
    fn child_span_reuses_trace_id_and_records_parent() {
        let (tracer, exporter) = test_tracer();
        let parent = tracer.start("parent");
        let parent_context = parent.span_context().clone();
        let cx = TraceContext::with_span(parent);

        let mut child = tracer.start_with_context("child", &cx);
        assert_eq!(
            child.span_context().trace_id(),
            parent_context.trace_id()
        );
        assert_ne!(child.span_context().span_id(), parent_context.span_id());
        child.end();
        cx.span().end();

        let spans = exporter.finished_spans().unwrap();
        let child_data = spans.iter().find(|s| s.name == "child").unwrap();
        assert_eq!(child_data.parent_span_id, parent_context.span_id());
    }

    #[test]
    fn remote_parent_links_child_across_processes() {
        let (tracer, exporter) = test_tracer();
        let remote = SpanContext::new(
            TraceId::from(0xa1u128),
            SpanId::from(0xb2u64),
            TraceFlags::SAMPLED,
            true,
        );
        let cx = TraceContext::with_remote_span_context(remote.clone());
        let mut span = tracer.start_with_context("server", &cx);
        span.end();

        let spans = exporter.finished_spans().unwrap();
        assert_eq!(spans[0].span_context.trace_id(), remote.trace_id());
        assert_eq!(spans[0].parent_span_id, remote.span_id());
    }

    #[test]
    fn unsampled_parent_produces_unsampled_child() {
        let (tracer, _exporter) = test_tracer();
        let remote = SpanContext::new(
            TraceId::from(1u128),
            SpanId::from(2u64),
            TraceFlags::NOT_SAMPLED,
            true,
        );
        let cx = TraceContext::with_remote_span_context(remote);
        let span = tracer.start_with_context("child", &cx);
        assert!(!span.span_context().is_sampled());
    }

    #[test]
    fn builder_attributes_and_kind_reach_span_data() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer
            .span_builder("request")
            .with_kind(SpanKind::Client)
            .with_attributes([KeyValue::new("peer.service", "toto-server")])
            .start(&tracer);
        span.end();

        let spans = exporter.finished_spans().unwrap();
        assert_eq!(spans[0].span_kind, SpanKind::Client);
        assert_eq!(spans[0].attributes[0].key.as_str(), "peer.service");
    }

    #[test]
    fn spans_after_shutdown_are_not_recording() {
        let (tracer, exporter) = test_tracer();
        tracer.shutdown().unwrap();
        let span = tracer.start("late");
        assert!(!span.is_recording());
        drop(span);
        assert!(exporter.finished_spans().unwrap().is_empty());
        assert!(matches!(
            tracer.shutdown(),
            Err(TraceError::AlreadyShutdown)
        ));
    }

    #[test]
    fn tracer_without_processors_is_valid() {
        let tracer = Tracer::builder().build();
        let mut span = tracer.start("unexported");
        assert!(span.is_recording());
        span.end();
        tracer.force_flush().unwrap();
    }
}
