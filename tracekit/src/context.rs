//! Explicit trace context passing.
//!
//! There is no ambient "current context" in this crate: every function that
//! starts or reads a span takes the [`TraceContext`] as an explicit
//! parameter. A context is a cheap handle; cloning it shares the same
//! underlying span.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::common::KeyValue;
use crate::span::{Span, SpanContext, Status};

static NOOP_SPAN: SynchronizedSpan = SynchronizedSpan {
    span_context: SpanContext::NONE,
    inner: None,
};

#[derive(Debug)]
pub(crate) struct SynchronizedSpan {
    /// Immutable span context
    span_context: SpanContext,
    /// Mutable span inner that requires synchronization
    inner: Option<Mutex<Span>>,
}

/// A request-scoped value carrying the active span, passed explicitly
/// through the code path that owns the request.
///
/// Contexts are immutable: deriving a context with a different span creates
/// a new value. A context produced by extraction from the wire carries a
/// remote [`SpanContext`] without a live span.
#[derive(Clone, Debug, Default)]
pub struct TraceContext {
    span: Option<Arc<SynchronizedSpan>>,
}

impl TraceContext {
    /// Create an empty context with no span.
    pub fn new() -> Self {
        TraceContext::default()
    }

    /// Create a context carrying the given live span.
    pub fn with_span(span: Span) -> Self {
        TraceContext {
            span: Some(Arc::new(SynchronizedSpan {
                span_context: span.span_context().clone(),
                inner: Some(Mutex::new(span)),
            })),
        }
    }

    /// Create a context carrying a span context propagated from a remote
    /// parent.
    ///
    /// This is useful for building propagators.
    pub fn with_remote_span_context(span_context: SpanContext) -> Self {
        TraceContext {
            span: Some(Arc::new(SynchronizedSpan {
                span_context,
                inner: None,
            })),
        }
    }

    /// Returns a reference to this context's span, or a no-op span if none
    /// has been set.
    pub fn span(&self) -> SpanRef<'_> {
        if let Some(span) = self.span.as_ref() {
            SpanRef(span)
        } else {
            SpanRef(&NOOP_SPAN)
        }
    }

    /// Returns whether or not an active span has been set.
    pub fn has_active_span(&self) -> bool {
        self.span.is_some()
    }
}

/// A reference to the active span in a [`TraceContext`].
#[derive(Debug)]
pub struct SpanRef<'a>(&'a SynchronizedSpan);

impl SpanRef<'_> {
    fn with_inner_mut<F: FnOnce(&mut Span)>(&self, f: F) {
        if let Some(ref inner) = self.0.inner {
            match inner.lock() {
                Ok(mut locked) => f(&mut locked),
                Err(err) => tracing::debug!(error = %err, "active span mutex poisoned"),
            }
        }
    }

    /// A reference to the span context of the span in this context.
    ///
    /// Also available for contexts carrying only a remote span context.
    pub fn span_context(&self) -> &SpanContext {
        &self.0.span_context
    }

    /// Record an event on the span in this context.
    pub fn add_event<T>(&self, name: T, attributes: Vec<KeyValue>)
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_inner_mut(|inner| inner.add_event(name, attributes))
    }

    /// Record an event with a timestamp on the span in this context.
    pub fn add_event_with_timestamp<T>(
        &self,
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) where
        T: Into<Cow<'static, str>>,
    {
        self.with_inner_mut(move |inner| inner.add_event_with_timestamp(name, timestamp, attributes))
    }

    /// Set an attribute on the span in this context.
    pub fn set_attribute(&self, attribute: KeyValue) {
        self.with_inner_mut(move |inner| inner.set_attribute(attribute))
    }

    /// Sets the status of the span in this context.
    pub fn set_status(&self, status: Status) {
        self.with_inner_mut(move |inner| inner.set_status(status))
    }

    /// Returns `true` if the span in this context is recording information.
    pub fn is_recording(&self) -> bool {
        self.0
            .inner
            .as_ref()
            .and_then(|inner| inner.lock().ok().map(|active| active.is_recording()))
            .unwrap_or(false)
    }

    /// Signals that the operation described by the span in this context has
    /// now ended.
    pub fn end(&self) {
        self.with_inner_mut(|inner| inner.end())
    }

    /// Signals that the operation ended at the given time.
    pub fn end_with_timestamp(&self, timestamp: SystemTime) {
        self.with_inner_mut(move |inner| inner.end_with_timestamp(timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::InMemoryExporter;
    use crate::tracer::Tracer;

    #[test]
    fn empty_context_has_noop_span() {
        let cx = TraceContext::new();
        assert!(!cx.has_active_span());
        assert_eq!(cx.span().span_context(), &SpanContext::NONE);
        // No-op operations must not panic.
        cx.span().add_event("ignored", vec![]);
        cx.span().end();
    }

    #[test]
    fn context_shares_one_span_across_clones() {
        let exporter = InMemoryExporter::default();
        let tracer = Tracer::builder()
            .with_simple_exporter(exporter.clone())
            .build();

        let cx = TraceContext::with_span(tracer.start("work"));
        let other = cx.clone();
        other.span().add_event("from clone", vec![]);
        cx.span().end();
        other.span().end(); // idempotent through the shared handle

        let spans = exporter.finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].events[0].name, "from clone");
    }

    #[test]
    fn remote_context_exposes_span_context_but_is_not_recording() {
        let remote = SpanContext::new(
            crate::TraceId::from(1u128),
            crate::SpanId::from(2u64),
            crate::TraceFlags::SAMPLED,
            true,
        );
        let cx = TraceContext::with_remote_span_context(remote.clone());
        assert!(cx.has_active_span());
        assert_eq!(cx.span().span_context(), &remote);
        assert!(!cx.span().is_recording());
    }
}
