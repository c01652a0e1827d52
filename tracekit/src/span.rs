//! # Span
//!
//! `Span`s represent a single timed operation within a trace. `Span`s can be
//! nested to form a trace tree. Each trace contains a root span, which
//! typically describes the end-to-end latency, and one or more sub-spans for
//! its sub-operations.
//!
//! A `Span`'s start time is set on creation. After that it is possible to
//! add [`Event`]s and attributes, until the span's end time has been set by
//! [`Span::end`]; afterwards all mutation is a no-op.

use std::borrow::Cow;
use std::time::SystemTime;

use crate::common::KeyValue;
use crate::id::{SpanId, TraceFlags, TraceId};
use crate::tracer::Tracer;

/// Immutable portion of a [`Span`] which can be serialized and propagated.
///
/// A new `SpanContext` is derived, never edited, when a child span starts.
/// Spans that do not have the `sampled` flag set in their [`TraceFlags`]
/// are skipped by the built-in processors.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpanContext {
    trace_id: TraceId,
    span_id: SpanId,
    trace_flags: TraceFlags,
    is_remote: bool,
}

impl SpanContext {
    /// An invalid span context
    pub const NONE: SpanContext = SpanContext {
        trace_id: TraceId::INVALID,
        span_id: SpanId::INVALID,
        trace_flags: TraceFlags::NOT_SAMPLED,
        is_remote: false,
    };

    /// Create an invalid empty span context
    pub fn empty_context() -> Self {
        SpanContext::NONE
    }

    /// Construct a new `SpanContext`
    pub fn new(trace_id: TraceId, span_id: SpanId, trace_flags: TraceFlags, is_remote: bool) -> Self {
        SpanContext {
            trace_id,
            span_id,
            trace_flags,
            is_remote,
        }
    }

    /// The [`TraceId`] for this span context.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The [`SpanId`] for this span context.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Returns details about the trace.
    pub fn trace_flags(&self) -> TraceFlags {
        self.trace_flags
    }

    /// Returns `true` if the span context has a valid (non-zero) `trace_id`
    /// and a valid (non-zero) `span_id`.
    pub fn is_valid(&self) -> bool {
        self.trace_id != TraceId::INVALID && self.span_id != SpanId::INVALID
    }

    /// Returns `true` if the span context was propagated from a remote parent.
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    /// Returns `true` if the `sampled` trace flag is set.
    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }
}

/// Describes the relationship between the span and its callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    /// The span describes an outbound request to some remote service.
    Client,
    /// The span describes the server-side handling of an inbound request.
    Server,
    /// Default value. The span describes an internal operation.
    Internal,
}

/// The status of a [`Span`].
///
/// These values form a total order: Ok > Error > Unset.
#[derive(Clone, Debug, Default, PartialEq, PartialOrd)]
pub enum Status {
    /// The default status.
    #[default]
    Unset,

    /// The operation contains an error.
    Error {
        /// The description of the error
        description: Cow<'static, str>,
    },

    /// The operation has been validated by an application developer or
    /// operator to have completed successfully.
    Ok,
}

impl Status {
    /// Create a new error status with a given description.
    pub fn error(description: impl Into<Cow<'static, str>>) -> Self {
        Status::Error {
            description: description.into(),
        }
    }
}

/// A timestamped annotation on a [`Span`].
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// The name of this event.
    pub name: Cow<'static, str>,
    /// The wall clock time at which the event occurred.
    pub timestamp: SystemTime,
    /// Attributes describing the event.
    pub attributes: Vec<KeyValue>,
}

impl Event {
    /// Create a new event.
    pub fn new<T: Into<Cow<'static, str>>>(
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) -> Self {
        Event {
            name: name.into(),
            timestamp,
            attributes,
        }
    }

    /// Create a new event with the current time and no attributes.
    pub fn with_name<T: Into<Cow<'static, str>>>(name: T) -> Self {
        Event {
            name: name.into(),
            timestamp: SystemTime::now(),
            attributes: Vec::new(),
        }
    }
}

/// Everything a finished span carries into the exporter.
///
/// Ownership of the record transfers to the processor chain when the span
/// ends; the span itself can no longer be mutated afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// Exportable `SpanContext`
    pub span_context: SpanContext,
    /// Span parent id, `SpanId::INVALID` for root spans
    pub parent_span_id: SpanId,
    /// Span kind
    pub span_kind: SpanKind,
    /// Span name
    pub name: Cow<'static, str>,
    /// Span start time
    pub start_time: SystemTime,
    /// Span end time
    pub end_time: SystemTime,
    /// Span attributes
    pub attributes: Vec<KeyValue>,
    /// Span events
    pub events: Vec<Event>,
    /// Span status
    pub status: Status,
}

impl SpanData {
    /// Returns `true` if this span has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_span_id == SpanId::INVALID
    }
}

/// Single live operation within a trace.
///
/// The span is exclusively owned by the code path that created it. Ending
/// the span (explicitly or on drop) stamps the end time and hands the
/// collected [`SpanData`] to the tracer's processors exactly once.
#[derive(Debug)]
pub struct Span {
    span_context: SpanContext,
    data: Option<SpanData>,
    tracer: Tracer,
}

impl Span {
    pub(crate) fn new(span_context: SpanContext, data: Option<SpanData>, tracer: Tracer) -> Self {
        Span {
            span_context,
            data,
            tracer,
        }
    }

    /// Returns the `SpanContext` for the given `Span`.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// Returns `true` if this span is still collecting information.
    ///
    /// Always returns `false` after [`Span::end`].
    pub fn is_recording(&self) -> bool {
        self.data.is_some()
    }

    /// Record an event with the current time.
    pub fn add_event<T>(&mut self, name: T, attributes: Vec<KeyValue>)
    where
        T: Into<Cow<'static, str>>,
    {
        self.add_event_with_timestamp(name, SystemTime::now(), attributes)
    }

    /// Record an event at a specific time.
    pub fn add_event_with_timestamp<T>(
        &mut self,
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) where
        T: Into<Cow<'static, str>>,
    {
        if let Some(data) = self.data.as_mut() {
            data.events.push(Event::new(name, timestamp, attributes));
        }
    }

    /// Set a single attribute of this span.
    ///
    /// Setting an attribute with the same key as an existing attribute
    /// appends a new entry; exporters see the latest value last.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        if let Some(data) = self.data.as_mut() {
            data.attributes.push(attribute);
        }
    }

    /// Sets the status of this `Span`.
    ///
    /// Statuses only upgrade: `Ok` wins over `Error`, which wins over the
    /// default `Unset`.
    pub fn set_status(&mut self, status: Status) {
        if let Some(data) = self.data.as_mut() {
            if status > data.status {
                data.status = status;
            }
        }
    }

    /// Updates the span's name.
    pub fn update_name<T>(&mut self, new_name: T)
    where
        T: Into<Cow<'static, str>>,
    {
        if let Some(data) = self.data.as_mut() {
            data.name = new_name.into();
        }
    }

    /// Signals that the operation described by this span has now ended.
    ///
    /// Calling `end` more than once is a no-op: only the first call hands
    /// the span to the processors.
    pub fn end(&mut self) {
        self.end_with_timestamp(SystemTime::now());
    }

    /// Signals that the operation described by this span ended at `timestamp`.
    pub fn end_with_timestamp(&mut self, timestamp: SystemTime) {
        let Some(mut data) = self.data.take() else {
            return; // Already ended or never recording
        };
        // The end time never precedes the start time, even when the wall
        // clock steps backwards between the two calls.
        data.end_time = timestamp.max(data.start_time);
        self.tracer.on_span_end(data);
    }
}

impl Drop for Span {
    /// Ends the span if it was not already ended explicitly.
    fn drop(&mut self) {
        self.end();
    }
}
