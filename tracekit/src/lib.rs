//! A small distributed tracing kit.
//!
//! `tracekit` provides the vocabulary types of a trace (trace and span ids,
//! span contexts, events, attributes), a [`Tracer`] that creates spans and
//! drives them through processors to pluggable [`SpanExporter`]s, and a
//! [`TraceContextPropagator`] that carries a span context across process
//! boundaries as a `traceparent` header.
//!
//! There are no globals: the [`Tracer`] is an explicit handle constructed
//! once and passed to every component that starts spans, and the active span
//! travels in an explicit [`TraceContext`] value.
//!
//! ```
//! use tracekit::{InMemoryExporter, TraceContext, Tracer};
//!
//! let exporter = InMemoryExporter::default();
//! let tracer = Tracer::builder()
//!     .with_simple_exporter(exporter.clone())
//!     .build();
//!
//! let mut parent = tracer.start("request");
//! parent.add_event("validated", vec![]);
//! let cx = TraceContext::with_span(parent);
//!
//! let mut child = tracer.start_with_context("query", &cx);
//! child.end();
//! cx.span().end();
//!
//! assert_eq!(exporter.finished_spans().unwrap().len(), 2);
//! ```

#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]

mod common;
mod context;
mod error;
mod export;
mod id;
mod processor;
mod propagation;
mod span;
mod tracer;

pub use common::{Key, KeyValue, Value};
pub use context::{SpanRef, TraceContext};
pub use error::{TraceError, TraceResult};
pub use export::{ExportResult, InMemoryExporter, SpanExporter, StdoutExporter};
pub use id::{
    IdGenerator, RandomIdGenerator, SequentialIdGenerator, SpanId, TraceFlags, TraceId,
};
pub use processor::{
    BatchConfig, BatchConfigBuilder, BatchSpanProcessor, BatchSpanProcessorBuilder,
    SimpleSpanProcessor, SpanProcessor,
};
pub use propagation::{
    Extractor, Injector, TraceContextPropagator, TRACEPARENT_HEADER,
};
pub use span::{Event, Span, SpanContext, SpanData, SpanKind, Status};
pub use tracer::{SpanBuilder, Tracer, TracerBuilder};
