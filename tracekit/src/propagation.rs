//! Cross-process context propagation.
//!
//! A span context crosses process boundaries as a single `traceparent`
//! text header in [W3C TraceContext] format:
//!
//! `traceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
//!
//! The four dash-separated fields are version, trace-id, parent-id and
//! trace-flags. Extraction is strict; a malformed header yields no remote
//! parent, so the receiver starts a fresh trace rather than corrupting an
//! existing one.
//!
//! [W3C TraceContext]: https://www.w3.org/TR/trace-context/

use std::collections::HashMap;

use crate::context::TraceContext;
use crate::id::{SpanId, TraceFlags, TraceId};
use crate::span::SpanContext;

/// The traceparent header name.
pub const TRACEPARENT_HEADER: &str = "traceparent";

const SUPPORTED_VERSION: u8 = 0;
const MAX_VERSION: u8 = 254;

/// Injector provides an interface for adding fields into an underlying
/// carrier, such as HTTP request headers.
pub trait Injector {
    /// Add a key and value to the underlying carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Extractor provides an interface for reading fields from an underlying
/// carrier, such as HTTP request headers.
pub trait Extractor {
    /// Get a value from a key in the underlying carrier.
    fn get(&self, key: &str) -> Option<&str>;

    /// Collect all the keys in the underlying carrier.
    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the HashMap.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the HashMap.
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(|v| v.as_str())
    }

    /// Collect all the keys from the HashMap.
    fn keys(&self) -> Vec<&str> {
        self.keys().map(|k| k.as_str()).collect::<Vec<_>>()
    }
}

/// Propagates span contexts in [W3C TraceContext] format under the
/// `traceparent` header.
///
/// [W3C TraceContext]: https://www.w3.org/TR/trace-context/
#[derive(Clone, Debug, Default)]
pub struct TraceContextPropagator {
    _private: (),
}

impl TraceContextPropagator {
    /// Create a new `TraceContextPropagator`.
    pub fn new() -> Self {
        TraceContextPropagator { _private: () }
    }

    /// Encode the given span context into the injector, if it is valid.
    ///
    /// Only the sampled bit of the flags is propagated; the remaining bits
    /// are reserved.
    pub fn inject_span_context(&self, span_context: &SpanContext, injector: &mut dyn Injector) {
        if span_context.is_valid() {
            let header_value = format!(
                "{:02x}-{}-{}-{:02x}",
                SUPPORTED_VERSION,
                span_context.trace_id(),
                span_context.span_id(),
                span_context.trace_flags() & TraceFlags::SAMPLED
            );
            injector.set(TRACEPARENT_HEADER, header_value);
        }
    }

    /// Encode the span context of the span in `cx` into the injector.
    pub fn inject_context(&self, cx: &TraceContext, injector: &mut dyn Injector) {
        self.inject_span_context(cx.span().span_context(), injector)
    }

    /// Extract a span context from a w3c trace-context header.
    fn extract_span_context(&self, extractor: &dyn Extractor) -> Result<SpanContext, ()> {
        let header_value = extractor.get(TRACEPARENT_HEADER).unwrap_or("").trim();
        let parts = header_value.split_terminator('-').collect::<Vec<&str>>();
        // Ensure parts are not out of range.
        if parts.len() < 4 {
            return Err(());
        }

        // Ensure version is within range, for version 0 there must be 4 parts.
        let version = u8::from_str_radix(parts[0], 16).map_err(|_| ())?;
        if version > MAX_VERSION || version == 0 && parts.len() != 4 {
            return Err(());
        }

        // Ensure trace id is the full lowercase 32 hex digits.
        if parts[1].len() != 32 || parts[1].chars().any(|c| c.is_ascii_uppercase()) {
            return Err(());
        }
        let trace_id = TraceId::from_hex(parts[1]).map_err(|_| ())?;

        // Ensure span id is the full lowercase 16 hex digits.
        if parts[2].len() != 16 || parts[2].chars().any(|c| c.is_ascii_uppercase()) {
            return Err(());
        }
        let span_id = SpanId::from_hex(parts[2]).map_err(|_| ())?;

        // Parse trace flags section
        let opts = u8::from_str_radix(parts[3], 16).map_err(|_| ())?;

        // Ensure opts are valid for version 0
        if version == 0 && opts > 2 {
            return Err(());
        }

        // Clear all flags other than the supported sampling bit.
        let trace_flags = TraceFlags::new(opts) & TraceFlags::SAMPLED;

        let span_context = SpanContext::new(trace_id, span_id, trace_flags, true);

        // Ensure the propagated ids are non-zero.
        if !span_context.is_valid() {
            return Err(());
        }

        Ok(span_context)
    }

    /// Retrieve an encoded span context from the extractor.
    ///
    /// If the header is missing or invalid an empty context is returned and
    /// the receiver starts a new trace.
    pub fn extract(&self, extractor: &dyn Extractor) -> TraceContext {
        self.extract_span_context(extractor)
            .map(TraceContext::with_remote_span_context)
            .unwrap_or_default()
    }
}
