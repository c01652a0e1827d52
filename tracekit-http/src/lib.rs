//! HTTP instrumentation for `tracekit`.
//!
//! This crate carries a span context over HTTP in both directions:
//! [`TracedClient`] starts a client span around each outgoing request and
//! injects its context into the `traceparent` header, and [`traced`] wraps a
//! server-side handler in a server span parented to the extracted remote
//! context. [`HeaderInjector`] and [`HeaderExtractor`] adapt an
//! [`http::HeaderMap`] to the propagation carrier interfaces.

#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]

use tracekit::{Extractor, Injector};

mod client;
mod server;

pub use client::TracedClient;
pub use server::traced;

/// Helper for injecting headers into HTTP requests, used for context
/// propagation over HTTP.
#[derive(Debug)]
pub struct HeaderInjector<'a>(pub &'a mut http::HeaderMap);

impl Injector for HeaderInjector<'_> {
    /// Set a key and value in the HeaderMap. Does nothing if the key or
    /// value are not valid inputs.
    fn set(&mut self, key: &str, value: String) {
        if let Ok(name) = http::header::HeaderName::from_bytes(key.as_bytes()) {
            if let Ok(val) = http::header::HeaderValue::from_str(&value) {
                self.0.insert(name, val);
            }
        }
    }
}

/// Helper for extracting headers from HTTP requests, used for context
/// propagation over HTTP.
#[derive(Debug)]
pub struct HeaderExtractor<'a>(pub &'a http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    /// Get a value for a key from the HeaderMap. If the value is not valid
    /// ASCII, returns None.
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    /// Collect all the keys from the HeaderMap.
    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .map(|value| value.as_str())
            .collect::<Vec<_>>()
    }
}

/// Generic error type for HTTP operations in this crate.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;
