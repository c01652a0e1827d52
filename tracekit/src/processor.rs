//! # Span processors
//!
//! A span processor sits between `Span::end` and the exporter. It is invoked
//! synchronously on the thread that ends the span, so it must hand work off
//! quickly. [`SimpleSpanProcessor`] exports each span in place and is meant
//! for tests and debugging; [`BatchSpanProcessor`] buffers spans and exports
//! them from a dedicated background thread.
//!
//! Processors only see sampled spans through to the exporter; spans without
//! the `sampled` flag are discarded on arrival.

use std::cmp::min;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use std::{env, str::FromStr, thread};

use futures_executor::block_on;

use crate::error::{TraceError, TraceResult};
use crate::export::SpanExporter;
use crate::span::SpanData;

/// Delay interval between two consecutive exports.
pub(crate) const TRACEKIT_BSP_SCHEDULE_DELAY: &str = "TRACEKIT_BSP_SCHEDULE_DELAY";
/// Default delay interval between two consecutive exports.
pub(crate) const TRACEKIT_BSP_SCHEDULE_DELAY_DEFAULT: u64 = 5_000;
/// Maximum queue size.
pub(crate) const TRACEKIT_BSP_MAX_QUEUE_SIZE: &str = "TRACEKIT_BSP_MAX_QUEUE_SIZE";
/// Default maximum queue size.
pub(crate) const TRACEKIT_BSP_MAX_QUEUE_SIZE_DEFAULT: usize = 2_048;
/// Maximum batch size, must be less than or equal to the maximum queue size.
pub(crate) const TRACEKIT_BSP_MAX_EXPORT_BATCH_SIZE: &str = "TRACEKIT_BSP_MAX_EXPORT_BATCH_SIZE";
/// Default maximum batch size.
pub(crate) const TRACEKIT_BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT: usize = 512;
/// Maximum allowed time to export data.
pub(crate) const TRACEKIT_BSP_EXPORT_TIMEOUT: &str = "TRACEKIT_BSP_EXPORT_TIMEOUT";
/// Default maximum allowed time to export data.
pub(crate) const TRACEKIT_BSP_EXPORT_TIMEOUT_DEFAULT: u64 = 30_000;

/// Hooks into span end. Implementations are invoked synchronously within
/// `Span::end` and must not block beyond a bounded hand-off.
///
/// Implementations must make sure `shutdown` can be called more than once;
/// every call after the first reports `TraceError::AlreadyShutdown`.
pub trait SpanProcessor: Send + Sync + std::fmt::Debug {
    /// Called when a span ends, with the finished span record.
    fn on_end(&self, span: SpanData);
    /// Force any buffered spans through to the exporter, blocking until
    /// done or the processor's deadline elapses.
    fn force_flush(&self) -> TraceResult<()>;
    /// Flush buffered spans and release the exporter.
    fn shutdown(&self) -> TraceResult<()>;
}

/// A [`SpanProcessor`] that passes finished spans to the configured
/// exporter as soon as they are finished, without any batching. Typically
/// useful for debugging and testing; use [`BatchSpanProcessor`] for
/// production pipelines.
#[derive(Debug)]
pub struct SimpleSpanProcessor {
    exporter: Mutex<Box<dyn SpanExporter>>,
    is_shutdown: AtomicBool,
}

impl SimpleSpanProcessor {
    /// Create a new [`SimpleSpanProcessor`] using the provided exporter.
    pub fn new(exporter: Box<dyn SpanExporter>) -> Self {
        Self {
            exporter: Mutex::new(exporter),
            is_shutdown: AtomicBool::new(false),
        }
    }
}

impl SpanProcessor for SimpleSpanProcessor {
    fn on_end(&self, span: SpanData) {
        if !span.span_context.is_sampled() {
            return;
        }

        let result = self
            .exporter
            .lock()
            .map_err(|_| TraceError::Other("simple span processor mutex poison".into()))
            .and_then(|mut exporter| block_on(exporter.export(vec![span])));

        if let Err(err) = result {
            tracing::debug!(error = %err, "simple span processor export failed");
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        // Nothing is buffered here.
        Ok(())
    }

    fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        if let Ok(mut exporter) = self.exporter.lock() {
            exporter.shutdown();
            Ok(())
        } else {
            Err(TraceError::Other(
                "simple span processor mutex poison at shutdown".into(),
            ))
        }
    }
}

/// Messages exchanged between the span-owning threads and the background
/// thread.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum BatchMessage {
    ExportSpan(SpanData),
    ForceFlush(SyncSender<TraceResult<()>>),
    Shutdown(SyncSender<TraceResult<()>>),
}

/// A [`SpanProcessor`] that buffers finished spans and exports them in
/// batches from a dedicated background thread.
///
/// Hand-off from `on_end` is a bounded non-blocking send; when the queue is
/// full the span is dropped and counted, never blocking the caller. The
/// background thread exports when a batch fills or the scheduled delay
/// elapses, whichever comes first.
///
/// `force_flush` is a barrier: the flush request is queued behind every span
/// accepted before the call, so once it returns `Ok(())` all of those spans
/// have been handed to the exporter's transport.
#[derive(Debug)]
pub struct BatchSpanProcessor {
    message_sender: SyncSender<BatchMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    max_export_timeout: Duration,
    is_shutdown: AtomicBool,
    dropped_span_count: Arc<AtomicUsize>,
}

impl BatchSpanProcessor {
    /// Creates a new `BatchSpanProcessor` with the given exporter and
    /// configuration, spawning its background thread.
    pub fn new<E>(mut exporter: E, config: BatchConfig) -> Self
    where
        E: SpanExporter + Send + 'static,
    {
        let (message_sender, message_receiver) = sync_channel(config.max_queue_size);
        let max_batch = config.max_export_batch_size;

        let handle = thread::Builder::new()
            .name("tracekit-batch-span-processor".to_string())
            .spawn(move || {
                let mut spans: Vec<SpanData> = Vec::with_capacity(max_batch);
                let mut last_export_time = Instant::now();

                fn export_batch<E: SpanExporter>(
                    exporter: &mut E,
                    spans: &mut Vec<SpanData>,
                    max_batch: usize,
                ) -> TraceResult<()> {
                    while !spans.is_empty() {
                        let count = min(max_batch, spans.len());
                        let batch = spans.drain(..count).collect();
                        block_on(exporter.export(batch))?;
                    }
                    Ok(())
                }

                loop {
                    let timeout = config
                        .scheduled_delay
                        .saturating_sub(last_export_time.elapsed());
                    match message_receiver.recv_timeout(timeout) {
                        Ok(BatchMessage::ExportSpan(span)) => {
                            spans.push(span);
                            if spans.len() >= max_batch
                                || last_export_time.elapsed() >= config.scheduled_delay
                            {
                                if let Err(err) = export_batch(&mut exporter, &mut spans, max_batch)
                                {
                                    tracing::debug!(error = %err, "batch export failed");
                                }
                                last_export_time = Instant::now();
                            }
                        }
                        Ok(BatchMessage::ForceFlush(sender)) => {
                            let result = export_batch(&mut exporter, &mut spans, max_batch);
                            last_export_time = Instant::now();
                            let _ = sender.send(result);
                        }
                        Ok(BatchMessage::Shutdown(sender)) => {
                            let result = export_batch(&mut exporter, &mut spans, max_batch);
                            exporter.shutdown();
                            let _ = sender.send(result);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if last_export_time.elapsed() >= config.scheduled_delay {
                                if let Err(err) = export_batch(&mut exporter, &mut spans, max_batch)
                                {
                                    tracing::debug!(error = %err, "batch export failed");
                                }
                                last_export_time = Instant::now();
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            tracing::debug!("batch channel disconnected, stopping worker");
                            break;
                        }
                    }
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn batch worker thread");
                None
            }
        };

        Self {
            message_sender,
            handle: Mutex::new(handle),
            max_export_timeout: config.max_export_timeout,
            is_shutdown: AtomicBool::new(false),
            dropped_span_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a [`BatchSpanProcessorBuilder`] for the given exporter.
    pub fn builder<E>(exporter: E) -> BatchSpanProcessorBuilder<E>
    where
        E: SpanExporter + Send + 'static,
    {
        BatchSpanProcessorBuilder {
            exporter,
            config: BatchConfig::default(),
        }
    }
}

impl SpanProcessor for BatchSpanProcessor {
    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        if !span.span_context.is_sampled() {
            return;
        }
        let result = self.message_sender.try_send(BatchMessage::ExportSpan(span));

        if result.is_err() {
            // Warn once on the first drop; the total is reported at shutdown.
            if self.dropped_span_count.fetch_add(1, Ordering::Relaxed) == 0 {
                tracing::warn!(
                    "batch span processor queue is full, dropping spans until it drains"
                );
            }
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::ForceFlush(sender))
            .map_err(|_| TraceError::Other("failed to send flush message".into()))?;

        receiver
            .recv_timeout(self.max_export_timeout)
            .map_err(|_| TraceError::ExportTimedOut(self.max_export_timeout))?
    }

    fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        let dropped = self.dropped_span_count.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(count = dropped, "spans dropped due to full batch queue");
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::Shutdown(sender))
            .map_err(|_| TraceError::Other("failed to send shutdown message".into()))?;

        let result = receiver
            .recv_timeout(self.max_export_timeout)
            .map_err(|_| TraceError::ExportTimedOut(self.max_export_timeout))?;
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    return Err(TraceError::Other("batch worker thread panicked".into()));
                }
            }
        }
        result
    }
}

impl Drop for BatchSpanProcessor {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.shutdown() {
                tracing::debug!(error = %err, "batch span processor shutdown on drop failed");
            }
        }
    }
}

/// Builder for [`BatchSpanProcessor`].
#[derive(Debug, Default)]
pub struct BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + Send + 'static,
{
    exporter: E,
    config: BatchConfig,
}

impl<E> BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + Send + 'static,
{
    /// Set the [`BatchConfig`] for this processor.
    pub fn with_batch_config(self, config: BatchConfig) -> Self {
        BatchSpanProcessorBuilder { config, ..self }
    }

    /// Build the processor, spawning its background thread.
    pub fn build(self) -> BatchSpanProcessor {
        BatchSpanProcessor::new(self.exporter, self.config)
    }
}

/// Batch span processor configuration.
/// Use [`BatchConfigBuilder`] to configure your own instance of [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfig {
    /// The maximum queue size to buffer spans for delayed processing. If the
    /// queue gets full it drops the spans. The default value is 2048.
    pub(crate) max_queue_size: usize,

    /// The delay interval between two consecutive processing of batches.
    /// The default value is 5 seconds.
    pub(crate) scheduled_delay: Duration,

    /// The maximum number of spans to process in a single batch. If there are
    /// more than one batch worth of spans then it processes multiple batches
    /// one after the other without any delay. The default value is 512.
    pub(crate) max_export_batch_size: usize,

    /// The maximum duration to export a batch of data.
    pub(crate) max_export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

/// A builder for creating [`BatchConfig`] instances.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
    max_export_timeout: Duration,
}

impl Default for BatchConfigBuilder {
    /// Create a new [`BatchConfigBuilder`] initialized with the default
    /// values, overridden by environment variables if set. The supported
    /// environment variables are:
    /// * `TRACEKIT_BSP_MAX_QUEUE_SIZE`
    /// * `TRACEKIT_BSP_SCHEDULE_DELAY`
    /// * `TRACEKIT_BSP_MAX_EXPORT_BATCH_SIZE`
    /// * `TRACEKIT_BSP_EXPORT_TIMEOUT`
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: TRACEKIT_BSP_MAX_QUEUE_SIZE_DEFAULT,
            scheduled_delay: Duration::from_millis(TRACEKIT_BSP_SCHEDULE_DELAY_DEFAULT),
            max_export_batch_size: TRACEKIT_BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT,
            max_export_timeout: Duration::from_millis(TRACEKIT_BSP_EXPORT_TIMEOUT_DEFAULT),
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Set the maximum queue size. Spans that arrive while the queue is
    /// full are dropped.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the maximum number of spans exported in a single batch.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Set the delay interval between two consecutive batch exports.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Set the maximum duration a flush, shutdown or export may take.
    pub fn with_max_export_timeout(mut self, max_export_timeout: Duration) -> Self {
        self.max_export_timeout = max_export_timeout;
        self
    }

    /// Builds a `BatchConfig` enforcing the following invariant:
    /// * `max_export_batch_size` must be less than or equal to `max_queue_size`.
    pub fn build(self) -> BatchConfig {
        let max_export_batch_size = min(self.max_export_batch_size, self.max_queue_size);

        BatchConfig {
            max_queue_size: self.max_queue_size,
            scheduled_delay: self.scheduled_delay,
            max_export_timeout: self.max_export_timeout,
            max_export_batch_size,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(max_queue_size) = env::var(TRACEKIT_BSP_MAX_QUEUE_SIZE)
            .ok()
            .and_then(|queue_size| usize::from_str(&queue_size).ok())
        {
            self.max_queue_size = max_queue_size;
        }

        if let Some(scheduled_delay) = env::var(TRACEKIT_BSP_SCHEDULE_DELAY)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.scheduled_delay = Duration::from_millis(scheduled_delay);
        }

        if let Some(max_export_batch_size) = env::var(TRACEKIT_BSP_MAX_EXPORT_BATCH_SIZE)
            .ok()
            .and_then(|batch_size| usize::from_str(&batch_size).ok())
        {
            self.max_export_batch_size = max_export_batch_size;
        }

        if let Some(max_export_timeout) = env::var(TRACEKIT_BSP_EXPORT_TIMEOUT)
            .ok()
            .and_then(|timeout| u64::from_str(&timeout).ok())
        {
            self.max_export_timeout = Duration::from_millis(max_export_timeout);
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportResult, InMemoryExporter};
    use crate::id::{SpanId, TraceFlags, TraceId};
    use crate::span::{SpanContext, SpanKind, Status};
    use futures_util::future::BoxFuture;
    use std::time::SystemTime;

    fn new_test_span(name: &'static str, sampled: bool) -> SpanData {
        let flags = if sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::NOT_SAMPLED
        };
        let now = SystemTime::now();
        SpanData {
            span_context: SpanContext::new(
                TraceId::from(1u128),
                SpanId::from(1u64),
                flags,
                false,
            ),
            parent_span_id: SpanId::INVALID,
            span_kind: SpanKind::Internal,
            name: name.into(),
            start_time: now,
            end_time: now,
            attributes: Vec::new(),
            events: Vec::new(),
            status: Status::Unset,
        }
    }

    #[derive(Debug)]
    struct FailingExporter;

    impl SpanExporter for FailingExporter {
        fn export(&mut self, _batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            Box::pin(futures_util::future::ready(Err(TraceError::Other(
                "transport down".into(),
            ))))
        }
    }

    /// Stalls every export, simulating an unresponsive transport.
    #[derive(Debug)]
    struct StallingExporter(Duration);

    impl SpanExporter for StallingExporter {
        fn export(&mut self, _batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            thread::sleep(self.0);
            Box::pin(futures_util::future::ready(Ok(())))
        }
    }

    #[test]
    fn simple_processor_exports_sampled_spans_only() {
        let exporter = InMemoryExporter::default();
        let processor = SimpleSpanProcessor::new(Box::new(exporter.clone()));

        processor.on_end(new_test_span("sampled", true));
        processor.on_end(new_test_span("unsampled", false));

        let spans = exporter.finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "sampled");
    }

    #[test]
    fn simple_processor_swallows_export_errors() {
        let processor = SimpleSpanProcessor::new(Box::new(FailingExporter));
        processor.on_end(new_test_span("doomed", true));
        assert!(processor.force_flush().is_ok());
    }

    #[test]
    fn simple_processor_shutdown_is_idempotent() {
        let processor = SimpleSpanProcessor::new(Box::new(InMemoryExporter::default()));
        processor.shutdown().unwrap();
        assert!(matches!(
            processor.shutdown(),
            Err(TraceError::AlreadyShutdown)
        ));
    }

    #[test]
    fn batch_processor_flush_is_a_barrier() {
        let exporter = InMemoryExporter::default();
        let processor = BatchSpanProcessor::builder(exporter.clone())
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_scheduled_delay(Duration::from_secs(60))
                    .build(),
            )
            .build();

        for _ in 0..8 {
            processor.on_end(new_test_span("queued", true));
        }
        // Nothing has hit the scheduled delay yet; flush forces it through.
        processor.force_flush().unwrap();
        assert_eq!(exporter.finished_spans().unwrap().len(), 8);
        processor.shutdown().unwrap();
    }

    #[test]
    fn batch_processor_flush_timeout_reports_partial() {
        let processor = BatchSpanProcessor::builder(StallingExporter(Duration::from_millis(500)))
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_scheduled_delay(Duration::from_secs(60))
                    .with_max_export_timeout(Duration::from_millis(50))
                    .build(),
            )
            .build();

        processor.on_end(new_test_span("stuck", true));
        // The flush waits on the stalled export and gives up at the
        // deadline instead of hanging; the flush is partial.
        assert!(matches!(
            processor.force_flush(),
            Err(TraceError::ExportTimedOut(_))
        ));
    }

    #[test]
    fn batch_processor_exports_on_batch_size() {
        let exporter = InMemoryExporter::default();
        let processor = BatchSpanProcessor::builder(exporter.clone())
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_max_export_batch_size(4)
                    .with_scheduled_delay(Duration::from_secs(60))
                    .build(),
            )
            .build();

        for _ in 0..4 {
            processor.on_end(new_test_span("queued", true));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while exporter.finished_spans().unwrap().len() < 4 {
            assert!(Instant::now() < deadline, "batch was never exported");
            thread::sleep(Duration::from_millis(10));
        }
        processor.shutdown().unwrap();
    }

    #[test]
    fn batch_processor_shutdown_flushes_and_is_idempotent() {
        let exporter = InMemoryExporter::default();
        let processor = BatchSpanProcessor::builder(exporter.clone()).build();

        processor.on_end(new_test_span("pending", true));
        processor.shutdown().unwrap();
        assert!(matches!(
            processor.shutdown(),
            Err(TraceError::AlreadyShutdown)
        ));
        assert!(matches!(
            processor.force_flush(),
            Err(TraceError::AlreadyShutdown)
        ));
        // Spans ended after shutdown are silently dropped.
        processor.on_end(new_test_span("late", true));
    }

    #[test]
    fn batch_processor_drops_unsampled_spans() {
        let exporter = InMemoryExporter::default();
        let processor = BatchSpanProcessor::builder(exporter.clone()).build();
        processor.on_end(new_test_span("unsampled", false));
        processor.force_flush().unwrap();
        assert!(exporter.finished_spans().unwrap().is_empty());
        processor.shutdown().unwrap();
    }

    #[test]
    fn batch_config_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.max_queue_size, 2_048);
        assert_eq!(config.scheduled_delay, Duration::from_millis(5_000));
        assert_eq!(config.max_export_batch_size, 512);
        assert_eq!(config.max_export_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn batch_config_from_env() {
        temp_env::with_vars(
            vec![
                (TRACEKIT_BSP_MAX_QUEUE_SIZE, Some("4096")),
                (TRACEKIT_BSP_SCHEDULE_DELAY, Some("2000")),
                (TRACEKIT_BSP_MAX_EXPORT_BATCH_SIZE, Some("1024")),
                (TRACEKIT_BSP_EXPORT_TIMEOUT, Some("2046")),
            ],
            || {
                let config = BatchConfig::default();
                assert_eq!(config.max_queue_size, 4096);
                assert_eq!(config.scheduled_delay, Duration::from_millis(2000));
                assert_eq!(config.max_export_batch_size, 1024);
                assert_eq!(config.max_export_timeout, Duration::from_millis(2046));
            },
        );
    }

    #[test]
    fn batch_size_is_clamped_to_queue_size() {
        let config = BatchConfigBuilder::default()
            .with_max_queue_size(10)
            .with_max_export_batch_size(500)
            .build();
        assert_eq!(config.max_export_batch_size, 10);
    }
}
