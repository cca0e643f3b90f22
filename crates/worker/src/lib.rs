//! Projection worker for the shopping cart views.
//!
//! Runs the client summary projection as a checkpointed processor. Several
//! workers may point at the same database; the processor lease makes sure
//! only one of them advances the checkpoint at a time.

pub mod config;
pub mod error;

use std::future::Future;

use event_store::{CheckpointStore, DocumentStore, EventStore, ProcessorLock};
use projections::{ClientShoppingSummaryProjection, ProcessorOptions, ProjectionProcessor};

pub use config::Config;
pub use error::{Result, WorkerError};

/// Registers descriptions for the metrics the store and processors emit.
pub fn describe_metrics() {
    metrics::describe_counter!("event_store_appends_total", "Successful appends");
    metrics::describe_counter!(
        "event_store_concurrency_conflicts_total",
        "Appends rejected by the expected stream version"
    );
    metrics::describe_histogram!(
        "event_store_append_duration_seconds",
        metrics::Unit::Seconds,
        "Time spent in a single append"
    );
    metrics::describe_counter!(
        "command_handler_retries_total",
        "Commands rerun after a concurrency conflict"
    );
    metrics::describe_counter!(
        "processor_lock_acquired_total",
        "Ticks in which this instance held the processor lease"
    );
    metrics::describe_counter!(
        "projections_messages_processed",
        "Messages handed to projections"
    );
}

pub fn processor_options(config: &Config) -> ProcessorOptions {
    ProcessorOptions::new(config.processor_id.clone())
        .partition(config.partition.clone())
        .lease_timeout(config.lease_timeout)
        .batch_size(config.batch_size)
        .poll_interval(config.poll_interval)
}

/// Builds the processor that keeps client summaries up to date.
pub fn summary_processor<S>(store: S, config: &Config) -> ProjectionProcessor<S>
where
    S: EventStore + CheckpointStore + ProcessorLock + DocumentStore + Clone + 'static,
{
    let mut processor = ProjectionProcessor::new(store.clone(), processor_options(config));
    processor.register(Box::new(
        ClientShoppingSummaryProjection::new(store).with_partition(config.partition.clone()),
    ));
    processor
}

/// Initializes the store and processes the log until `shutdown` resolves.
pub async fn run<S, F>(store: S, config: &Config, shutdown: F) -> Result<()>
where
    S: EventStore + CheckpointStore + ProcessorLock + DocumentStore + Clone + 'static,
    F: Future<Output = ()>,
{
    store.init().await?;
    let processor = summary_processor(store, config);
    tracing::info!(
        processor = %processor.key(),
        instance = %processor.options().instance_id,
        "starting projection worker"
    );
    processor.run(shutdown).await?;
    Ok(())
}
