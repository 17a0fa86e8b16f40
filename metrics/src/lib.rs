use std::time::{Duration, Instant};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into the wrapped metric when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self {
            start: Instant::now(),
            metric,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &[]);
    }
}

pub mod blob_store_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub blobs_created: Counter<u64>,
        pub bytes_ingested: Counter<u64>,
        pub blobs_soft_deleted: Counter<u64>,
        pub blobs_hard_deleted: Counter<u64>,
        pub compaction_runs: Counter<u64>,
        pub create_latency: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blobstore");
            let blobs_created = meter
                .u64_counter("blobstore.blobs_created")
                .with_description("number of blobs created")
                .build();
            let bytes_ingested = meter
                .u64_counter("blobstore.bytes_ingested")
                .with_description("number of content bytes ingested")
                .build();
            let blobs_soft_deleted = meter
                .u64_counter("blobstore.blobs_soft_deleted")
                .with_description("number of blobs soft deleted")
                .build();
            let blobs_hard_deleted = meter
                .u64_counter("blobstore.blobs_hard_deleted")
                .with_description("number of blobs hard deleted")
                .build();
            let compaction_runs = meter
                .u64_counter("blobstore.compaction_runs")
                .with_description("number of completed compaction passes")
                .build();
            let create_latency = meter
                .f64_histogram("blobstore.create_latency")
                .with_description("blob create latencies in seconds")
                .build();
            Metrics {
                blobs_created,
                bytes_ingested,
                blobs_soft_deleted,
                blobs_hard_deleted,
                compaction_runs,
                create_latency,
            }
        }
    }
}
