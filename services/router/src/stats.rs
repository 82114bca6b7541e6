//! Worker statistics and the thread documents built from them.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::load::LoadSnapshot;
use crate::worker::WorkerId;

/// Event counters of one worker. Times are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStatistics {
    pub n_read: u64,
    pub n_write: u64,
    pub n_error: u64,
    pub n_hup: u64,
    pub n_accept: u64,
    pub n_polls: u64,
    pub n_pollev: u64,
    /// Average number of events returned per poll.
    pub evq_avg: u64,
    pub evq_max: u64,
    /// Longest delay between an event being returned and handled.
    pub maxqtime: u64,
    /// Longest time spent handling one event.
    pub maxexectime: u64,
}

impl WorkerStatistics {
    pub(crate) fn record_poll(&mut self, n_events: usize) {
        let n = n_events as u64;
        self.n_polls += 1;
        self.n_pollev += n;
        self.evq_avg = self.n_pollev / self.n_polls;
        self.evq_max = self.evq_max.max(n);
    }

    pub(crate) fn record_queue_time(&mut self, waited: Duration) {
        self.maxqtime = self.maxqtime.max(waited.as_millis() as u64);
    }

    pub(crate) fn record_exec_time(&mut self, took: Duration) {
        self.maxexectime = self.maxexectime.max(took.as_millis() as u64);
    }

    /// Combine per-worker statistics: counters are summed, the average queue
    /// length is averaged and maxima are maxed.
    pub fn aggregate<'a, I>(stats: I) -> WorkerStatistics
    where
        I: IntoIterator<Item = &'a WorkerStatistics>,
    {
        let mut total = WorkerStatistics::default();
        let mut count = 0u64;
        let mut evq_sum = 0u64;

        for s in stats {
            count += 1;
            total.n_read += s.n_read;
            total.n_write += s.n_write;
            total.n_error += s.n_error;
            total.n_hup += s.n_hup;
            total.n_accept += s.n_accept;
            total.n_polls += s.n_polls;
            total.n_pollev += s.n_pollev;
            evq_sum += s.evq_avg;
            total.evq_max = total.evq_max.max(s.evq_max);
            total.maxqtime = total.maxqtime.max(s.maxqtime);
            total.maxexectime = total.maxexectime.max(s.maxexectime);
        }

        if count > 0 {
            total.evq_avg = evq_sum / count;
        }
        total
    }

    pub fn get(&self, kind: StatKind) -> u64 {
        match kind {
            StatKind::Reads => self.n_read,
            StatKind::Writes => self.n_write,
            StatKind::Errors => self.n_error,
            StatKind::Hangups => self.n_hup,
            StatKind::Accepts => self.n_accept,
            StatKind::Polls => self.n_polls,
            StatKind::PollEvents => self.n_pollev,
            StatKind::AvgEventQueueLength => self.evq_avg,
            StatKind::MaxEventQueueLength => self.evq_max,
            StatKind::MaxQueueTime => self.maxqtime,
            StatKind::MaxExecTime => self.maxexectime,
        }
    }
}

/// Selector for `Fleet::one_statistic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Reads,
    Writes,
    Errors,
    Hangups,
    Accepts,
    Polls,
    PollEvents,
    AvgEventQueueLength,
    MaxEventQueueLength,
    MaxQueueTime,
    MaxExecTime,
}

/// Descriptors registered with a worker's poller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptors {
    pub current: u64,
    pub total: u64,
}

impl Descriptors {
    pub(crate) fn opened(&mut self) {
        self.current += 1;
        self.total += 1;
    }

    pub(crate) fn closed(&mut self) {
        self.current = self.current.saturating_sub(1);
    }
}

/// Point-in-time view of one worker, taken on the worker's thread.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub stats: WorkerStatistics,
    pub current_descriptors: u64,
    pub total_descriptors: u64,
    pub load: LoadSnapshot,
    pub sessions: usize,
    pub connections: usize,
    pub pooled: usize,
    pub zombies: usize,
}

/// One `threads` resource.
pub fn worker_resource(host: &str, snap: &WorkerSnapshot) -> Value {
    let s = &snap.stats;
    json!({
        "id": snap.id.to_string(),
        "type": "threads",
        "attributes": {
            "stats": {
                "reads": s.n_read,
                "writes": s.n_write,
                "errors": s.n_error,
                "hangups": s.n_hup,
                "accepts": s.n_accept,
                "avg_event_queue_length": s.evq_avg,
                "max_event_queue_length": s.evq_max,
                "max_exec_time": s.maxexectime,
                "max_queue_time": s.maxqtime,
                "current_descriptors": snap.current_descriptors,
                "total_descriptors": snap.total_descriptors,
                "load": {
                    "last_second": snap.load.last_second,
                    "last_minute": snap.load.last_minute,
                    "last_hour": snap.load.last_hour,
                },
            },
        },
        "links": {
            "self": format!("{}/v1/threads/{}", host, snap.id),
        },
    })
}

/// Document listing every worker.
pub fn threads_document(host: &str, snaps: &[WorkerSnapshot]) -> Value {
    let data: Vec<Value> = snaps.iter().map(|s| worker_resource(host, s)).collect();
    json!({
        "links": { "self": format!("{}/v1/threads", host) },
        "data": data,
    })
}

/// Document for a single worker.
pub fn thread_document(host: &str, snap: &WorkerSnapshot) -> Value {
    json!({
        "links": { "self": format!("{}/v1/threads/{}", host, snap.id) },
        "data": worker_resource(host, snap),
    })
}

/// Document for the whole fleet. Counters are combined as in
/// `WorkerStatistics::aggregate`, descriptors are summed and load is averaged.
pub fn combined_document(host: &str, snaps: &[WorkerSnapshot]) -> Value {
    let s = WorkerStatistics::aggregate(snaps.iter().map(|snap| &snap.stats));
    let n = snaps.len().max(1) as u64;
    let load_avg = |f: fn(&LoadSnapshot) -> u8| {
        snaps.iter().map(|snap| f(&snap.load) as u64).sum::<u64>() / n
    };

    json!({
        "links": { "self": format!("{}/v1/threads/all", host) },
        "data": {
            "id": "all",
            "type": "threads",
            "attributes": {
                "workers": snaps.len(),
                "stats": {
                    "reads": s.n_read,
                    "writes": s.n_write,
                    "errors": s.n_error,
                    "hangups": s.n_hup,
                    "accepts": s.n_accept,
                    "avg_event_queue_length": s.evq_avg,
                    "max_event_queue_length": s.evq_max,
                    "max_exec_time": s.maxexectime,
                    "max_queue_time": s.maxqtime,
                    "current_descriptors": snaps.iter().map(|x| x.current_descriptors).sum::<u64>(),
                    "total_descriptors": snaps.iter().map(|x| x.total_descriptors).sum::<u64>(),
                    "load": {
                        "last_second": load_avg(|l| l.last_second),
                        "last_minute": load_avg(|l| l.last_minute),
                        "last_hour": load_avg(|l| l.last_hour),
                    },
                },
            },
        },
    })
}
