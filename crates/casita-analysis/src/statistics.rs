//! Per-rank inefficiency metrics and activity counts.
//!
//! Rules record what they find here; cross-rank aggregation happens once at
//! the end of the analysis as an element-wise sum reduction.

// ── Metric ids ──────────────────────────────────────────────────

/// Inefficiency metrics. Each carries an occurrence count and an accumulated
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatMetric {
    MpiLateSender = 0,
    MpiLateReceiver = 1,
    MpiCollective = 2,
    MpiWaitallLatePartner = 3,
    OmpBarrier = 4,
    OfldEarlyBlockingWait = 5,
    OfldIdleTime = 6,
}

pub const STAT_METRIC_COUNT: usize = 7;

const METRIC_TABLE: [(StatMetric, &str); STAT_METRIC_COUNT] = [
    (StatMetric::MpiLateSender, "MPI late sender"),
    (StatMetric::MpiLateReceiver, "MPI late receiver"),
    (StatMetric::MpiCollective, "MPI unbalanced collectives"),
    (StatMetric::MpiWaitallLatePartner, "MPI wait-all late partner"),
    (StatMetric::OmpBarrier, "OpenMP barriers"),
    (StatMetric::OfldEarlyBlockingWait, "Ofld. early blocking wait"),
    (StatMetric::OfldIdleTime, "Ofld. device idle"),
];

/// Activity occurrence counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    MpiP2p = 0,
    MpiCollective = 1,
    MpiWait = 2,
    OmpForkJoin = 3,
    OmpBarrier = 4,
    OfldKernel = 5,
    OfldSync = 6,
    TraceEvents = 7,
    HostStreams = 8,
    DeviceNum = 9,
}

pub const ACTIVITY_TYPE_COUNT: usize = 10;

const ACTIVITY_TABLE: [(ActivityType, &str); ACTIVITY_TYPE_COUNT] = [
    (ActivityType::MpiP2p, "MPI (blocking) p2p"),
    (ActivityType::MpiCollective, "MPI (blocking) collectives"),
    (ActivityType::MpiWait, "MPI wait[all]"),
    (ActivityType::OmpForkJoin, "OpenMP fork/join"),
    (ActivityType::OmpBarrier, "OpenMP barriers"),
    (ActivityType::OfldKernel, "Ofld. kernels"),
    (ActivityType::OfldSync, "Ofld. synchronization"),
    (ActivityType::TraceEvents, "Total number of events read"),
    (ActivityType::HostStreams, "Host streams"),
    (ActivityType::DeviceNum, "Devices"),
];

// ── The statistics object ───────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Statistics {
    counts: [u64; STAT_METRIC_COUNT],
    times: [u64; STAT_METRIC_COUNT],
    activities: [u64; ACTIVITY_TYPE_COUNT],
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one instance of a metric with its accumulated time.
    pub fn add_stat(&mut self, metric: StatMetric, time: u64) {
        self.add_stat_with_count(metric, time, 1);
    }

    pub fn add_stat_with_count(&mut self, metric: StatMetric, time: u64, count: u64) {
        let index = metric as usize;
        self.counts[index] = self.counts[index].saturating_add(count);
        self.times[index] = self.times[index].saturating_add(time);
    }

    pub fn stat_count(&self, metric: StatMetric) -> u64 {
        self.counts[metric as usize]
    }

    pub fn stat_time(&self, metric: StatMetric) -> u64 {
        self.times[metric as usize]
    }

    pub fn count_activity(&mut self, activity: ActivityType) {
        self.add_activity_count(activity, 1);
    }

    pub fn add_activity_count(&mut self, activity: ActivityType, count: u64) {
        let index = activity as usize;
        self.activities[index] = self.activities[index].saturating_add(count);
    }

    pub fn activity_count(&self, activity: ActivityType) -> u64 {
        self.activities[activity as usize]
    }

    /// Flatten into one slice for the cross-rank sum reduction.
    pub fn as_flat(&self) -> Vec<u64> {
        let mut flat = Vec::with_capacity(2 * STAT_METRIC_COUNT + ACTIVITY_TYPE_COUNT);
        flat.extend_from_slice(&self.counts);
        flat.extend_from_slice(&self.times);
        flat.extend_from_slice(&self.activities);
        flat
    }

    /// Rebuild from a reduced flat slice.
    pub fn from_flat(flat: &[u64]) -> Self {
        let mut stats = Self::default();
        let (counts, rest) = flat.split_at(STAT_METRIC_COUNT);
        let (times, activities) = rest.split_at(STAT_METRIC_COUNT);
        stats.counts.copy_from_slice(counts);
        stats.times.copy_from_slice(times);
        stats.activities.copy_from_slice(activities);
        stats
    }

    /// Human-readable summary rows: metric name, count, time.
    pub fn metric_rows(&self) -> impl Iterator<Item = (&'static str, u64, u64)> + '_ {
        METRIC_TABLE
            .iter()
            .map(|(metric, name)| (*name, self.stat_count(*metric), self.stat_time(*metric)))
    }

    pub fn activity_rows(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        ACTIVITY_TABLE
            .iter()
            .map(|(activity, name)| (*name, self.activity_count(*activity)))
    }
}
