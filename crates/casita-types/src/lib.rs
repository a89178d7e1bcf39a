//! Shared primitives for the casita trace analyzer.
//!
//! Ids, paradigm masks, record/function kinds, counter ids and key-value
//! attributes are defined here so that the graph, the analysis rules and the
//! trace codec all speak the same vocabulary.

use std::fmt;

use bitflags::bitflags;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

// ── Ids ─────────────────────────────────────────────────────────

/// Identifies one event stream (host thread, MPI rank process or device
/// stream) across the whole trace.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies an instrumented region (function or code scope).
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(transparent)]
pub struct RegionId(pub u32);

/// Identifier of a non-blocking MPI request, as recorded by the tracer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RequestId(pub u64);

/// Identifier of an offload (device) event object.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EventId(pub u64);

/// Matching id that groups the enter/leave pairs of one barrier instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct MatchingId(pub u64);

// ── Paradigms ───────────────────────────────────────────────────

bitflags! {
    /// Parallel-programming paradigm, usable both as a single tag on a node
    /// and as a mask on an edge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Paradigm: u8 {
        const CPU  = 0b0001;
        const MPI  = 0b0010;
        const OMP  = 0b0100;
        const CUDA = 0b1000;
    }
}

impl fmt::Display for Paradigm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, flag) in [
            ("CPU", Paradigm::CPU),
            ("MPI", Paradigm::MPI),
            ("OMP", Paradigm::OMP),
            ("CUDA", Paradigm::CUDA),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

// ── Record & function kinds ─────────────────────────────────────

/// Which endpoint of a region instance a node represents.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Enter,
    Leave,
    /// Single-point record without a matching partner.
    Atomic,
}

/// Functional category of the region a node belongs to. Rules trigger on
/// these, so the set mirrors what the rule families can recognize; anything
/// else is `Cpu`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Cpu,
    MpiSend,
    MpiRecv,
    MpiIsend,
    MpiIrecv,
    MpiWait,
    MpiWaitall,
    MpiCollective,
    OffloadKernel,
    OffloadEnqueueKernel,
    OffloadWait,
    OffloadEventRecord,
    OffloadEventSync,
    OffloadEventQuery,
    OffloadStreamWaitEvent,
    OffloadWaitstate,
    OmpForkJoin,
    OmpCompute,
    OmpSync,
    OmpTargetOffload,
    OmpTargetFlush,
}

impl FunctionKind {
    /// The paradigm a region of this kind belongs to.
    pub fn paradigm(self) -> Paradigm {
        use FunctionKind::*;
        match self {
            Cpu => Paradigm::CPU,
            MpiSend | MpiRecv | MpiIsend | MpiIrecv | MpiWait | MpiWaitall | MpiCollective => {
                Paradigm::MPI
            }
            OffloadKernel | OffloadEnqueueKernel | OffloadWait | OffloadEventRecord
            | OffloadEventSync | OffloadEventQuery | OffloadStreamWaitEvent | OffloadWaitstate => {
                Paradigm::CUDA
            }
            OmpForkJoin | OmpCompute | OmpSync | OmpTargetOffload | OmpTargetFlush => Paradigm::OMP,
        }
    }

    pub fn is_mpi(self) -> bool {
        self.paradigm() == Paradigm::MPI
    }

    pub fn is_offload(self) -> bool {
        self.paradigm() == Paradigm::CUDA
    }

    /// Non-blocking MPI operations that create pending request records.
    pub fn is_mpi_nonblocking(self) -> bool {
        matches!(self, FunctionKind::MpiIsend | FunctionKind::MpiIrecv)
    }

    /// Offload operations that synchronize the host with device streams.
    pub fn is_offload_sync(self) -> bool {
        matches!(
            self,
            FunctionKind::OffloadWait | FunctionKind::OffloadEventSync
        )
    }
}

// ── Counters ────────────────────────────────────────────────────

/// Sparse per-node counters. Slots may only grow; the writer emits them under
/// the names returned by [`Counter::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Counter {
    WaitingTime,
    Blame,
    CriticalPath,
    WaitState,
    OmpIgnoreBarrier,
    OmpRegionId,
    OmpParentRegionId,
}

impl Counter {
    pub fn as_str(self) -> &'static str {
        match self {
            Counter::WaitingTime => "waiting_time",
            Counter::Blame => "blame",
            Counter::CriticalPath => "critical_path",
            Counter::WaitState => "wait_state",
            Counter::OmpIgnoreBarrier => "omp_ignore_barrier",
            Counter::OmpRegionId => "omp_region_id",
            Counter::OmpParentRegionId => "omp_parent_region_id",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Stream classification ───────────────────────────────────────

/// What kind of physical location a stream is.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Host,
    Mpi,
    Device,
}

// ── Key-value attributes ────────────────────────────────────────

/// Attribute keys recognized by the paradigm handlers.
pub mod attr {
    /// Partner stream of a point-to-point MPI operation.
    pub const MPI_PARTNER: &str = "mpi_partner";
    /// Request id of a non-blocking MPI operation (also accepted on waits).
    pub const MPI_REQUEST: &str = "mpi_request_id";
    /// Device stream targeted by a kernel launch or synchronization.
    pub const OFFLOAD_DEVICE_REF: &str = "offload_device_ref";
    /// Device event object id on record/sync/query/stream-wait operations.
    pub const OFFLOAD_EVENT_ID: &str = "offload_event_id";
    /// Matching id of a barrier instance.
    pub const OMP_MATCHING_ID: &str = "omp_matching_id";
    pub const OMP_TARGET_REGION_ID: &str = "OMP_TARGET_REGION_ID";
    pub const OMP_TARGET_PARENT_REGION_ID: &str = "OMP_TARGET_PARENT_REGION_ID";
    pub const OMP_TARGET_LOCATION_REF: &str = "OMP_TARGET_LOCATION_REF";
}

/// One attribute value attached to an event record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum AttributeValue {
    Uint(u64),
    Int(i64),
    Str(CompactString),
}

impl AttributeValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttributeValue::Uint(v) => Some(*v),
            AttributeValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

/// Ordered key-value attribute list, as delivered by the trace reader.
pub type AttributeList = Vec<(CompactString, AttributeValue)>;

/// First value for `key`, interpreted as an unsigned integer.
pub fn attribute_u64(attrs: &AttributeList, key: &str) -> Option<u64> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_kind_paradigms() {
        assert_eq!(FunctionKind::MpiIsend.paradigm(), Paradigm::MPI);
        assert_eq!(FunctionKind::OffloadKernel.paradigm(), Paradigm::CUDA);
        assert_eq!(FunctionKind::OmpSync.paradigm(), Paradigm::OMP);
        assert_eq!(FunctionKind::Cpu.paradigm(), Paradigm::CPU);
        assert!(FunctionKind::MpiIrecv.is_mpi_nonblocking());
        assert!(!FunctionKind::MpiRecv.is_mpi_nonblocking());
        assert!(FunctionKind::OffloadEventSync.is_offload_sync());
    }

    #[test]
    fn paradigm_mask_display() {
        let mask = Paradigm::MPI | Paradigm::CPU;
        assert_eq!(mask.to_string(), "CPU,MPI");
        assert_eq!(Paradigm::empty().to_string(), "NONE");
    }

    #[test]
    fn attribute_lookup() {
        let attrs: AttributeList = vec![
            ("mpi_partner".into(), AttributeValue::Uint(3)),
            ("note".into(), AttributeValue::Str("x".into())),
        ];
        assert_eq!(attribute_u64(&attrs, attr::MPI_PARTNER), Some(3));
        assert_eq!(attribute_u64(&attrs, "note"), None);
        assert_eq!(attribute_u64(&attrs, "absent"), None);
    }

    #[test]
    fn counter_names_are_stable() {
        assert_eq!(Counter::WaitingTime.as_str(), "waiting_time");
        assert_eq!(Counter::CriticalPath.as_str(), "critical_path");
    }
}
