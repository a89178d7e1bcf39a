//! Rule-based analysis of the causal event graph.
//!
//! The engine ingests trace events into the graph, hands every new node to
//! the paradigm rule sets (MPI, OpenMP, offload), and lets the rules mark
//! blocking edges, inject synthetic wait states and distribute blame. Rules
//! that need remote timestamps replay the application's communication
//! pattern over the analyzer's transport.

mod blame;
mod engine;
mod mpi;
mod offload;
mod omp;
mod statistics;

#[cfg(test)]
mod tests;

pub use blame::{distribute_blame, mpi_stream_walk, offload_stream_walk};
pub use engine::{AnalysisEngine, EngineError, RegionInfo, Rule};
pub use mpi::{MpiState, RemoteEdgeDirection, RemoteMpiEdge};
pub use offload::{OffloadState, WAITSTATE_NAME, WAITSTATE_REGION};
pub use omp::OmpState;
pub use statistics::{ActivityType, StatMetric, Statistics};
