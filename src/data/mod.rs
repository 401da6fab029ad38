//! Wire-level data structures exchanged between workers.
//!
//! All integers are encoded two's complement in host endianness; the cluster
//! is assumed homogeneous.

pub mod job_transfer;
pub mod serialize;

pub use job_transfer::{
    Application, DescriptionChunk, IntPair, IntVec, JobMessage, JobRequest, JobResult,
    JobSignature, JobStatistics, OneshotJobRequestRejection, WorkRequest,
};
pub use serialize::{checksum, Serializable};
