//! The wire-level tag namespace.
//!
//! Tags are contiguous small integers. Any tag at or above
//! [`MSG_OFFSET_BATCHED`] marks a fragment of an oversized message; the
//! original tag is recovered by subtracting the offset.

pub type Tag = i32;

pub const WARMUP: Tag = 1;
/// The sender wishes to receive the current volume of a job. Payload: IntVec [jobId].
pub const QUERY_VOLUME: Tag = 2;
/// The receiver is asked to become a specific node of a job tree. Payload: JobRequest.
pub const REQUEST_NODE: Tag = 3;
/// The sender offers to adopt the receiver's advertised child position. Payload: JobRequest.
pub const OFFER_ADOPTION: Tag = 4;
/// Accept/reject answer to an adoption offer. Payload: IntPair (jobId, 0|1).
pub const ANSWER_ADOPTION_OFFER: Tag = 5;
/// A targeted rejoin request was declined. Payload: OneshotJobRequestRejection.
pub const REJECT_ONESHOT: Tag = 6;
/// Targeted-rejoin variant of REQUEST_NODE, sent to a dormant rank. Payload: JobRequest.
pub const REQUEST_NODE_ONESHOT: Tag = 7;
/// Bulk transfer of one description revision. Payload: DescriptionChunk.
pub const SEND_JOB_DESCRIPTION: Tag = 8;
/// Ask for a description revision. Payload: IntPair (jobId, revision).
pub const QUERY_JOB_DESCRIPTION: Tag = 9;
/// A volume update flows down the tree. Payload: IntVec [jobId, volume, epoch].
pub const NOTIFY_VOLUME_UPDATE: Tag = 10;
/// A node resigns from a job. Payload: IntVec [jobId, index, rootRank].
pub const NOTIFY_NODE_LEAVING_JOB: Tag = 11;
/// A worker found a result for a revision. Payload: IntVec [jobId, revision, resultCode].
pub const NOTIFY_RESULT_FOUND: Tag = 12;
/// A previously announced result is no longer wanted. Payload: IntVec [jobId, revision].
pub const NOTIFY_RESULT_OBSOLETE: Tag = 13;
/// Reckless termination of a job subtree. Payload: IntVec [jobId].
pub const NOTIFY_JOB_ABORTING: Tag = 14;
/// Graceful termination of a job subtree. Payload: IntVec [jobId].
pub const NOTIFY_JOB_TERMINATING: Tag = 15;
/// Suspend a job subtree, keeping the possibility to resume. Payload: IntVec [jobId].
pub const INTERRUPT: Tag = 16;
/// Application-internal message for an active job. Payload: JobMessage.
pub const SEND_APPLICATION_MESSAGE: Tag = 17;
/// The client wishes to receive a job's full result. Payload: IntVec [jobId].
pub const QUERY_JOB_RESULT: Tag = 18;
/// Full result transfer to the client. Payload: JobResult.
pub const SEND_JOB_RESULT: Tag = 19;
/// A job is done; statistics attached. Payload: JobStatistics.
pub const NOTIFY_JOB_DONE: Tag = 20;
/// Abort notification forwarded to the submitting client. Payload: IntVec [jobId].
pub const NOTIFY_CLIENT_JOB_ABORTING: Tag = 21;
/// An incremental job's final revision is done. Payload: IntVec [jobId].
pub const INCREMENTAL_JOB_FINISHED: Tag = 22;
/// Release a dormant node from waiting for reactivation. Payload: IntPair (jobId, epoch).
pub const SCHED_RELEASE_FROM_WAITING: Tag = 23;
/// Aggregated idle/request status flowing up the collective assignment tree.
pub const SCHED_NODE_STATUS: Tag = 24;
/// A matched request dispatched by collective assignment. Payload: JobRequest.
pub const NOTIFY_ASSIGNMENT_UPDATE: Tag = 25;
/// Tear down the whole run. Payload: IntVec [status].
pub const DO_EXIT: Tag = 26;

/// Tags at or above this offset denote fragments of a batched message.
/// Must exceed every legitimate tag above.
pub const MSG_OFFSET_BATCHED: Tag = 100;

pub fn is_fragment(tag: Tag) -> bool {
    tag >= MSG_OFFSET_BATCHED
}
