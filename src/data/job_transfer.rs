use std::cmp::Ordering;

use crate::comm::fabric::Rank;
use crate::data::serialize::{Reader, Serializable, Writer};
use crate::error::{Result, SchedError};

/// Application a job belongs to. The core only transports application
/// payloads and decides who runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Application {
    Dummy,
    Sat,
    KMeans,
}

impl Application {
    pub fn from_i32(v: i32) -> Result<Self> {
        match v {
            0 => Ok(Application::Dummy),
            1 => Ok(Application::Sat),
            2 => Ok(Application::KMeans),
            other => Err(SchedError::UnknownApplication(other)),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Application::Dummy => 0,
            Application::Sat => 1,
            Application::KMeans => 2,
        }
    }
}

impl std::fmt::Display for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Application::Dummy => write!(f, "dummy"),
            Application::Sat => write!(f, "sat"),
            Application::KMeans => write!(f, "kmeans"),
        }
    }
}

/// The unit of scheduling traffic: a request for somebody to become the node
/// at `requested_node_index` of a job's tree.
///
/// Wire layout: 40 bytes, nine `i32`s and one `f32` in field order.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: i32,
    pub application: Application,
    pub root_rank: Rank,
    pub requesting_node_rank: Rank,
    pub requested_node_index: i32,
    pub current_revision: i32,
    pub last_known_revision: i32,
    pub time_of_birth: f32,
    pub num_hops: i32,
    pub balancing_epoch: i32,
}

impl JobRequest {
    pub const TRANSFER_SIZE: usize = 9 * 4 + 4;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: i32,
        application: Application,
        root_rank: Rank,
        requesting_node_rank: Rank,
        requested_node_index: i32,
        time_of_birth: f32,
        balancing_epoch: i32,
        num_hops: i32,
    ) -> Self {
        Self {
            job_id,
            application,
            root_rank,
            requesting_node_rank,
            requested_node_index,
            current_revision: 0,
            last_known_revision: -1,
            time_of_birth,
            num_hops,
            balancing_epoch,
        }
    }

    fn order_key(&self) -> (i32, i32, i32, i32) {
        (
            self.balancing_epoch,
            self.job_id,
            self.requested_node_index,
            self.current_revision,
        )
    }
}

impl PartialEq for JobRequest {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}

impl Eq for JobRequest {}

impl PartialOrd for JobRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

impl std::fmt::Display for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "r.#{}:{} rev. {} <- [{}] born={:.3} hops={} epoch={}",
            self.job_id,
            self.requested_node_index,
            self.current_revision,
            self.requesting_node_rank,
            self.time_of_birth,
            self.num_hops,
            self.balancing_epoch
        )
    }
}

impl Serializable for JobRequest {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::TRANSFER_SIZE);
        w.put_i32(self.job_id);
        w.put_i32(self.application.as_i32());
        w.put_i32(self.root_rank);
        w.put_i32(self.requesting_node_rank);
        w.put_i32(self.requested_node_index);
        w.put_i32(self.current_revision);
        w.put_i32(self.last_known_revision);
        w.put_f32(self.time_of_birth);
        w.put_i32(self.num_hops);
        w.put_i32(self.balancing_epoch);
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            job_id: r.get_i32()?,
            application: Application::from_i32(r.get_i32()?)?,
            root_rank: r.get_i32()?,
            requesting_node_rank: r.get_i32()?,
            requested_node_index: r.get_i32()?,
            current_revision: r.get_i32()?,
            last_known_revision: r.get_i32()?,
            time_of_birth: r.get_f32()?,
            num_hops: r.get_i32()?,
            balancing_epoch: r.get_i32()?,
        })
    }
}

/// Explicit rejection of a targeted (oneshot) request, carrying whether the
/// rejecting rank still holds the job as a dormant node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneshotJobRequestRejection {
    pub request: JobRequest,
    pub is_child_still_dormant: bool,
}

impl Serializable for OneshotJobRequestRejection {
    fn serialize(&self) -> Vec<u8> {
        let mut bytes = self.request.serialize();
        bytes.push(self.is_child_still_dormant as u8);
        bytes
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let request = JobRequest::deserialize(bytes)?;
        let mut r = Reader::new(&bytes[JobRequest::TRANSFER_SIZE..]);
        Ok(Self {
            request,
            is_child_still_dormant: r.get_u8()? != 0,
        })
    }
}

/// A generic request for any kind of work, used by idle ranks.
///
/// Ordering prefers recent epochs, then fewer hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub requesting_rank: Rank,
    pub num_hops: i32,
    pub balancing_epoch: i32,
}

impl PartialOrd for WorkRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .balancing_epoch
            .cmp(&self.balancing_epoch)
            .then(self.num_hops.cmp(&other.num_hops))
            .then(self.requesting_rank.cmp(&other.requesting_rank))
    }
}

impl Serializable for WorkRequest {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(12);
        w.put_i32(self.requesting_rank);
        w.put_i32(self.num_hops);
        w.put_i32(self.balancing_epoch);
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            requesting_rank: r.get_i32()?,
            num_hops: r.get_i32()?,
            balancing_epoch: r.get_i32()?,
        })
    }
}

/// Header preceding a bulk description transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSignature {
    pub job_id: i32,
    pub root_rank: Rank,
    pub first_included_revision: i32,
    pub transfer_size: u64,
}

impl Serializable for JobSignature {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(20);
        w.put_i32(self.job_id);
        w.put_i32(self.root_rank);
        w.put_i32(self.first_included_revision);
        w.put_u64(self.transfer_size);
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            job_id: r.get_i32()?,
            root_rank: r.get_i32()?,
            first_included_revision: r.get_i32()?,
            transfer_size: r.get_u64()?,
        })
    }
}

/// Application-internal message, carried opaquely by the message queue.
/// Payload length is implied by the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMessage {
    pub job_id: i32,
    pub revision: i32,
    pub tag: i32,
    pub epoch: i32,
    pub checksum: u64,
    pub payload: Vec<i32>,
}

impl Serializable for JobMessage {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4 * 4 + 8 + 4 * self.payload.len());
        w.put_i32(self.job_id);
        w.put_i32(self.revision);
        w.put_i32(self.tag);
        w.put_i32(self.epoch);
        w.put_u64(self.checksum);
        w.put_i32_slice(&self.payload);
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            job_id: r.get_i32()?,
            revision: r.get_i32()?,
            tag: r.get_i32()?,
            epoch: r.get_i32()?,
            checksum: r.get_u64()?,
            payload: r.get_remaining_i32s()?,
        })
    }
}

/// Two `i32`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntPair(pub i32, pub i32);

impl Serializable for IntPair {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(8);
        w.put_i32(self.0);
        w.put_i32(self.1);
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self(r.get_i32()?, r.get_i32()?))
    }
}

/// A raw `i32` sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntVec(pub Vec<i32>);

impl IntVec {
    pub fn get(&self, idx: usize) -> i32 {
        self.0[idx]
    }
}

impl From<Vec<i32>> for IntVec {
    fn from(data: Vec<i32>) -> Self {
        Self(data)
    }
}

impl Serializable for IntVec {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4 * self.0.len());
        w.put_i32_slice(&self.0);
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self(r.get_remaining_i32s()?))
    }
}

/// One revision of a job's description: the opaque payload the application
/// layer hands to its solvers, prefixed by identity and a checksum over the
/// payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionChunk {
    pub job_id: i32,
    pub revision: i32,
    pub checksum: u64,
    pub payload: Vec<u8>,
}

impl DescriptionChunk {
    pub fn new(job_id: i32, revision: i32, payload: Vec<u8>) -> Self {
        let checksum = crate::data::serialize::checksum(&payload);
        Self {
            job_id,
            revision,
            checksum,
            payload,
        }
    }

    pub fn checksum_valid(&self) -> bool {
        crate::data::serialize::checksum(&self.payload) == self.checksum
    }
}

impl Serializable for DescriptionChunk {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(2 * 4 + 8 + self.payload.len());
        w.put_i32(self.job_id);
        w.put_i32(self.revision);
        w.put_u64(self.checksum);
        w.put_bytes(&self.payload);
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            job_id: r.get_i32()?,
            revision: r.get_i32()?,
            checksum: r.get_u64()?,
            payload: r.get_remaining_bytes().to_vec(),
        })
    }
}

/// Final outcome of a job revision, transferred to the client on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub job_id: i32,
    pub revision: i32,
    pub result_code: i32,
    pub solution: Vec<i32>,
}

impl Serializable for JobResult {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(3 * 4 + 4 * self.solution.len());
        w.put_i32(self.job_id);
        w.put_i32(self.revision);
        w.put_i32(self.result_code);
        w.put_i32_slice(&self.solution);
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            job_id: r.get_i32()?,
            revision: r.get_i32()?,
            result_code: r.get_i32()?,
            solution: r.get_remaining_i32s()?,
        })
    }
}

/// Summary accompanying a "job done" notification to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatistics {
    pub job_id: i32,
    pub successful_rank: Rank,
    pub used_wallclock_seconds: f32,
    pub used_cpu_seconds: f32,
    pub latency_of_first_volume_update: f32,
}

impl Serializable for JobStatistics {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(5 * 4);
        w.put_i32(self.job_id);
        w.put_i32(self.successful_rank);
        w.put_f32(self.used_wallclock_seconds);
        w.put_f32(self.used_cpu_seconds);
        w.put_f32(self.latency_of_first_volume_update);
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            job_id: r.get_i32()?,
            successful_rank: r.get_i32()?,
            used_wallclock_seconds: r.get_f32()?,
            used_cpu_seconds: r.get_f32()?,
            latency_of_first_volume_update: r.get_f32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> JobRequest {
        JobRequest {
            job_id: 42,
            application: Application::Sat,
            root_rank: 3,
            requesting_node_rank: 5,
            requested_node_index: 6,
            current_revision: 2,
            last_known_revision: 1,
            time_of_birth: 17.5,
            num_hops: 9,
            balancing_epoch: 4,
        }
    }

    #[test]
    fn test_job_request_round_trip() {
        let req = sample_request();
        let bytes = req.serialize();
        assert_eq!(bytes.len(), JobRequest::TRANSFER_SIZE);
        let back = JobRequest::deserialize(&bytes).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.num_hops, req.num_hops);
        assert_eq!(back.time_of_birth, req.time_of_birth);
    }

    #[test]
    fn test_job_request_ordering_is_epoch_major() {
        let mut a = sample_request();
        let mut b = sample_request();
        a.balancing_epoch = 1;
        b.balancing_epoch = 2;
        assert!(a < b);

        b.balancing_epoch = 1;
        b.job_id = a.job_id + 1;
        assert!(a < b);

        b.job_id = a.job_id;
        b.requested_node_index = a.requested_node_index + 1;
        assert!(a < b);
    }

    #[test]
    fn test_oneshot_rejection_round_trip() {
        for dormant in [false, true] {
            let rej = OneshotJobRequestRejection {
                request: sample_request(),
                is_child_still_dormant: dormant,
            };
            let back = OneshotJobRequestRejection::deserialize(&rej.serialize()).unwrap();
            assert_eq!(back, rej);
        }
    }

    #[test]
    fn test_work_request_round_trip_and_ordering() {
        let a = WorkRequest {
            requesting_rank: 1,
            num_hops: 3,
            balancing_epoch: 7,
        };
        let bytes = a.serialize();
        assert_eq!(bytes.len(), 12);
        assert_eq!(WorkRequest::deserialize(&bytes).unwrap(), a);

        let older_epoch = WorkRequest {
            balancing_epoch: 6,
            ..a.clone()
        };
        assert!(a < older_epoch);
    }

    #[test]
    fn test_job_signature_round_trip() {
        let sig = JobSignature {
            job_id: 9,
            root_rank: 0,
            first_included_revision: 1,
            transfer_size: 1 << 40,
        };
        let bytes = sig.serialize();
        assert_eq!(bytes.len(), 20);
        assert_eq!(JobSignature::deserialize(&bytes).unwrap(), sig);
    }

    #[test]
    fn test_job_message_round_trip() {
        let msg = JobMessage {
            job_id: 1,
            revision: 0,
            tag: 11,
            epoch: 3,
            checksum: 0xdead_beef_cafe_f00d,
            payload: vec![-1, 0, 1, i32::MAX],
        };
        assert_eq!(JobMessage::deserialize(&msg.serialize()).unwrap(), msg);
    }

    #[test]
    fn test_int_pair_and_vec_round_trip() {
        let pair = IntPair(-3, 99);
        assert_eq!(IntPair::deserialize(&pair.serialize()).unwrap(), pair);

        let vec = IntVec(vec![5, 4, 3, 2, 1]);
        assert_eq!(IntVec::deserialize(&vec.serialize()).unwrap(), vec);

        let empty = IntVec(vec![]);
        assert_eq!(IntVec::deserialize(&empty.serialize()).unwrap(), empty);
    }

    #[test]
    fn test_description_chunk_checksum() {
        let chunk = DescriptionChunk::new(7, 0, vec![1, 2, 3, 4]);
        assert!(chunk.checksum_valid());
        let mut tampered = DescriptionChunk::deserialize(&chunk.serialize()).unwrap();
        assert_eq!(tampered, chunk);
        tampered.payload[0] ^= 0xff;
        assert!(!tampered.checksum_valid());
    }

    #[test]
    fn test_job_result_round_trip() {
        let res = JobResult {
            job_id: 2,
            revision: 1,
            result_code: 10,
            solution: vec![1, -2, 3],
        };
        assert_eq!(JobResult::deserialize(&res.serialize()).unwrap(), res);
    }

    #[test]
    fn test_job_statistics_round_trip() {
        let stats = JobStatistics {
            job_id: 5,
            successful_rank: 2,
            used_wallclock_seconds: 12.5,
            used_cpu_seconds: 48.0,
            latency_of_first_volume_update: 0.25,
        };
        assert_eq!(JobStatistics::deserialize(&stats.serialize()).unwrap(), stats);
    }
}
