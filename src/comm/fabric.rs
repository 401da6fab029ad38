use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::comm::tags::Tag;

/// A worker's position in the static rank set.
pub type Rank = i32;

/// Identifies one outstanding transport operation on a fabric endpoint.
pub type TransferId = u64;

/// A message that arrived from the fabric.
#[derive(Debug)]
pub struct Inbound {
    pub source: Rank,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

/// Point-to-point, non-blocking message transport between a fixed set of
/// ranks. Delivery is reliable and FIFO per ordered `(source, destination)`
/// pair; there are no retries and no failure notifications.
///
/// The message queue only ever *tests* outstanding operations; no method may
/// block.
pub trait Fabric: Send {
    fn rank(&self) -> Rank;

    fn num_ranks(&self) -> usize;

    /// Starts an asynchronous send. The buffer is shared with the fabric
    /// until the returned transfer completes.
    fn isend(&mut self, dest: Rank, tag: Tag, data: Arc<Vec<u8>>) -> TransferId;

    /// Tests a send for completion. Once true, the buffer is no longer
    /// referenced by the fabric.
    fn test_send(&mut self, transfer: TransferId) -> bool;

    /// Tests the single outstanding receive. Returns at most one message.
    fn try_recv(&mut self) -> Option<Inbound>;
}

/// Shared-memory fabric connecting all ranks of one process.
///
/// This is the transport the worker binary and the integration tests run on;
/// bindings to an external message-passing runtime live downstream. Sends
/// deliver into the destination's inbox under a single lock, which trivially
/// satisfies the per-pair FIFO guarantee.
pub struct InProcessFabric {
    rank: Rank,
    next_transfer: TransferId,
    mesh: Arc<Mesh>,
}

struct Mesh {
    inboxes: Vec<Mutex<VecDeque<Inbound>>>,
}

impl InProcessFabric {
    /// Creates a fully connected mesh and returns one endpoint per rank.
    pub fn mesh(num_ranks: usize) -> Vec<InProcessFabric> {
        let mesh = Arc::new(Mesh {
            inboxes: (0..num_ranks).map(|_| Mutex::new(VecDeque::new())).collect(),
        });
        (0..num_ranks)
            .map(|rank| InProcessFabric {
                rank: rank as Rank,
                next_transfer: 0,
                mesh: mesh.clone(),
            })
            .collect()
    }
}

impl Fabric for InProcessFabric {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.mesh.inboxes.len()
    }

    fn isend(&mut self, dest: Rank, tag: Tag, data: Arc<Vec<u8>>) -> TransferId {
        let payload = Arc::try_unwrap(data).unwrap_or_else(|shared| (*shared).clone());
        self.mesh.inboxes[dest as usize].lock().push_back(Inbound {
            source: self.rank,
            tag,
            payload,
        });
        let id = self.next_transfer;
        self.next_transfer += 1;
        id
    }

    fn test_send(&mut self, _transfer: TransferId) -> bool {
        // Delivery happens inside isend, so the buffer is already released.
        true
    }

    fn try_recv(&mut self) -> Option<Inbound> {
        self.mesh.inboxes[self.rank as usize].lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_delivers_in_order_per_pair() {
        let mut endpoints = InProcessFabric::mesh(2);
        let (mut a, mut b) = {
            let second = endpoints.pop().unwrap();
            (endpoints.pop().unwrap(), second)
        };
        assert_eq!(a.rank(), 0);
        assert_eq!(b.rank(), 1);

        for i in 0..5u8 {
            let t = a.isend(1, 7, Arc::new(vec![i]));
            assert!(a.test_send(t));
        }
        for i in 0..5u8 {
            let msg = b.try_recv().expect("message missing");
            assert_eq!(msg.source, 0);
            assert_eq!(msg.tag, 7);
            assert_eq!(msg.payload, vec![i]);
        }
        assert!(b.try_recv().is_none());
    }
}
