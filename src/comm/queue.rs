use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::comm::fabric::{Fabric, Rank, TransferId};
use crate::comm::tags::{self, Tag};
use crate::data::serialize::{Reader, Writer};
use crate::error::{fatal, SchedError};
use crate::shutdown::Terminator;

/// Bytes appended to every fragment: `(send_id, batch_index, total_batches)`.
pub const FRAGMENT_TRAILER_BYTES: usize = 3 * 4;

/// Work cap per pipeline per `advance()` call, to bound scheduler latency.
const MAX_PER_PIPELINE: usize = 4;

const CHANNEL_CAPACITY: usize = 1024;
const THREAD_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A message as seen by a tag callback.
#[derive(Debug)]
pub struct Message {
    pub source: Rank,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

type Callback = Rc<RefCell<dyn FnMut(&mut Message)>>;
type SentCallback = Box<dyn FnMut(i32)>;

struct BatchState {
    size_per_batch: usize,
    sent_batches: i32,
    total_batches: i32,
}

struct SendHandle {
    id: i32,
    dest: Rank,
    tag: Tag,
    data: Arc<Vec<u8>>,
    transfer: TransferId,
    batch: Option<BatchState>,
}

impl SendHandle {
    fn next_batch(&self) -> Option<(Tag, Arc<Vec<u8>>)> {
        let batch = self.batch.as_ref()?;
        let begin = batch.sent_batches as usize * batch.size_per_batch;
        let end = (begin + batch.size_per_batch).min(self.data.len());
        let mut w = Writer::with_capacity(end - begin + FRAGMENT_TRAILER_BYTES);
        w.put_bytes(&self.data[begin..end]);
        w.put_i32(self.id);
        w.put_i32(batch.sent_batches);
        w.put_i32(batch.total_batches);
        Some((self.tag + tags::MSG_OFFSET_BATCHED, Arc::new(w.into_bytes())))
    }
}

struct SelfMessage {
    id: i32,
    tag: Tag,
    data: Arc<Vec<u8>>,
}

struct ReceiveFragment {
    source: Rank,
    tag: Tag,
    fragments: Vec<Option<Vec<u8>>>,
    received: i32,
}

struct QueueState {
    fabric: Box<dyn Fabric>,
    my_rank: Rank,
    max_msg_size: usize,
    running_send_id: i32,
    send_queue: VecDeque<SendHandle>,
    self_recv_queue: VecDeque<SelfMessage>,
    fragmented: HashMap<(Rank, i32), ReceiveFragment>,
}

/// Queues shared with the assembler thread.
struct FusedQueue {
    messages: Mutex<VecDeque<Message>>,
    count: AtomicUsize,
}

struct QueueInner {
    state: RefCell<QueueState>,
    callbacks: RefCell<HashMap<Tag, Callback>>,
    sent_callback: RefCell<Option<SentCallback>>,
    fused: Arc<FusedQueue>,
    assembler_tx: Sender<ReceiveFragment>,
    garbage_tx: Sender<Arc<Vec<u8>>>,
    stop: Terminator,
    threads: RefCell<Vec<JoinHandle<()>>>,
}

/// In-flight management of asynchronous messages over a [`Fabric`], including
/// self-messages and transparent fragmentation of payloads larger than
/// `max_msg_size`.
///
/// The handle is cheap to clone; every component that sends or registers
/// callbacks holds a clone. All state lives on the worker's main thread,
/// except the fused queue (filled by the assembler thread) and the garbage
/// channel (drained by the collector thread).
#[derive(Clone)]
pub struct MessageQueue {
    inner: Rc<QueueInner>,
}

/// Non-owning handle for use inside registered callbacks. Callbacks live in
/// the queue itself; holding the queue strongly from there would keep its
/// threads alive forever.
#[derive(Clone)]
pub struct WeakMessageQueue {
    inner: std::rc::Weak<QueueInner>,
}

impl WeakMessageQueue {
    pub fn upgrade(&self) -> Option<MessageQueue> {
        self.inner.upgrade().map(|inner| MessageQueue { inner })
    }
}

impl MessageQueue {
    pub fn downgrade(&self) -> WeakMessageQueue {
        WeakMessageQueue {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn new(fabric: Box<dyn Fabric>, max_msg_size: usize) -> Self {
        let my_rank = fabric.rank();
        let stop = Terminator::new();
        let fused = Arc::new(FusedQueue {
            messages: Mutex::new(VecDeque::new()),
            count: AtomicUsize::new(0),
        });
        let (assembler_tx, assembler_rx) = bounded::<ReceiveFragment>(CHANNEL_CAPACITY);
        let (garbage_tx, garbage_rx) = bounded::<Arc<Vec<u8>>>(CHANNEL_CAPACITY);

        let mut threads = Vec::new();
        {
            let fused = fused.clone();
            let stop = stop.clone();
            threads.push(std::thread::spawn(move || {
                run_fragment_assembler(assembler_rx, fused, stop)
            }));
        }
        {
            let stop = stop.clone();
            threads.push(std::thread::spawn(move || {
                run_garbage_collector(garbage_rx, stop)
            }));
        }

        Self {
            inner: Rc::new(QueueInner {
                state: RefCell::new(QueueState {
                    fabric,
                    my_rank,
                    max_msg_size,
                    running_send_id: 1,
                    send_queue: VecDeque::new(),
                    self_recv_queue: VecDeque::new(),
                    fragmented: HashMap::new(),
                }),
                callbacks: RefCell::new(HashMap::new()),
                sent_callback: RefCell::new(None),
                fused,
                assembler_tx,
                garbage_tx,
                stop,
                threads: RefCell::new(threads),
            }),
        }
    }

    pub fn rank(&self) -> Rank {
        self.inner.state.borrow().my_rank
    }

    pub fn num_ranks(&self) -> usize {
        self.inner.state.borrow().fabric.num_ranks()
    }

    pub fn max_msg_size(&self) -> usize {
        self.inner.state.borrow().max_msg_size
    }

    /// Registers the callback for a tag. At most one callback per tag;
    /// registering twice is a fatal programming error.
    pub fn register_callback(&self, tag: Tag, cb: impl FnMut(&mut Message) + 'static) {
        let mut callbacks = self.inner.callbacks.borrow_mut();
        if callbacks.contains_key(&tag) {
            fatal(SchedError::ProtocolViolation(format!(
                "more than one callback for tag {tag}"
            )));
        }
        callbacks.insert(tag, Rc::new(RefCell::new(cb)));
    }

    /// Registers the single global callback invoked with the send id once a
    /// send (all of its batches) has completed.
    pub fn register_sent_callback(&self, cb: impl FnMut(i32) + 'static) {
        *self.inner.sent_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Enqueues an asynchronous send and returns its monotonically increasing
    /// id. Self-messages are routed through an internal queue without
    /// touching the fabric; payloads above the fragmentation threshold are
    /// split into batches of `max_msg_size` bytes plus a trailer.
    pub fn send(&self, data: Arc<Vec<u8>>, dest: Rank, tag: Tag) -> i32 {
        let mut state = self.inner.state.borrow_mut();
        let id = state.running_send_id;
        state.running_send_id += 1;

        tracing::trace!(n = data.len(), dest, tag, id, "MQ send");

        if dest == state.my_rank {
            state.self_recv_queue.push_back(SelfMessage { id, tag, data });
            return id;
        }

        let mut handle = SendHandle {
            id,
            dest,
            tag,
            data,
            transfer: 0,
            batch: None,
        };
        if handle.data.len() > state.max_msg_size + FRAGMENT_TRAILER_BYTES {
            let size_per_batch = state.max_msg_size;
            let total_batches = handle.data.len().div_ceil(size_per_batch) as i32;
            handle.batch = Some(BatchState {
                size_per_batch,
                sent_batches: 0,
                total_batches,
            });
            let (send_tag, staging) = handle.next_batch().unwrap();
            tracing::trace!(id, total_batches, "MQ sending batch 0");
            handle.transfer = state.fabric.isend(dest, send_tag, staging);
        } else {
            handle.transfer = state.fabric.isend(dest, tag, handle.data.clone());
        }
        state.send_queue.push_back(handle);
        id
    }

    /// Drives one step of all pipelines: receive, self-receive, assembled
    /// receive, send completion. Never blocks; work per pipeline is capped.
    pub fn advance(&self) {
        self.process_received();
        self.process_self_received();
        self.process_assembled_received();
        self.process_sent();
    }

    fn dispatch(&self, msg: &mut Message) {
        let callback = {
            let callbacks = self.inner.callbacks.borrow();
            match callbacks.get(&msg.tag) {
                Some(cb) => cb.clone(),
                None => fatal(SchedError::ProtocolViolation(format!(
                    "no callback for tag {}",
                    msg.tag
                ))),
            }
        };
        (callback.borrow_mut())(msg);
    }

    fn notify_sent(&self, id: i32) {
        if let Some(cb) = self.inner.sent_callback.borrow_mut().as_mut() {
            cb(id);
        }
    }

    fn process_received(&self) {
        let inbound = self.inner.state.borrow_mut().fabric.try_recv();
        let Some(inbound) = inbound else {
            return;
        };

        tracing::trace!(
            n = inbound.payload.len(),
            source = inbound.source,
            tag = inbound.tag,
            "MQ recv"
        );

        if tags::is_fragment(inbound.tag) {
            self.store_fragment(inbound);
        } else {
            let mut msg = Message {
                source: inbound.source,
                tag: inbound.tag,
                payload: inbound.payload,
            };
            self.dispatch(&mut msg);
        }
    }

    fn store_fragment(&self, inbound: crate::comm::fabric::Inbound) {
        let tag = inbound.tag - tags::MSG_OFFSET_BATCHED;
        let mut payload = inbound.payload;
        if payload.len() < FRAGMENT_TRAILER_BYTES {
            fatal(SchedError::ProtocolViolation(format!(
                "fragment of {} bytes lacks a trailer",
                payload.len()
            )));
        }
        let trailer_at = payload.len() - FRAGMENT_TRAILER_BYTES;
        let (send_id, batch_index, total_batches) = {
            let mut r = Reader::new(&payload[trailer_at..]);
            (
                r.get_i32().unwrap(),
                r.get_i32().unwrap(),
                r.get_i32().unwrap(),
            )
        };
        payload.truncate(trailer_at);

        if batch_index < 0 || batch_index >= total_batches {
            fatal(SchedError::ProtocolViolation(format!(
                "invalid batch {batch_index}/{total_batches}"
            )));
        }

        let mut state = self.inner.state.borrow_mut();
        let key = (inbound.source, send_id);
        let fragment = state.fragmented.entry(key).or_insert_with(|| ReceiveFragment {
            source: inbound.source,
            tag,
            fragments: Vec::new(),
            received: 0,
        });
        if fragment.tag != tag || fragment.source != inbound.source {
            fatal(SchedError::ProtocolViolation(format!(
                "fragment key ({}, {send_id}) carries mismatched tag {tag}",
                inbound.source
            )));
        }
        if fragment.fragments.len() < total_batches as usize {
            fragment.fragments.resize(total_batches as usize, None);
        }
        let slot = &mut fragment.fragments[batch_index as usize];
        if slot.is_some() {
            fatal(SchedError::ProtocolViolation(format!(
                "batch {batch_index}/{total_batches} already present"
            )));
        }
        *slot = Some(payload);
        fragment.received += 1;

        if fragment.received == total_batches {
            let complete = state.fragmented.remove(&key).unwrap();
            drop(state);
            // Hand the group to the assembler thread.
            let _ = self.inner.assembler_tx.send(complete);
        }
    }

    fn process_self_received(&self) {
        // Drain a bounded batch up front: callbacks may send further
        // self-messages, which must not be observed mid-iteration.
        let drained: Vec<SelfMessage> = {
            let mut state = self.inner.state.borrow_mut();
            let n = state.self_recv_queue.len().min(MAX_PER_PIPELINE);
            state.self_recv_queue.drain(..n).collect()
        };
        let my_rank = self.rank();
        for sm in drained {
            let payload = Arc::try_unwrap(sm.data).unwrap_or_else(|shared| (*shared).clone());
            let mut msg = Message {
                source: my_rank,
                tag: sm.tag,
                payload,
            };
            self.dispatch(&mut msg);
            self.notify_sent(sm.id);
        }
    }

    fn process_assembled_received(&self) {
        if self.inner.fused.count.load(Ordering::Relaxed) == 0 {
            return;
        }
        let drained: Vec<Message> = {
            let Some(mut fused) = self.inner.fused.messages.try_lock() else {
                return;
            };
            let n = fused.len().min(MAX_PER_PIPELINE);
            fused.drain(..n).collect()
        };
        self.inner.fused.count.fetch_sub(drained.len(), Ordering::Relaxed);

        let max_msg_size = self.max_msg_size();
        for mut msg in drained {
            tracing::trace!(tag = msg.tag, n = msg.payload.len(), "MQ fused");
            self.dispatch(&mut msg);
            if msg.payload.len() > max_msg_size {
                // Large buffers are freed off the hot path.
                let _ = self.inner.garbage_tx.send(Arc::new(std::mem::take(&mut msg.payload)));
            }
        }
    }

    fn process_sent(&self) {
        let mut completed: Vec<i32> = Vec::new();
        let mut garbage: Vec<Arc<Vec<u8>>> = Vec::new();
        {
            let mut state = self.inner.state.borrow_mut();
            let mut num_tested = 0;
            let mut i = 0;
            while i < state.send_queue.len() {
                if num_tested >= MAX_PER_PIPELINE {
                    break;
                }
                let transfer = state.send_queue[i].transfer;
                let done = state.fabric.test_send(transfer);
                num_tested += 1;
                if !done {
                    i += 1;
                    continue;
                }

                let mut finished = true;
                let entry_id = state.send_queue[i].id;
                if let Some(batch) = state.send_queue[i].batch.as_mut() {
                    batch.sent_batches += 1;
                    tracing::trace!(
                        id = entry_id,
                        sent = batch.sent_batches,
                        total = batch.total_batches,
                        "MQ sent batch"
                    );
                    if batch.sent_batches < batch.total_batches {
                        finished = false;
                    }
                }

                if finished {
                    let handle = state.send_queue.remove(i).unwrap();
                    completed.push(handle.id);
                    if handle.data.len() > state.max_msg_size {
                        garbage.push(handle.data);
                    }
                    // The removal shifted the next handle into slot i.
                } else {
                    let (send_tag, staging) = state.send_queue[i].next_batch().unwrap();
                    let dest = state.send_queue[i].dest;
                    let transfer = state.fabric.isend(dest, send_tag, staging);
                    state.send_queue[i].transfer = transfer;
                    i += 1;
                }
            }
        }
        for id in completed {
            self.notify_sent(id);
        }
        for data in garbage {
            let _ = self.inner.garbage_tx.send(data);
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.stop.terminate();
        for handle in self.threads.borrow_mut().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Consumes completed fragment groups, concatenates their buffers in batch
/// order and publishes the reassembled message for the main thread.
fn run_fragment_assembler(
    rx: Receiver<ReceiveFragment>,
    fused: Arc<FusedQueue>,
    stop: Terminator,
) {
    loop {
        if stop.is_terminating() {
            return;
        }
        let fragment = match rx.recv_timeout(THREAD_POLL_INTERVAL) {
            Ok(f) => f,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if fragment.fragments.is_empty() {
            continue;
        }
        let total: usize = fragment
            .fragments
            .iter()
            .map(|f| match f {
                Some(buf) => buf.len(),
                None => fatal(SchedError::ProtocolViolation(
                    "assembling an incomplete fragment group".into(),
                )),
            })
            .sum();
        let mut payload = Vec::with_capacity(total);
        for buf in fragment.fragments.into_iter().flatten() {
            payload.extend_from_slice(&buf);
        }
        let msg = Message {
            source: fragment.source,
            tag: fragment.tag,
            payload,
        };
        fused.messages.lock().push_back(msg);
        fused.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drops large buffers on its own schedule, keeping deallocation off the main
/// thread's hot path.
fn run_garbage_collector(rx: Receiver<Arc<Vec<u8>>>, stop: Terminator) {
    loop {
        if stop.is_terminating() {
            return;
        }
        match rx.recv_timeout(THREAD_POLL_INTERVAL) {
            Ok(buffer) => drop(buffer),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::fabric::InProcessFabric;

    fn queue_pair(max_msg_size: usize) -> (MessageQueue, MessageQueue) {
        let mut endpoints = InProcessFabric::mesh(2);
        let b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();
        (
            MessageQueue::new(Box::new(a), max_msg_size),
            MessageQueue::new(Box::new(b), max_msg_size),
        )
    }

    #[test]
    fn test_direct_send_invokes_callback_once() {
        let (a, b) = queue_pair(64);
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            b.register_callback(7, move |msg| {
                seen.borrow_mut().push((msg.source, msg.payload.clone()));
            });
        }
        a.send(Arc::new(vec![1, 2, 3]), 1, 7);
        for _ in 0..4 {
            a.advance();
            b.advance();
        }
        assert_eq!(&*seen.borrow(), &[(0, vec![1, 2, 3])]);
    }

    #[test]
    fn test_self_message_callback_precedes_sent_callback() {
        let (a, _b) = queue_pair(64);
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = order.clone();
            a.register_callback(42, move |msg| {
                assert_eq!(msg.source, 0);
                order.borrow_mut().push("received".to_string());
            });
        }
        {
            let order = order.clone();
            a.register_sent_callback(move |id| {
                order.borrow_mut().push(format!("sent {id}"));
            });
        }
        let id = a.send(Arc::new(vec![9]), 0, 42);
        a.advance();
        assert_eq!(&*order.borrow(), &["received".to_string(), format!("sent {id}")]);
    }

    #[test]
    fn test_fragmented_send_reassembles_byte_identical() {
        let max = 16;
        let (a, b) = queue_pair(max);
        let payload: Vec<u8> = (0..(3 * max as u32 + 5)).map(|i| (i % 251) as u8).collect();

        let received = Rc::new(RefCell::new(Vec::new()));
        {
            let received = received.clone();
            b.register_callback(7, move |msg| {
                received.borrow_mut().push(msg.payload.clone());
            });
        }
        let sent = Rc::new(RefCell::new(Vec::new()));
        {
            let sent = sent.clone();
            a.register_sent_callback(move |id| sent.borrow_mut().push(id));
        }

        let id = a.send(Arc::new(payload.clone()), 1, 7);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while received.borrow().is_empty() || sent.borrow().is_empty() {
            assert!(std::time::Instant::now() < deadline, "reassembly timed out");
            a.advance();
            b.advance();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(&*received.borrow(), &[payload]);
        assert_eq!(&*sent.borrow(), &[id]);
    }

    #[test]
    fn test_send_ids_are_monotonic() {
        let (a, b) = queue_pair(64);
        b.register_callback(1, |_| {});
        let first = a.send(Arc::new(vec![0]), 1, 1);
        let second = a.send(Arc::new(vec![0]), 1, 1);
        assert!(second > first);
    }
}
