// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-channel transport: framing, id correlation, and the receive worker.
//!
//! A channel owns one host-to-device (X2I) and one device-to-host (I2X)
//! ring. The host is the only writer of the X2I tail and the I2X head; the
//! device owns the opposite pointers. Senders serialize on the transmit
//! lock, which covers id allocation through the tail-register publish, so
//! a message id is always visible in the pending map before the device can
//! observe the message. The inbound ring is drained by a single worker
//! thread woken from interrupt context.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::mailbox::{MailboxResources, RingDesc};
use crate::pending::{PendingMap, PendingMsg};
use crate::wire::{self, MsgHeader, ASYNC_MSG_START_ID, HEADER_LEN, TOMBSTONE};
use crate::{AsyncMessage, IrqHandler, MailboxError, MailboxMessage, Result};

/// Writer-side state of the X2I ring. The cached tail is authoritative for
/// the next write position; the tail register mirrors it after every send.
struct TxState {
    tail: u32,
}

struct AsyncState {
    queue: VecDeque<AsyncMessage>,
    /// Unconsumed wakeups, one per queued message.
    wakeups: u32,
    shutdown: bool,
}

struct WorkState {
    /// Set by the interrupt handler; repeated sets before the worker runs
    /// coalesce into one drain pass.
    scheduled: bool,
    stop: bool,
}

/// Why a drain pass stopped consuming the inbound ring.
enum RecvEnd {
    /// Ring is empty; wait for the next interrupt.
    Empty,
    /// Framing error; drop the rest of this pass.
    Invalid,
}

/// One mailbox channel between the host driver and the device.
///
/// Created through [`crate::Mailbox::create_channel`] and torn down through
/// [`crate::Mailbox::destroy_channel`]; teardown cancels every outstanding
/// request by invoking its callback with no data.
pub struct MailboxChannel {
    res: MailboxResources,
    x2i: RingDesc,
    i2x: RingDesc,
    irq: u32,
    /// Interrupt-acknowledge register offset in the mailbox window.
    iohub_int_off: u32,
    /// Log prefix, `<label>.<irq>`.
    tag: String,
    down: AtomicBool,
    tx: Mutex<TxState>,
    pending: Mutex<PendingMap>,
    async_q: Mutex<AsyncState>,
    async_cv: Condvar,
    work: Mutex<WorkState>,
    work_cv: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for MailboxChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxChannel")
            .field("tag", &self.tag)
            .field("irq", &self.irq)
            .field("down", &self.down.load(Ordering::Relaxed))
            .finish()
    }
}

impl MailboxChannel {
    pub(crate) fn new(
        res: MailboxResources,
        x2i: RingDesc,
        i2x: RingDesc,
        iohub_int_off: u32,
        irq: u32,
    ) -> Result<Arc<Self>> {
        for ring in [&x2i, &i2x] {
            if !ring.size.is_power_of_two() {
                error!("{}: ring size must be a power of two", res.label);
                return Err(MailboxError::BadRingSize(ring.size));
            }
        }

        // Resume from wherever the device left the producer pointer.
        let x2i_tail = res.mbox.read32(x2i.tail_reg);

        let tag = format!("{}.{}", res.label, irq);
        let chann = Arc::new(Self {
            res,
            x2i,
            i2x,
            irq,
            iohub_int_off,
            tag,
            down: AtomicBool::new(false),
            tx: Mutex::new(TxState { tail: x2i_tail }),
            pending: Mutex::new(PendingMap::new()),
            async_q: Mutex::new(AsyncState {
                queue: VecDeque::new(),
                wakeups: 0,
                shutdown: false,
            }),
            async_cv: Condvar::new(),
            work: Mutex::new(WorkState {
                scheduled: false,
                stop: false,
            }),
            work_cv: Condvar::new(),
            worker: Mutex::new(None),
        });

        let worker = thread::Builder::new()
            .name(format!("npu-mbox.{irq}"))
            .spawn({
                let chann = Arc::clone(&chann);
                move || chann.rx_worker()
            })
            .map_err(MailboxError::Worker)?;
        *chann.worker.lock() = Some(worker);

        // Everything is in place; enabling the interrupt comes last.
        let handler: IrqHandler = {
            let chann = Arc::clone(&chann);
            Arc::new(move || chann.irq())
        };
        if let Err(err) = chann.res.irq.register(irq, handler) {
            error!("{}: failed to register irq: {err}", chann.tag);
            chann.stop_worker();
            return Err(err.into());
        }

        debug!("{}: channel created", chann.tag);
        Ok(chann)
    }

    /// Interrupt vector this channel is wired to.
    pub fn irq_vector(&self) -> u32 {
        self.irq
    }

    /// Interrupt handler body. Short and non-blocking: marks the receive
    /// worker runnable, then clears the device-side interrupt line.
    pub fn irq(&self) {
        trace!("{}: irq", self.tag);
        {
            let mut work = self.work.lock();
            if !work.stop {
                work.scheduled = true;
                self.work_cv.notify_one();
            }
        }
        self.reg_write(self.iohub_int_off, 0);
    }

    /// Frames `msg` and writes it into the X2I ring.
    ///
    /// Returns as soon as the message is visible to the device; the
    /// response arrives later through the message's callback. The transport
    /// never waits for ring space: a full ring surfaces
    /// [`MailboxError::NoSpace`] and the caller retries.
    pub fn send(&self, msg: MailboxMessage<'_>) -> Result<()> {
        if self.down.load(Ordering::Acquire) {
            return Err(MailboxError::Closed);
        }

        let MailboxMessage {
            opcode,
            payload,
            notify,
            tx_timeout: _,
        } = msg;

        let pkg_size = HEADER_LEN + payload.len();
        if pkg_size > self.x2i.size as usize {
            error!("{}: message size larger than ring buffer", self.tag);
            return Err(MailboxError::Oversize {
                got: pkg_size,
                cap: self.x2i.size,
            });
        }
        if payload.len() % 4 != 0 {
            error!("{}: message must be 4 bytes aligned", self.tag);
            return Err(MailboxError::Unaligned(payload.len()));
        }
        if let Some(first) = payload.first_chunk::<4>() {
            if u32::from_le_bytes(*first) == TOMBSTONE {
                error!("{}: tombstone in data", self.tag);
                return Err(MailboxError::TombstonePayload);
            }
        }

        let mut tx = self.tx.lock();

        // Re-checked under the map lock: teardown closes the map under the
        // same lock before its final drain, so a record allocated here is
        // always either completed or cancelled, never stranded.
        let id = {
            let mut pending = self.pending.lock();
            if pending.is_closed() {
                return Err(MailboxError::Closed);
            }
            pending.alloc(PendingMsg { notify, opcode })
        }
        .ok_or_else(|| {
            error!("{}: message id space exhausted", self.tag);
            MailboxError::IdsExhausted
        })?;

        let header = MsgHeader::request(opcode, id, payload.len() as u32);
        let mut pkg = Vec::with_capacity(pkg_size);
        pkg.extend_from_slice(&header.to_bytes());
        pkg.extend_from_slice(payload);

        debug!(
            "{}: opcode {:#x} size {} id {:#x}",
            self.tag, opcode, header.total_size, id
        );

        if let Err(err) = self.ring_push(&mut tx, &pkg) {
            debug!("{}: send failed: {err}", self.tag);
            self.pending.lock().remove(id);
            return Err(err);
        }
        Ok(())
    }

    /// Pops the oldest device-originated async message.
    ///
    /// With `blocking` set, suspends until a message is queued; the wait is
    /// interrupted by channel teardown. Without it, an empty queue surfaces
    /// [`MailboxError::Empty`].
    pub fn wait_async(&self, blocking: bool) -> Result<AsyncMessage> {
        let mut state = self.async_q.lock();
        if blocking {
            while state.wakeups == 0 && !state.shutdown {
                self.async_cv.wait(&mut state);
            }
            if state.shutdown {
                return Err(MailboxError::Interrupted);
            }
            state.wakeups -= 1;
        } else if state.shutdown {
            return Err(MailboxError::Closed);
        }
        state.queue.pop_front().ok_or(MailboxError::Empty)
    }

    /// Tears the channel down. Called with the channel already unlinked
    /// from the mailbox; idempotent.
    pub(crate) fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }

        // No new interrupts past this point.
        self.res.irq.unregister(self.irq);
        self.stop_worker();

        // Close and drain under one lock hold: a sender racing this point
        // either got its record in (cancelled below) or finds the map
        // closed and fails with Closed before allocating.
        let cancelled = {
            let mut pending = self.pending.lock();
            pending.close();
            pending.drain()
        };
        for (id, msg) in cancelled {
            debug!(
                "{}: cancelling id {:#x} opcode {:#x}",
                self.tag, id, msg.opcode
            );
            if let Some(notify) = msg.notify {
                notify(None);
            }
        }

        {
            let mut state = self.async_q.lock();
            state.queue.clear();
            state.wakeups = 0;
            state.shutdown = true;
        }
        self.async_cv.notify_all();

        debug!("{}: channel destroyed", self.tag);
    }

    /// Stops the worker, flushing a pass that was already scheduled.
    fn stop_worker(&self) {
        {
            let mut work = self.work.lock();
            work.stop = true;
            self.work_cv.notify_one();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn reg_read(&self, reg: u32) -> u32 {
        self.res.mbox.read32(reg)
    }

    fn reg_write(&self, reg: u32, value: u32) {
        self.res.mbox.write32(reg, value)
    }

    /// Publishes a new I2X head to the device, then to the local cache.
    fn set_headptr(&self, head: &mut u32, value: u32) {
        self.reg_write(self.i2x.head_reg, value);
        *head = value;
        trace!("{}: set head {}", self.tag, value);
    }

    /// Publishes a new X2I tail to the device, then to the local cache.
    fn set_tailptr(&self, tx: &mut TxState, value: u32) {
        self.reg_write(self.x2i.tail_reg, value);
        tx.tail = value;
        trace!("{}: set tail {}", self.tag, value);
    }

    /// Writes one framed message into the X2I ring.
    ///
    /// Ring discipline: the producer may not catch up with the consumer's
    /// head, and a message never straddles the end of the buffer. When the
    /// remaining suffix is too short, a tombstone word marks it dead and the
    /// message is written from offset 0 instead, provided the consumer has
    /// moved far enough in.
    fn ring_push(&self, tx: &mut TxState, pkg: &[u8]) -> Result<()> {
        let head = self.reg_read(self.x2i.head_reg);
        let ring_size = self.x2i.size;
        let pkg_size = pkg.len() as u32;
        let mut tail = tx.tail;
        let tmp_tail = tail + pkg_size;

        if tail < head && tmp_tail >= head {
            return Err(MailboxError::NoSpace);
        }
        if tail >= head && tmp_tail > ring_size - 4 && pkg_size >= head {
            return Err(MailboxError::NoSpace);
        }

        if tail >= head && tmp_tail > ring_size - 4 {
            self.res.ringbuf.write32(self.x2i.start + tail, TOMBSTONE);
            // Tombstone is set; write from the start of the ring.
            tail = 0;
        }

        self.res.ringbuf.write_bytes(self.x2i.start + tail, pkg);
        self.set_tailptr(tx, tail + pkg_size);
        Ok(())
    }

    fn rx_worker(&self) {
        let mut head: u32 = 0;
        loop {
            let (run, stop) = {
                let mut work = self.work.lock();
                while !work.scheduled && !work.stop {
                    self.work_cv.wait(&mut work);
                }
                let run = work.scheduled;
                work.scheduled = false;
                (run, work.stop)
            };
            if run {
                // Keep consuming until the ring is empty or a message is
                // malformed; neither outcome tears the channel down.
                while self.recv_one(&mut head).is_ok() {}
            }
            if stop {
                break;
            }
        }
    }

    /// Consumes one inbound message (or one tombstone) from the I2X ring.
    fn recv_one(&self, head: &mut u32) -> core::result::Result<(), RecvEnd> {
        let tail = self.reg_read(self.i2x.tail_reg);
        let ring_size = self.i2x.size;

        if (*head & (ring_size - 1)) == (tail & (ring_size - 1)) {
            return Err(RecvEnd::Empty);
        }

        let mut h = *head;
        if h == ring_size {
            h = 0;
        }

        // The first word is either the total size or a tombstone.
        let first = self.res.ringbuf.read32(self.i2x.start + h);
        if first == TOMBSTONE {
            self.set_headptr(head, 0);
            return Ok(());
        }

        let msg_size = first;
        let mut raw = [0u8; HEADER_LEN];
        self.res.ringbuf.read_bytes(self.i2x.start + h, &mut raw);
        let header = MsgHeader::from_bytes(&raw);

        // Only valid in the current segment; the tombstone path above covers
        // the producer wrap, so head <= tail holds here (modulo stale data,
        // which this check rejects).
        if u64::from(msg_size) + HEADER_LEN as u64 > u64::from(tail.wrapping_sub(h)) {
            warn!(
                "{}: invalid message size {}, tail {}, head {}",
                self.tag, msg_size, tail, h
            );
            return Err(RecvEnd::Invalid);
        }

        let mut payload = vec![0u8; header.size as usize];
        self.res
            .ringbuf
            .read_bytes(self.i2x.start + h + HEADER_LEN as u32, &mut payload);

        if header.id < ASYNC_MSG_START_ID {
            self.dispatch_response(&header, &payload);
        } else {
            self.queue_async(&header, payload);
        }

        // After this the head can equal the ring size; that is expected.
        self.set_headptr(head, h + HEADER_LEN as u32 + msg_size);
        Ok(())
    }

    /// Completes the pending request a response correlates to.
    fn dispatch_response(&self, header: &MsgHeader, payload: &[u8]) {
        if !wire::valid_magic(header.id) {
            debug!("{}: bad message id {:#x}", self.tag, header.id);
            return;
        }

        let msg = self.pending.lock().remove(header.id);
        let Some(msg) = msg else {
            warn!("{}: no pending request for id {:#x}", self.tag, header.id);
            return;
        };
        // Lock released above; the callback may call back into the channel.
        if let Some(notify) = msg.notify {
            notify(Some(payload));
        }
    }

    /// Queues a device-originated message for `wait_async` consumers.
    fn queue_async(&self, header: &MsgHeader, payload: Vec<u8>) {
        let mut state = self.async_q.lock();
        state.queue.push_back(AsyncMessage {
            opcode: header.opcode,
            payload,
        });
        state.wakeups += 1;
        self.async_cv.notify_one();
    }
}
