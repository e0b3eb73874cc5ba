// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mailbox container: shared MMIO windows and the set of live channels.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::channel::MailboxChannel;
use crate::{IrqController, MmioRegion, Result};

/// How much of each ring [`Mailbox::dump_ring`] copies out.
const RING_DUMP_LEN: usize = 0x1000;

/// Location of one ring buffer and its pointer registers.
///
/// `start` and `size` address the ring-buffer window; `head_reg` and
/// `tail_reg` are register offsets in the mailbox window. Sizes must be
/// powers of two and all offsets 4-byte aligned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingDesc {
    /// Ring start offset within the ring-buffer window.
    pub start: u32,
    /// Ring size in bytes.
    pub size: u32,
    /// Head pointer register offset within the mailbox window.
    pub head_reg: u32,
    /// Tail pointer register offset within the mailbox window.
    pub tail_reg: u32,
}

/// Everything a mailbox needs from the platform: the two MMIO windows
/// discovered at probe time, the interrupt controller, and a label naming
/// the device in log output.
#[derive(Clone)]
pub struct MailboxResources {
    /// Mailbox register window (pointer registers, interrupt acknowledge).
    pub mbox: Arc<dyn MmioRegion>,
    /// Ring-buffer window.
    pub ringbuf: Arc<dyn MmioRegion>,
    /// Platform interrupt controller.
    pub irq: Arc<dyn IrqController>,
    /// Device name used as the log prefix.
    pub label: String,
}

/// Ring descriptors remembered for every channel ever created, so the
/// introspection surfaces can show rings whose channel is gone.
struct ResRecord {
    irq: u32,
    x2i: RingDesc,
    i2x: RingDesc,
}

struct MailboxState {
    channels: Vec<Arc<MailboxChannel>>,
    records: Vec<ResRecord>,
}

/// Introspection snapshot of one recorded channel.
#[derive(Clone, Debug)]
pub struct ChannelRecord {
    /// Interrupt vector of the recorded channel.
    pub irq: u32,
    /// Whether a live channel currently uses this vector.
    pub alive: bool,
    /// Host-to-device ring.
    pub x2i: RingSnapshot,
    /// Device-to-host ring.
    pub i2x: RingSnapshot,
}

/// One ring with the live values of its pointer registers.
#[derive(Clone, Debug)]
pub struct RingSnapshot {
    /// Ring location.
    pub desc: RingDesc,
    /// Current head register value.
    pub head: u32,
    /// Current tail register value.
    pub tail: u32,
}

/// Container for the mailbox channels of one device.
pub struct Mailbox {
    res: MailboxResources,
    state: Mutex<MailboxState>,
}

impl Mailbox {
    /// Creates a mailbox over the probed MMIO windows.
    pub fn new(res: MailboxResources) -> Arc<Self> {
        Arc::new(Self {
            res,
            state: Mutex::new(MailboxState {
                channels: Vec::new(),
                records: Vec::new(),
            }),
        })
    }

    /// Creates a channel over the given ring pair and interrupt vector.
    ///
    /// `iohub_int_off` is the interrupt-acknowledge register the channel
    /// clears from its handler. The interrupt is enabled last, once the
    /// channel is fully operational.
    pub fn create_channel(
        &self,
        x2i: RingDesc,
        i2x: RingDesc,
        iohub_int_off: u32,
        irq: u32,
    ) -> Result<Arc<MailboxChannel>> {
        {
            let mut state = self.state.lock();
            if !state.records.iter().any(|record| record.irq == irq) {
                state.records.push(ResRecord { irq, x2i, i2x });
            }
        }

        let chann = MailboxChannel::new(self.res.clone(), x2i, i2x, iohub_int_off, irq)?;
        self.state.lock().channels.push(Arc::clone(&chann));
        Ok(chann)
    }

    /// Destroys `chann`: unlinks it, quiesces its worker, and cancels every
    /// outstanding request (each callback fires once with no data before
    /// this returns). Safe to call twice; the second call is a no-op.
    pub fn destroy_channel(&self, chann: &Arc<MailboxChannel>) {
        self.state
            .lock()
            .channels
            .retain(|entry| !Arc::ptr_eq(entry, chann));
        chann.shutdown();
        debug!("{}: channel {} destroyed", self.res.label, chann.irq_vector());
    }

    /// Snapshot of every recorded channel with live register values.
    pub fn snapshot(&self) -> Vec<ChannelRecord> {
        let state = self.state.lock();
        state
            .records
            .iter()
            .map(|record| ChannelRecord {
                irq: record.irq,
                alive: state
                    .channels
                    .iter()
                    .any(|chann| chann.irq_vector() == record.irq),
                x2i: self.ring_snapshot(&record.x2i),
                i2x: self.ring_snapshot(&record.i2x),
            })
            .collect()
    }

    /// Copies out the leading bytes of a ring for hex-dump style display.
    pub fn dump_ring(&self, desc: &RingDesc) -> Vec<u8> {
        let len = RING_DUMP_LEN.min(desc.size as usize);
        let mut buf = vec![0u8; len];
        self.res.ringbuf.read_bytes(desc.start, &mut buf);
        buf
    }

    fn ring_snapshot(&self, desc: &RingDesc) -> RingSnapshot {
        RingSnapshot {
            desc: *desc,
            head: self.res.mbox.read32(desc.head_reg),
            tail: self.res.mbox.read32(desc.tail_reg),
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.channels.is_empty() {
            warn!(
                "{}: dropped with {} channel(s) not destroyed",
                self.res.label,
                state.channels.len()
            );
        }
    }
}
