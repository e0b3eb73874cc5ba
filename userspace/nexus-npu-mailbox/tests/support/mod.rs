// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixture for the transport integration tests: loopback MMIO
//! windows plus a scripted device model that consumes the X2I ring and
//! produces into the I2X ring the way the firmware does.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nexus_npu_mailbox::loopback::{SharedRegion, SoftIrq};
use nexus_npu_mailbox::wire::{MsgHeader, HEADER_LEN, TOMBSTONE};
use nexus_npu_mailbox::{IrqController, Mailbox, MailboxResources, MmioRegion, RingDesc};

pub const IRQ: u32 = 5;
pub const IOHUB_INT: u32 = 0x20;

pub struct TestEnv {
    pub mbox: Arc<SharedRegion>,
    pub ringbuf: Arc<SharedRegion>,
    pub mailbox: Arc<Mailbox>,
}

/// Builds a mailbox over loopback windows plus the matching device model.
/// X2I occupies the front of the ring window, I2X the back.
pub fn setup(x2i_size: u32, i2x_size: u32) -> (TestEnv, DeviceModel) {
    let x2i = RingDesc {
        start: 0,
        size: x2i_size,
        head_reg: 0x0,
        tail_reg: 0x4,
    };
    let i2x = RingDesc {
        start: x2i_size,
        size: i2x_size,
        head_reg: 0x8,
        tail_reg: 0xC,
    };

    let mbox = SharedRegion::new(0x40);
    let ringbuf = SharedRegion::new((x2i_size + i2x_size) as usize);
    let irq_ctl = SoftIrq::new();

    let mailbox = Mailbox::new(MailboxResources {
        mbox: Arc::clone(&mbox) as Arc<dyn MmioRegion>,
        ringbuf: Arc::clone(&ringbuf) as Arc<dyn MmioRegion>,
        irq: Arc::clone(&irq_ctl) as Arc<dyn IrqController>,
        label: "npu-mbox".to_string(),
    });

    let env = TestEnv {
        mbox: Arc::clone(&mbox),
        ringbuf: Arc::clone(&ringbuf),
        mailbox,
    };
    let device = DeviceModel {
        mbox,
        ringbuf,
        irq_ctl,
        x2i,
        i2x,
        irq: IRQ,
    };
    (env, device)
}

/// Polls `cond` until it holds or a two-second deadline passes.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// A request the device model pulled out of the X2I ring.
pub struct DeviceRequest {
    pub header: MsgHeader,
    pub payload: Vec<u8>,
}

/// Scripted stand-in for the co-processor firmware.
pub struct DeviceModel {
    pub mbox: Arc<SharedRegion>,
    pub ringbuf: Arc<SharedRegion>,
    pub irq_ctl: Arc<SoftIrq>,
    pub x2i: RingDesc,
    pub i2x: RingDesc,
    pub irq: u32,
}

impl DeviceModel {
    /// Consumes one message from the X2I ring, following tombstones, and
    /// publishes the new head register. Returns `None` on an empty ring.
    pub fn pop_request(&self) -> Option<DeviceRequest> {
        loop {
            let head = self.mbox.read32(self.x2i.head_reg);
            let tail = self.mbox.read32(self.x2i.tail_reg);
            let mask = self.x2i.size - 1;
            if head & mask == tail & mask {
                return None;
            }
            let mut at = head;
            if at == self.x2i.size {
                at = 0;
            }
            if self.ringbuf.read32(self.x2i.start + at) == TOMBSTONE {
                self.mbox.write32(self.x2i.head_reg, 0);
                continue;
            }
            let mut raw = [0u8; HEADER_LEN];
            self.ringbuf.read_bytes(self.x2i.start + at, &mut raw);
            let header = MsgHeader::from_bytes(&raw);
            let mut payload = vec![0u8; header.total_size as usize];
            self.ringbuf
                .read_bytes(self.x2i.start + at + HEADER_LEN as u32, &mut payload);
            self.mbox
                .write32(self.x2i.head_reg, at + HEADER_LEN as u32 + header.total_size);
            return Some(DeviceRequest { header, payload });
        }
    }

    /// Frames a message into the I2X ring with producer discipline and
    /// raises the channel interrupt.
    pub fn push_message(&self, id: u32, opcode: u32, payload: &[u8]) {
        let head = self.mbox.read32(self.i2x.head_reg);
        let mut tail = self.mbox.read32(self.i2x.tail_reg);
        let size = self.i2x.size;

        let header = MsgHeader::request(opcode, id, payload.len() as u32);
        let mut pkg = header.to_bytes().to_vec();
        pkg.extend_from_slice(payload);
        let pkg_size = pkg.len() as u32;

        let tmp_tail = tail + pkg_size;
        assert!(
            !(tail < head && tmp_tail >= head),
            "device model: I2X ring full"
        );
        if tail >= head && tmp_tail > size - 4 {
            assert!(pkg_size < head, "device model: I2X ring full at wrap");
            self.ringbuf.write32(self.i2x.start + tail, TOMBSTONE);
            tail = 0;
        }
        self.ringbuf.write_bytes(self.i2x.start + tail, &pkg);
        self.mbox.write32(self.i2x.tail_reg, tail + pkg_size);
        self.irq_ctl.raise(self.irq);
    }

    /// Responds to `req` with the same id and opcode.
    pub fn reply(&self, req: &DeviceRequest, payload: &[u8]) {
        self.push_message(req.header.id, req.header.opcode, payload);
    }

    /// Live I2X head register value, as published by the host.
    pub fn i2x_head(&self) -> u32 {
        self.mbox.read32(self.i2x.head_reg)
    }
}

/// Little-endian byte image of a word slice, the shape ring payloads take.
pub fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
