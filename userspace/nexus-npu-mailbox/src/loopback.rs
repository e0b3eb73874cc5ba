// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process device emulation for host-based tests
//! INTENT: Shared-memory MMIO windows and a software interrupt controller
//! DEPS: parking_lot::Mutex (synchronization)
//! READINESS: Host backend ready; used for testing and device models

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{IrqController, IrqError, IrqHandler, MmioRegion};

/// A byte window shared between the transport and a scripted device model.
///
/// Stands in for both the mailbox register region and the ring-buffer region
/// in tests. Accesses panic when out of bounds; the window is fixed at
/// construction like a real BAR mapping.
pub struct SharedRegion {
    bytes: Mutex<Vec<u8>>,
}

impl SharedRegion {
    /// Creates a zeroed window of `len` bytes.
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0u8; len]),
        })
    }

    /// Copies the whole window out, for dump-style assertions.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl MmioRegion for SharedRegion {
    fn read32(&self, offset: u32) -> u32 {
        let bytes = self.bytes.lock();
        let at = offset as usize;
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[at..at + 4]);
        u32::from_le_bytes(word)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut bytes = self.bytes.lock();
        let at = offset as usize;
        bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_bytes(&self, offset: u32, out: &mut [u8]) {
        let bytes = self.bytes.lock();
        let at = offset as usize;
        out.copy_from_slice(&bytes[at..at + out.len()]);
    }

    fn write_bytes(&self, offset: u32, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        let at = offset as usize;
        bytes[at..at + data.len()].copy_from_slice(data);
    }
}

/// Software interrupt controller delivering vectors synchronously.
pub struct SoftIrq {
    lines: Mutex<HashMap<u32, IrqHandler>>,
}

impl SoftIrq {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(HashMap::new()),
        })
    }

    /// Fires `irq` on the calling thread. A vector with no registered
    /// handler is silently dropped, like a masked line.
    pub fn raise(&self, irq: u32) {
        let handler = self.lines.lock().get(&irq).cloned();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Returns true while a handler is installed for `irq`.
    pub fn is_claimed(&self, irq: u32) -> bool {
        self.lines.lock().contains_key(&irq)
    }
}

impl IrqController for SoftIrq {
    fn register(&self, irq: u32, handler: IrqHandler) -> core::result::Result<(), IrqError> {
        let mut lines = self.lines.lock();
        if lines.contains_key(&irq) {
            return Err(IrqError::Claimed(irq));
        }
        lines.insert(irq, handler);
        Ok(())
    }

    fn unregister(&self, irq: u32) {
        self.lines.lock().remove(&irq);
    }
}
