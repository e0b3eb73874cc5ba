// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mailbox transport between the host driver and the NPU co-processor
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit-tested + integration tests (loopback device model)
//!
//! PUBLIC API:
//!   - Mailbox / MailboxChannel: channel container and per-channel transport
//!   - MailboxMessage / AsyncMessage: caller-visible message types
//!   - MmioRegion / IrqController: hardware seams (loopback impls for tests)
//!   - MailboxError: error taxonomy
//!
//! The device exposes one host-to-device (X2I) and one device-to-host (I2X)
//! ring buffer per channel, with head/tail pointers surfaced as registers in
//! the mailbox MMIO window. The transport frames variable-sized messages into
//! those rings, correlates responses to requests by message id, and queues
//! device-originated async messages for polling consumers.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub mod loopback;
mod mailbox;
mod mmio;
mod pending;
pub mod wire;

mod channel;

pub use channel::MailboxChannel;
pub use mailbox::{ChannelRecord, Mailbox, MailboxResources, RingDesc, RingSnapshot};
pub use mmio::PhysRegion;

/// Result alias used throughout the transport.
pub type Result<T> = core::result::Result<T, MailboxError>;

/// Errors surfaced by the mailbox transport.
#[derive(Debug, Error)]
pub enum MailboxError {
    /// Framed message does not fit the transmit ring.
    #[error("message of {got} bytes exceeds ring capacity {cap}")]
    Oversize {
        /// Framed size (header plus payload) of the rejected message.
        got: usize,
        /// Capacity of the transmit ring.
        cap: u32,
    },
    /// Payload length is not a multiple of four bytes.
    #[error("payload length {0} is not 4-byte aligned")]
    Unaligned(usize),
    /// The first payload word collides with the ring wrap marker.
    #[error("payload begins with the tombstone marker")]
    TombstonePayload,
    /// All message ids are in flight; retry after completions drain.
    #[error("message id space exhausted")]
    IdsExhausted,
    /// The transmit ring has no room for the framed message.
    #[error("no space left in transmit ring")]
    NoSpace,
    /// No async message is queued.
    #[error("async queue is empty")]
    Empty,
    /// A blocking wait was woken without a message.
    #[error("wait interrupted")]
    Interrupted,
    /// Ring sizes must be powers of two.
    #[error("ring size {0:#x} is not a power of two")]
    BadRingSize(u32),
    /// Interrupt registration failed during channel creation.
    #[error("irq registration failed: {0}")]
    Irq(#[from] IrqError),
    /// The receive worker thread could not be spawned.
    #[error("receive worker spawn failed: {0}")]
    Worker(#[source] std::io::Error),
    /// The channel has been destroyed.
    #[error("channel is closed")]
    Closed,
}

/// Errors produced by an [`IrqController`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum IrqError {
    /// Another handler already owns the vector.
    #[error("irq {0} already claimed")]
    Claimed(u32),
    /// The controller does not route this vector.
    #[error("irq {0} not routed by this controller")]
    NotRouted(u32),
}

/// Raw access to one device MMIO window.
///
/// The transport uses two windows: the mailbox register region (head/tail
/// pointer registers, interrupt acknowledge) and the ring-buffer region
/// (message bytes). Implementations must preserve device-memory semantics:
/// every access hits the window exactly once, in program order.
///
/// [`PhysRegion`] implements this over a mapped BAR; [`loopback::SharedRegion`]
/// is the in-memory stand-in used by tests and device models.
pub trait MmioRegion: Send + Sync {
    /// Reads a 32-bit word at `offset`.
    fn read32(&self, offset: u32) -> u32;

    /// Writes a 32-bit word at `offset`.
    fn write32(&self, offset: u32, value: u32);

    /// Copies `out.len()` bytes starting at `offset` into `out`.
    fn read_bytes(&self, offset: u32, out: &mut [u8]);

    /// Copies `data` into the window starting at `offset`.
    fn write_bytes(&self, offset: u32, data: &[u8]);
}

/// Interrupt handler installed by a channel.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Registration interface of the platform interrupt controller.
///
/// A channel registers its handler as the last step of creation and
/// deregisters it as the first step of destruction; after `unregister`
/// returns, the handler must not be invoked again.
pub trait IrqController: Send + Sync {
    /// Claims `irq` and installs `handler` for it.
    fn register(&self, irq: u32, handler: IrqHandler) -> core::result::Result<(), IrqError>;

    /// Releases `irq`; no further handler invocations after return.
    fn unregister(&self, irq: u32);
}

/// Completion callback for a request message.
///
/// Invoked at most once per send: with `Some(payload)` when the response
/// arrives, or with `None` when the channel is destroyed before a response.
/// A send that fails synchronously drops the callback without invoking it.
pub type NotifyFn = Box<dyn FnOnce(Option<&[u8]>) + Send>;

/// A request message handed to [`MailboxChannel::send`].
pub struct MailboxMessage<'a> {
    /// Command opcode, forwarded opaquely to the device.
    pub opcode: u32,
    /// Payload bytes; length must be a multiple of four.
    pub payload: &'a [u8],
    /// Completion callback; `None` for fire-and-forget requests.
    pub notify: Option<NotifyFn>,
    /// Response deadline for higher layers. The transport records it on
    /// behalf of the command dispatcher and never arms a timer itself.
    pub tx_timeout: Option<Duration>,
}

/// A device-originated message not correlated to any request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsyncMessage {
    /// Opcode chosen by the device.
    pub opcode: u32,
    /// Copied payload bytes.
    pub payload: Vec<u8>,
}
