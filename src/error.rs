//! Driver error kinds.

use thiserror::Error;

/// Errors reported by the driver. Submission functions return these
/// synchronously; faults observed by the worker mid-command latch into the
/// handle instead (see [`FlashRing::last_error`](crate::FlashRing::last_error))
/// and force the command back to idle. Marked non-exhaustive so additional
/// kinds can appear without breaking callers.
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The flash device parameters are unset or inconsistent (zero page,
    /// sector or total size).
    #[error("no flash device configured")]
    NoFlash,

    /// Out of RAM-side resources: the queue table has no free slot, the SPI
    /// buffer cannot hold a full page program, or a transfer does not fit
    /// the reserved record space.
    #[error("out of memory")]
    Memory,

    /// The requested queue would end past the last sector of the device.
    #[error("flash capacity exceeded")]
    FlashFull,

    /// A command is already in flight. Poll [`worker`](crate::FlashRing::worker)
    /// until [`busy`](crate::FlashRing::busy) clears, then resubmit.
    #[error("worker busy")]
    WorkerBusy,

    /// Queue id out of range, or the slot was never created.
    #[error("no such queue")]
    NoQueue,

    /// The queue is not in a state that accepts this request. Usually the
    /// management cache is stale and a rebuild has to run first.
    #[error("queue not ready, rebuild required")]
    NotReady,

    /// The queue holds no complete record to read back.
    #[error("queue empty")]
    QueueEmpty,

    /// The shared SPI buffer is too small for the requested raw read.
    #[error("spi buffer too small")]
    BufferSize,

    /// The worker hit an impossible command/stage combination. Latched only;
    /// indicates memory corruption or a driver bug.
    #[error("unexpected worker state")]
    UnexpectedState,
}
