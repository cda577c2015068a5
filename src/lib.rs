#![doc = include_str!("../README.md")]
#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]

#[cfg(feature = "defmt")]
use defmt::trace;

pub mod device;
pub mod error;
mod queue;
mod record;
mod worker;

pub use device::{FlashDevice, OpcodeSet};
pub use error::Error;
pub use queue::RecordRef;
pub use worker::Payload;

use queue::Queue;
use record::{RecordHeader, HEADER_SIZE};
use worker::{Command, Stage};

/// Driver handle: `N` queue-management slots plus the shared SPI buffer.
///
/// The buffer is lent to the driver for the handle's whole lifetime and is
/// where every SPI packet is assembled and every response lands; it must
/// hold at least one full page program (`page_size + address_bytes + 1`
/// bytes). All driver state lives here — nothing is global, so independent
/// handles can serve different flash parts.
///
/// One command is outstanding at a time. Submission functions refuse work
/// with [`Error::WorkerBusy`] until [`worker`](Self::worker) has been polled
/// to completion ([`busy`](Self::busy) returns `false`).
pub struct FlashRing<'spi, const N: usize> {
    pub(crate) dev: FlashDevice,
    pub(crate) queues: [Queue; N],
    pub(crate) spi: &'spi mut [u8],
    pub(crate) spi_len: u16,
    pub(crate) busy: bool,
    pub(crate) cmd: Command,
    pub(crate) stage: Stage,
    /// Queue the active command works on.
    pub(crate) iter_queue: u8,
    /// Record-slot iterator of the scan.
    pub(crate) iter_rec: u16,
    /// Payload-byte iterator of append and read-back transfers.
    pub(crate) iter_byte: u16,
    /// Flash address iterator.
    pub(crate) iter_addr: u32,
    /// Length of the armed transfer in bytes.
    pub(crate) xfer_len: u16,
    /// Aligned copy of the last header the scan read, and where it sat.
    pub(crate) last_header: RecordHeader,
    pub(crate) last_header_addr: u32,
    pub(crate) error: Option<Error>,
}

/// Snapshot of one queue's geometry and scan results.
///
/// Counters and addresses reflect the last completed
/// [`rebuild`](FlashRing::rebuild) and go stale the moment something is
/// appended (`mgmt_valid` turns `false`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueInfo {
    /// Marker stamped into every record of this queue.
    pub magic: u32,
    /// First sector.
    pub start_sector: u32,
    /// Last sector, inclusive.
    pub stop_sector: u32,
    /// Whole pages per record.
    pub pages_per_elem: u16,
    /// Record slots in the sector range.
    pub max_entries: u16,
    /// Records found by the last scan.
    pub entries: u16,
    /// Lowest record id on flash (`u32::MAX` while none seen).
    pub id_min: u32,
    /// Highest record id on flash (`0` while none seen).
    pub id_max: u32,
    /// Header address of the oldest record, the reclamation target.
    pub id_min_addr: u32,
    /// Header address of the next empty record slot.
    pub next_write_addr: u32,
    /// Configured payload bytes per record.
    pub payload_size: u16,
    /// Whether the snapshot still reflects flash.
    pub mgmt_valid: bool,
    /// The last complete record, target of [`FlashRing::read_last`].
    pub last_complete: Option<RecordRef>,
}

impl<'spi, const N: usize> FlashRing<'spi, N> {
    /// Creates a handle for `dev`, taking ownership of the shared SPI
    /// buffer for the handle's lifetime.
    ///
    /// Fails with [`Error::NoFlash`] when the device parameters are
    /// unusable and with [`Error::Memory`] when `spi` cannot hold a full
    /// page program or `N` is zero.
    pub fn new(dev: FlashDevice, spi: &'spi mut [u8]) -> Result<Self, Error> {
        if !dev.is_configured() {
            return Err(Error::NoFlash);
        }
        if N == 0 || spi.len() < (dev.page_size + dev.address_bytes as u32 + 1) as usize {
            return Err(Error::Memory);
        }
        Ok(FlashRing {
            dev,
            queues: [Queue::EMPTY; N],
            spi,
            spi_len: 0,
            busy: false,
            cmd: Command::Idle,
            stage: Stage::S0,
            iter_queue: 0,
            iter_rec: 0,
            iter_byte: 0,
            iter_addr: 0,
            xfer_len: 0,
            last_header: RecordHeader::default(),
            last_header_addr: 0,
            error: None,
        })
    }

    /// Re-initializes the handle in place: drops all queue slots, aborts
    /// any in-flight command and clears the error latch.
    ///
    /// This is the recovery path when the caller gives up on a command
    /// (stuck transport, timeout). Flash contents are untouched; a
    /// half-written record shows up as incomplete on the next scan.
    pub fn reset(&mut self) {
        self.queues = [Queue::EMPTY; N];
        self.spi_len = 0;
        self.busy = false;
        self.cmd = Command::Idle;
        self.stage = Stage::S0;
        self.error = None;
    }

    /// Allocates the next free queue slot directly behind the previous
    /// queue and derives its geometry from the payload size and the minimum
    /// element count. Returns the queue id.
    ///
    /// The sector count is rounded up so at least `min_elems` records fit,
    /// and never below two sectors — with a single sector, reclamation
    /// would wipe the entire queue.
    pub fn create_queue(&mut self, magic: u32, pl_size: u16, min_elems: u16) -> Result<u8, Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        let mut start_sector = 0;
        let mut slot = None;
        for (i, q) in self.queues.iter().enumerate() {
            if q.used {
                start_sector = q.stop_sector + 1;
            } else {
                slot = Some(i);
                break;
            }
        }
        let slot = slot.ok_or(Error::Memory)?;
        self.queues[slot] = Queue::layout(&self.dev, magic, pl_size, min_elems, start_sector)?;
        #[cfg(feature = "defmt")]
        trace!(
            "create_queue: id={} sectors={}..={} pages_per_elem={}",
            slot as u8,
            self.queues[slot].start_sector,
            self.queues[slot].stop_sector,
            self.queues[slot].pages_per_elem
        );
        Ok(slot as u8)
    }

    /// Arms a scan that rebuilds the management cache of every stale queue
    /// from flash. This is the only way queues become ready for appends and
    /// read-back, both after a reset and after any append.
    ///
    /// Queues whose cache is already valid are left untouched; if none need
    /// scanning this returns `Ok` without arming the worker.
    pub fn rebuild(&mut self) -> Result<(), Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        if !self.queues[0].used {
            return Err(Error::NoQueue);
        }
        let Some(first) = self.queues.iter().position(|q| q.used && !q.mgmt_valid) else {
            return Ok(());
        };
        for q in self.queues.iter_mut().filter(|q| q.used && !q.mgmt_valid) {
            q.reset_scan_state();
        }
        self.iter_queue = first as u8;
        self.iter_rec = 0;
        self.arm(Command::Rebuild);
        Ok(())
    }

    /// Starts a new record in `queue` and submits `len` payload bytes for
    /// it in one go.
    ///
    /// Supply exactly the queue's payload size to get a complete record
    /// (the footer is written in the same run), or less and top it off with
    /// [`append_chunk`](Self::append_chunk) / seal it with
    /// [`append_finish`](Self::append_finish). Poll
    /// [`worker`](Self::worker) with [`Payload::Source`] until idle.
    ///
    /// Appending marks the queue stale: the next append or read-back first
    /// needs a [`rebuild`](Self::rebuild).
    pub fn append(&mut self, queue: u8, len: u16) -> Result<(), Error> {
        self.check_append(queue, len)?;
        if self.queues[queue as usize].pl_flash_ofs != 0 {
            // A record is already open; only chunked appends may continue it.
            return Err(Error::NotReady);
        }
        if len > self.queues[queue as usize].pl_size {
            return Err(Error::Memory);
        }
        self.submit_append(queue, len);
        Ok(())
    }

    /// Contributes `len` more payload bytes to the record currently open in
    /// `queue`, resuming where the previous chunk stopped. The first chunk
    /// opens the record and writes its header.
    ///
    /// Once the accumulated chunks reach the queue's payload size the
    /// footer is written automatically; a short record is sealed with
    /// [`append_finish`](Self::append_finish).
    pub fn append_chunk(&mut self, queue: u8, len: u16) -> Result<(), Error> {
        self.check_append(queue, len)?;
        self.submit_append(queue, len);
        Ok(())
    }

    /// Seals the record currently open in `queue` by forcing the footer
    /// write; unwritten payload bytes stay 0xFF. No-op when the footer has
    /// already landed. Poll [`worker`](Self::worker) with [`Payload::None`].
    pub fn append_finish(&mut self, queue: u8) -> Result<(), Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        let q = self.queues.get(queue as usize).ok_or(Error::NoQueue)?;
        if !q.used {
            return Err(Error::NoQueue);
        }
        let sentinel = q.pl_size as u32 + HEADER_SIZE as u32;
        if q.pl_flash_ofs == 0 {
            // Nothing written yet; a footer without a header is garbage.
            return Err(Error::NotReady);
        }
        if q.pl_flash_ofs as u32 > sentinel {
            return Ok(());
        }
        let q = &mut self.queues[queue as usize];
        q.pl_flash_ofs = sentinel as u16;
        let next_write_addr = q.next_write_addr;
        self.iter_queue = queue;
        // Anything but the record start, so the header stage is skipped.
        self.iter_addr = next_write_addr + sentinel;
        self.xfer_len = 0;
        self.iter_byte = 0;
        self.arm(Command::Append);
        Ok(())
    }

    /// Arms a read-back of the last complete record of `queue` and returns
    /// its id. `len` is clipped to the record size minus both frame
    /// markers. Poll [`worker`](Self::worker) with [`Payload::Sink`].
    pub fn read_last(&mut self, queue: u8, len: u16) -> Result<u32, Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        let q = self.queues.get(queue as usize).ok_or(Error::NoQueue)?;
        if !q.used {
            return Err(Error::NoQueue);
        }
        if !q.mgmt_valid {
            return Err(Error::NotReady);
        }
        let anchor = q.last_complete.ok_or(Error::QueueEmpty)?;
        let cap = q.elem_bytes(&self.dev) - 2 * HEADER_SIZE as u32;
        self.xfer_len = (len as u32).min(cap) as u16;
        self.iter_queue = queue;
        // The header is not part of the payload.
        self.iter_addr = anchor.addr + HEADER_SIZE as u32;
        self.iter_byte = 0;
        self.arm(Command::ReadLast);
        Ok(anchor.id)
    }

    /// Arms a raw read of `len` bytes at an arbitrary flash address. The
    /// transfer happens in a single packet, so the shared buffer must hold
    /// `len + address_bytes + 1` bytes; otherwise the worker latches
    /// [`Error::BufferSize`]. Poll with [`Payload::Sink`].
    pub fn read_raw(&mut self, addr: u32, len: u16) -> Result<(), Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        self.iter_addr = addr;
        self.xfer_len = len;
        self.iter_byte = 0;
        self.arm(Command::ReadRaw);
        Ok(())
    }

    /// `true` while a command is in flight.
    pub fn busy(&self) -> bool {
        self.busy
    }

    /// Bytes the transport must exchange before the next
    /// [`worker`](Self::worker) call. Zero means no bus traffic is pending.
    pub fn spi_len(&self) -> u16 {
        self.spi_len
    }

    /// The pending SPI packet, request bytes in place; the transport
    /// overwrites it with the response. Empty when no exchange is due.
    pub fn spi_packet(&mut self) -> &mut [u8] {
        let n = self.spi_len as usize;
        &mut self.spi[..n]
    }

    /// Total device size in bytes.
    pub fn flash_size(&self) -> u32 {
        self.dev.total_size
    }

    /// The device parameter set this handle drives.
    pub fn device(&self) -> &FlashDevice {
        &self.dev
    }

    /// Highest record id the last scan saw in `queue`; zero for an unused
    /// slot or an id out of range.
    pub fn id_max(&self, queue: u8) -> u32 {
        self.queues
            .get(queue as usize)
            .filter(|q| q.used)
            .map_or(0, |q| q.id_max)
    }

    /// Payload bytes already written to the record currently open in
    /// `queue`, clipped to the payload size. Zero when no record is open.
    pub fn payload_written(&self, queue: u8) -> u16 {
        self.queues
            .get(queue as usize)
            .filter(|q| q.used)
            .map_or(0, |q| {
                q.pl_flash_ofs
                    .saturating_sub(HEADER_SIZE as u16)
                    .min(q.pl_size)
            })
    }

    /// The fault latched by the worker during the last command, if any.
    /// Cleared by every submission.
    pub fn last_error(&self) -> Option<Error> {
        self.error
    }

    /// Geometry and scan snapshot of `queue`; `None` for an unused slot or
    /// an id out of range.
    pub fn queue_info(&self, queue: u8) -> Option<QueueInfo> {
        let q = self.queues.get(queue as usize).filter(|q| q.used)?;
        Some(QueueInfo {
            magic: q.magic,
            start_sector: q.start_sector,
            stop_sector: q.stop_sector,
            pages_per_elem: q.pages_per_elem,
            max_entries: q.max_entries,
            entries: q.entries,
            id_min: q.id_min,
            id_max: q.id_max,
            id_min_addr: q.idmin_addr,
            next_write_addr: q.next_write_addr,
            payload_size: q.pl_size,
            mgmt_valid: q.mgmt_valid,
            last_complete: q.last_complete,
        })
    }

    /// Shared preconditions of both append flavors, checked before any
    /// state is touched.
    fn check_append(&self, queue: u8, len: u16) -> Result<(), Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        let q = self.queues.get(queue as usize).ok_or(Error::NoQueue)?;
        if !q.used {
            return Err(Error::NoQueue);
        }
        // Acceptable when the cache is fresh (new record) or a record is
        // already open and its footer has not been written yet.
        let record_open = q.pl_flash_ofs != 0;
        if !q.mgmt_valid && !record_open {
            return Err(Error::NotReady);
        }
        if q.pl_flash_ofs as u32 >= q.pl_size as u32 + HEADER_SIZE as u32 {
            return Err(Error::NotReady);
        }
        if len as u32 + q.pl_flash_ofs as u32 > q.elem_bytes(&self.dev) {
            return Err(Error::Memory);
        }
        Ok(())
    }

    fn submit_append(&mut self, queue: u8, len: u16) {
        let q = &mut self.queues[queue as usize];
        // Dirty marker: the cache no longer reflects flash, and the entry
        // count restarts so a re-scan cannot double-count.
        q.mgmt_valid = false;
        q.entries = 0;
        self.iter_addr = q.next_write_addr + q.pl_flash_ofs as u32;
        self.iter_queue = queue;
        self.xfer_len = len;
        self.iter_byte = 0;
        self.arm(Command::Append);
    }

    fn arm(&mut self, cmd: Command) {
        #[cfg(feature = "defmt")]
        trace!("arm: {} queue={} len={}", cmd, self.iter_queue, self.xfer_len);
        self.cmd = cmd;
        self.stage = Stage::S0;
        self.spi_len = 0;
        self.error = None;
        self.busy = true;
    }
}
