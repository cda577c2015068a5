//! Queue management entries and flash geometry.

use crate::device::FlashDevice;
use crate::error::Error;
use crate::record::HEADER_SIZE;

/// Flash location and id of a verified (header == footer) record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordRef {
    /// Header address of the record.
    pub addr: u32,
    /// Record id.
    pub id: u32,
}

/// One queue management slot.
///
/// Everything here is a RAM cache of what the scan last saw on flash; the
/// on-flash record stream is the authority. `mgmt_valid` says whether the
/// cache still reflects flash — appending clears it, a rebuild sets it.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Queue {
    /// Slot occupied.
    pub used: bool,
    /// Cache below reflects flash; cleared by every append.
    pub mgmt_valid: bool,
    /// Marker distinguishing this queue's records from any other queue's.
    pub magic: u32,
    /// First sector of the queue.
    pub start_sector: u32,
    /// Last sector of the queue, inclusive. Always `>= start_sector + 1`.
    pub stop_sector: u32,
    /// Whole pages per record.
    pub pages_per_elem: u16,
    /// Record slots in the sector range.
    pub max_entries: u16,
    /// Records with a matching header magic found by the last scan.
    pub entries: u16,
    /// Lowest id seen by the last scan. Seeded all-ones so any on-flash id
    /// compares below it.
    pub id_min: u32,
    /// Highest id seen by the last scan. Seeded zero.
    pub id_max: u32,
    /// Header address of the `id_min` record; reclamation erases the sector
    /// containing this address.
    pub idmin_addr: u32,
    /// Last complete record, target of read-last. `None` until a scan
    /// verifies a footer.
    pub last_complete: Option<RecordRef>,
    /// Header address of the next empty record slot.
    pub next_write_addr: u32,
    /// Configured payload bytes per record.
    pub pl_size: u16,
    /// In-record write offset of an in-progress append: 0 before the header,
    /// `pl_size + HEADER_SIZE` when the footer is due, beyond that once the
    /// footer landed.
    pub pl_flash_ofs: u16,
}

impl Queue {
    pub(crate) const EMPTY: Queue = Queue {
        used: false,
        mgmt_valid: false,
        magic: 0,
        start_sector: 0,
        stop_sector: 0,
        pages_per_elem: 0,
        max_entries: 0,
        entries: 0,
        id_min: u32::MAX,
        id_max: 0,
        idmin_addr: 0,
        last_complete: None,
        next_write_addr: 0,
        pl_size: 0,
        pl_flash_ofs: 0,
    };

    /// Lays out a new queue directly behind `start_sector` and derives its
    /// geometry. Checks only; the caller commits the result to a free slot.
    pub(crate) fn layout(
        dev: &FlashDevice,
        magic: u32,
        pl_size: u16,
        min_elems: u16,
        start_sector: u32,
    ) -> Result<Queue, Error> {
        // The in-record write offset is tracked in a u16, so the payload
        // plus both frame markers must stay below that.
        if pl_size == 0 || pl_size > u16::MAX - 2 * HEADER_SIZE as u16 {
            return Err(Error::Memory);
        }
        let elem_bytes = pl_size as u32 + 2 * HEADER_SIZE as u32;
        let pages_per_elem = elem_bytes.div_ceil(dev.page_size);
        let num_sectors =
            (min_elems as u32 * pages_per_elem).div_ceil(dev.pages_per_sector()).max(2);
        let stop_sector = start_sector + num_sectors - 1;
        if (stop_sector + 1) * dev.sector_size > dev.total_size {
            return Err(Error::FlashFull);
        }
        let max_entries = num_sectors * dev.pages_per_sector() / pages_per_elem;
        Ok(Queue {
            used: true,
            magic,
            start_sector,
            stop_sector,
            pages_per_elem: pages_per_elem as u16,
            max_entries: max_entries as u16,
            pl_size,
            ..Queue::EMPTY
        })
    }

    /// Record size in bytes.
    pub(crate) fn elem_bytes(&self, dev: &FlashDevice) -> u32 {
        self.pages_per_elem as u32 * dev.page_size
    }

    /// Flash address of the header of record slot `n`.
    pub(crate) fn header_addr(&self, dev: &FlashDevice, n: u16) -> u32 {
        self.start_sector * dev.sector_size + self.elem_bytes(dev) * n as u32
    }

    /// Flash address of the footer of record slot `n`: the last
    /// `HEADER_SIZE` bytes of the slot.
    pub(crate) fn footer_addr(&self, dev: &FlashDevice, n: u16) -> u32 {
        self.header_addr(dev, n + 1) - HEADER_SIZE as u32
    }

    /// Drops everything the last scan accumulated. Runs when the cache is
    /// invalidated and before a re-scan, so stale tallies never double in.
    pub(crate) fn reset_scan_state(&mut self) {
        self.entries = 0;
        self.id_min = u32::MAX;
        self.id_max = 0;
        self.idmin_addr = 0;
        self.last_complete = None;
        self.pl_flash_ofs = 0;
    }
}
