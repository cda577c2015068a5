//! The cooperative worker.
//!
//! Every high-level command is a small state machine. One call to
//! [`FlashRing::worker`] advances the active command by at most one SPI
//! packet: the packet is assembled into the shared buffer, its length shows
//! up in [`FlashRing::spi_len`](crate::FlashRing::spi_len), and the caller
//! must let the transport exchange it before polling again. A zero length
//! means the worker has more to do without touching the bus.
//!
//! The driver never blocks. Waiting for a program or erase to complete is
//! expressed as re-emitting a read-status packet once per poll until the
//! write-in-progress bit clears.

#[cfg(feature = "defmt")]
use defmt::{trace, warn};

use crate::error::Error;
use crate::queue::RecordRef;
use crate::record::{RecordHeader, HEADER_SIZE};
use crate::FlashRing;

/// The command class the worker is executing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Command {
    Idle,
    Rebuild,
    Append,
    ReadLast,
    ReadRaw,
}

/// Execution stage of the active command. The meaning of each stage depends
/// on the command; every command starts at `S0` (the write-in-progress
/// check).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Stage {
    S0,
    S1,
    S2,
    S3,
    S4,
}

/// Caller buffer lent to the worker for one poll.
///
/// The driver does not park a reference to caller memory inside the handle;
/// commands that move payload bytes receive the buffer on every
/// [`FlashRing::worker`] call instead. Hand the *same* buffer to every poll
/// of one command — the driver tracks the offset, not the identity.
#[derive(Debug)]
pub enum Payload<'d> {
    /// Control-only poll (rebuild, append-finish).
    None,
    /// Source bytes for an append.
    Source(&'d [u8]),
    /// Destination for a read-back.
    Sink(&'d mut [u8]),
}

impl Payload<'_> {
    /// Reborrows the payload for one poll, so a loop can hand it out
    /// repeatedly without giving it up.
    pub fn reborrow(&mut self) -> Payload<'_> {
        match self {
            Payload::None => Payload::None,
            Payload::Source(data) => Payload::Source(*data),
            Payload::Sink(data) => Payload::Sink(&mut **data),
        }
    }
}

/// Serializes `addr` MSB-first into `dst`, whose length is the device's
/// address width.
fn put_addr(dst: &mut [u8], addr: u32) {
    let be = addr.to_be_bytes();
    let n = dst.len();
    dst.copy_from_slice(&be[4 - n..]);
}

impl<const N: usize> FlashRing<'_, N> {
    /// Drives one step of the active command. No-op while idle.
    ///
    /// After every call the transport must exchange
    /// [`spi_packet`](Self::spi_packet) (skipping the exchange when it is
    /// empty) before calling `worker` again.
    pub fn worker(&mut self, mut payload: Payload<'_>) {
        #[cfg(feature = "defmt")]
        trace!("worker: cmd={} stage={} spi_len={}", self.cmd, self.stage, self.spi_len);
        match self.cmd {
            Command::Idle => {}
            Command::Rebuild => self.step_rebuild(),
            Command::Append => self.step_append(&payload),
            Command::ReadLast => self.step_read_last(&mut payload),
            Command::ReadRaw => self.step_read_raw(&mut payload),
        }
    }

    /// Offset of the data section in read/program packets: one opcode byte
    /// plus the address.
    fn data_ofs(&self) -> usize {
        1 + self.dev.address_bytes as usize
    }

    /// Write-in-progress gate at every stage-0 boundary.
    ///
    /// Emits (or re-emits) a `{read-status, 0}` packet until the response
    /// shows the WIP bit cleared. Returns `true` once the device is ready;
    /// the packet length is zeroed so the next stage starts clean.
    fn wip_ready(&mut self) -> bool {
        if self.spi_len == 0 || self.spi[1] & self.dev.wip_mask != 0 {
            self.emit_status_poll();
            return false;
        }
        self.spi_len = 0;
        true
    }

    fn emit_status_poll(&mut self) {
        self.spi[0] = self.dev.opcodes.rd_status;
        self.spi[1] = 0;
        self.spi_len = 2;
    }

    fn emit_write_enable(&mut self) {
        self.spi[0] = self.dev.opcodes.wr_ena;
        self.spi_len = 1;
    }

    fn emit_sector_erase(&mut self, addr: u32) {
        let ofs = self.data_ofs();
        self.spi[0] = self.dev.opcodes.erase_sector;
        put_addr(&mut self.spi[1..ofs], addr);
        self.spi_len = ofs as u16;
    }

    /// Assembles a read-data packet for `len` bytes at `addr`. The data
    /// section is zeroed; the device overwrites it in the exchange.
    fn emit_read(&mut self, addr: u32, len: u16) {
        let ofs = self.data_ofs();
        let total = ofs + len as usize;
        self.spi[..total].fill(0);
        self.spi[0] = self.dev.opcodes.rd_data;
        put_addr(&mut self.spi[1..ofs], addr);
        self.spi_len = total as u16;
    }

    /// Starts a page-program packet at `addr` and returns the offset where
    /// the data bytes go. The caller appends the data and sets the length.
    fn begin_page_program(&mut self, addr: u32) -> usize {
        let ofs = self.data_ofs();
        self.spi[0] = self.dev.opcodes.wr_page;
        put_addr(&mut self.spi[1..ofs], addr);
        ofs
    }

    /// Returns the handle to idle with the SPI buffer released.
    fn finish(&mut self) {
        self.spi_len = 0;
        self.cmd = Command::Idle;
        self.stage = Stage::S0;
        self.busy = false;
    }

    /// Latches a worker-observed fault and forces idle.
    fn abort(&mut self, error: Error) {
        #[cfg(feature = "defmt")]
        warn!("worker abort: {}", error);
        self.error = Some(error);
        self.finish();
    }

    /// Scan: walk every record slot of each stale queue, rebuilding the
    /// management cache from headers and footers. Reclaims one sector when a
    /// queue turns out to be full, then re-scans that queue.
    fn step_rebuild(&mut self) {
        loop {
            match self.stage {
                // Wait for the device, then fetch the header of the current
                // record slot.
                Stage::S0 => {
                    if !self.wip_ready() {
                        return;
                    }
                    let q = self.queues[self.iter_queue as usize];
                    self.iter_addr = q.header_addr(&self.dev, self.iter_rec);
                    self.emit_read(self.iter_addr, HEADER_SIZE as u16);
                    self.stage = Stage::S1;
                    return;
                }
                // Header response: account for the record, or claim the
                // first blank slot as the write target. Then fetch the
                // footer of the same slot.
                Stage::S1 => {
                    let ofs = self.data_ofs();
                    let head = RecordHeader::from_bytes(&self.spi[ofs..]);
                    self.last_header = head;
                    self.last_header_addr = self.iter_addr;
                    let q = &mut self.queues[self.iter_queue as usize];
                    if head.magic == q.magic {
                        q.entries += 1;
                        if head.id > q.id_max {
                            q.id_max = head.id;
                        }
                        if head.id < q.id_min {
                            q.id_min = head.id;
                            q.idmin_addr = self.iter_addr;
                        }
                    } else if !q.mgmt_valid && RecordHeader::is_blank(&self.spi[ofs..]) {
                        q.next_write_addr = self.iter_addr;
                        q.mgmt_valid = true;
                    }
                    let footer = q.footer_addr(&self.dev, self.iter_rec);
                    self.iter_addr = footer;
                    self.emit_read(footer, HEADER_SIZE as u16);
                    self.stage = Stage::S2;
                    return;
                }
                // Footer response: a record is complete only when the footer
                // repeats the header. Commit the read-last anchor only for
                // the current id-max record, so a stale older footer can
                // never bless an interrupted newest record.
                Stage::S2 => {
                    let ofs = self.data_ofs();
                    let foot = RecordHeader::from_bytes(&self.spi[ofs..]);
                    let q = &mut self.queues[self.iter_queue as usize];
                    if foot == self.last_header && foot.magic == q.magic && foot.id == q.id_max {
                        q.last_complete = Some(RecordRef {
                            addr: self.last_header_addr,
                            id: foot.id,
                        });
                    }
                    let q = self.queues[self.iter_queue as usize];
                    if self.iter_rec < q.max_entries - 1 {
                        self.iter_rec += 1;
                        self.iter_addr = q.header_addr(&self.dev, self.iter_rec);
                        self.emit_read(self.iter_addr, HEADER_SIZE as u16);
                        self.stage = Stage::S1;
                        return;
                    }
                    if q.mgmt_valid {
                        // Queue done; look for the next one needing a scan.
                        // Slots are packed, so the first unused slot ends the
                        // search.
                        let mut next = None;
                        for i in (self.iter_queue as usize + 1)..N {
                            if !self.queues[i].used {
                                break;
                            }
                            if !self.queues[i].mgmt_valid {
                                next = Some(i);
                                break;
                            }
                        }
                        match next {
                            Some(i) => {
                                self.iter_queue = i as u8;
                                self.iter_rec = 0;
                                self.spi_len = 0;
                                self.stage = Stage::S0;
                                // fall through to the WIP gate
                            }
                            None => {
                                self.finish();
                                return;
                            }
                        }
                    } else {
                        // No blank slot in the whole queue: reclaim.
                        self.emit_write_enable();
                        self.stage = Stage::S3;
                        return;
                    }
                }
                // Erase the sector holding the oldest record.
                Stage::S3 => {
                    let q = self.queues[self.iter_queue as usize];
                    let addr = q.idmin_addr & !(self.dev.sector_size - 1);
                    #[cfg(feature = "defmt")]
                    trace!("rebuild: reclaim sector @{=u32:#x}", addr);
                    self.emit_sector_erase(addr);
                    self.stage = Stage::S4;
                    return;
                }
                // Erase issued; drop the stale first-pass tallies and
                // re-scan this queue from slot zero once the device is ready.
                Stage::S4 => {
                    self.queues[self.iter_queue as usize].reset_scan_state();
                    self.iter_rec = 0;
                    self.emit_status_poll();
                    self.stage = Stage::S0;
                    return;
                }
            }
        }
    }

    /// Append: header page-program, payload page-programs, footer
    /// page-program, each preceded by write-enable and followed by a WIP
    /// wait.
    fn step_append(&mut self, payload: &Payload<'_>) {
        loop {
            match self.stage {
                Stage::S0 => {
                    if !self.wip_ready() {
                        return;
                    }
                    self.stage = Stage::S1;
                }
                // Decide what is due next: header, footer, payload bytes, or
                // nothing.
                Stage::S1 => {
                    let q = self.queues[self.iter_queue as usize];
                    let header_due = self.iter_addr == q.next_write_addr;
                    let footer_due =
                        q.pl_flash_ofs as u32 == q.pl_size as u32 + HEADER_SIZE as u32;
                    if header_due || footer_due {
                        self.emit_write_enable();
                        self.stage = Stage::S2;
                    } else if self.iter_byte < self.xfer_len {
                        self.emit_write_enable();
                        self.stage = Stage::S3;
                    } else {
                        self.finish();
                    }
                    return;
                }
                // Program the header or the footer. Both carry the queue
                // magic and the next id; the footer lands in the last
                // HEADER_SIZE bytes of the record.
                Stage::S2 => {
                    let q = self.queues[self.iter_queue as usize];
                    let footer_due =
                        q.pl_flash_ofs as u32 == q.pl_size as u32 + HEADER_SIZE as u32;
                    let mark = RecordHeader {
                        magic: q.magic,
                        id: q.id_max + 1,
                    };
                    let addr = if footer_due {
                        q.next_write_addr + q.elem_bytes(&self.dev) - HEADER_SIZE as u32
                    } else {
                        self.iter_addr
                    };
                    let ofs = self.begin_page_program(addr);
                    self.spi[ofs..ofs + HEADER_SIZE].copy_from_slice(&mark.to_bytes());
                    self.spi_len = (ofs + HEADER_SIZE) as u16;
                    let q = &mut self.queues[self.iter_queue as usize];
                    if footer_due {
                        // One past the sentinel marks the footer as written.
                        q.pl_flash_ofs += 1;
                    } else {
                        q.pl_flash_ofs += HEADER_SIZE as u16;
                    }
                    self.iter_addr += HEADER_SIZE as u32;
                    self.stage = Stage::S4;
                    return;
                }
                // Program the next payload chunk, clipped to the current
                // page boundary.
                Stage::S3 => {
                    let data = match payload {
                        Payload::Source(data) => *data,
                        _ => {
                            self.abort(Error::NotReady);
                            return;
                        }
                    };
                    if data.len() < self.xfer_len as usize {
                        self.abort(Error::Memory);
                        return;
                    }
                    let avail = self.dev.page_size - (self.iter_addr % self.dev.page_size);
                    let cpy = (self.xfer_len - self.iter_byte).min(avail as u16);
                    let ofs = self.begin_page_program(self.iter_addr);
                    self.spi[ofs..ofs + cpy as usize].copy_from_slice(
                        &data[self.iter_byte as usize..(self.iter_byte + cpy) as usize],
                    );
                    self.spi_len = (ofs + cpy as usize) as u16;
                    self.iter_byte += cpy;
                    self.iter_addr += cpy as u32;
                    self.queues[self.iter_queue as usize].pl_flash_ofs += cpy;
                    self.stage = Stage::S4;
                    return;
                }
                // The program packet has been exchanged; clear the length so
                // stage 0 starts a fresh status poll instead of misreading
                // the program response.
                Stage::S4 => {
                    self.spi_len = 0;
                    self.stage = Stage::S0;
                    return;
                }
            }
        }
    }

    /// Read-back of the last complete record, page-sized chunk by chunk.
    fn step_read_last(&mut self, payload: &mut Payload<'_>) {
        loop {
            match self.stage {
                Stage::S0 => {
                    if !self.wip_ready() {
                        return;
                    }
                    self.stage = Stage::S1;
                }
                // Copy the bytes the previous read returned, if any.
                Stage::S1 => {
                    if self.spi_len != 0 {
                        let ofs = self.data_ofs();
                        let n = self.spi_len as usize - ofs;
                        let dst = match payload {
                            Payload::Sink(data) => &mut **data,
                            _ => {
                                self.abort(Error::NotReady);
                                return;
                            }
                        };
                        let at = self.iter_byte as usize;
                        if dst.len() < at + n {
                            self.abort(Error::Memory);
                            return;
                        }
                        dst[at..at + n].copy_from_slice(&self.spi[ofs..ofs + n]);
                        self.iter_byte += n as u16;
                        self.iter_addr += n as u32;
                    }
                    self.stage = Stage::S2;
                }
                // Request the next chunk, or finish.
                Stage::S2 => {
                    if self.iter_byte < self.xfer_len {
                        let n = (self.xfer_len - self.iter_byte).min(self.dev.page_size as u16);
                        self.emit_read(self.iter_addr, n);
                        self.stage = Stage::S1;
                    } else {
                        self.finish();
                    }
                    return;
                }
                _ => {
                    self.abort(Error::UnexpectedState);
                    return;
                }
            }
        }
    }

    /// Single-shot raw read at an arbitrary flash address.
    fn step_read_raw(&mut self, payload: &mut Payload<'_>) {
        loop {
            match self.stage {
                Stage::S0 => {
                    if !self.wip_ready() {
                        return;
                    }
                    self.stage = Stage::S1;
                }
                // The whole transfer happens in one packet, so the shared
                // buffer must fit it; otherwise latch and idle without
                // touching the bus.
                Stage::S1 => {
                    if self.spi.len() < self.data_ofs() + self.xfer_len as usize {
                        self.abort(Error::BufferSize);
                        return;
                    }
                    self.emit_read(self.iter_addr, self.xfer_len);
                    self.stage = Stage::S2;
                    return;
                }
                Stage::S2 => {
                    let ofs = self.data_ofs();
                    let n = self.xfer_len as usize;
                    let dst = match payload {
                        Payload::Sink(data) => &mut **data,
                        _ => {
                            self.abort(Error::NotReady);
                            return;
                        }
                    };
                    if dst.len() < n {
                        self.abort(Error::Memory);
                        return;
                    }
                    dst[..n].copy_from_slice(&self.spi[ofs..ofs + n]);
                    self.finish();
                    return;
                }
                _ => {
                    self.abort(Error::UnexpectedState);
                    return;
                }
            }
        }
    }
}
