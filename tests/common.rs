#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use spi_flash_ring::{FlashDevice, FlashRing, Payload};

pub const SECTOR_SIZE: usize = 4096;
pub const PAGE_SIZE: usize = 256;
/// A few bytes beyond the minimum the driver accepts for the W25Q16JV
/// (one page program plus opcode and address bytes).
pub const SPI_BUF_SIZE: usize = 266;

/// Abort limit for the poll loop; generous enough for a full scan of a
/// multi-queue layout including a reclamation re-scan.
const CYCLE_LIMIT: usize = 1_000_000;

/// Status reads reporting write-in-progress after a page program / a
/// sector erase, so the driver's WIP polling actually gets exercised.
const WIP_READS_PROGRAM: u8 = 2;
const WIP_READS_ERASE: u8 = 4;

/// Simulated SPI NOR flash, one transaction per driver packet.
///
/// The request bytes are consumed and the response is written into the same
/// buffer, exactly like a full-duplex SPI transfer against the shared
/// driver buffer. NOR behavior is modeled faithfully: programs only clear
/// bits, erases set a whole sector to ones, every program/erase needs a
/// preceding write-enable and asserts WIP for a few status reads.
pub struct Flash {
    pub dev: FlashDevice,
    pub mem: Vec<u8>,
    pub wel: bool,
    pub wip_reads: u8,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(dev: FlashDevice) -> Self {
        Self {
            dev,
            mem: vec![0xFFu8; dev.total_size as usize],
            wel: false,
            wip_reads: 0,
            operations: Vec::new(),
        }
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    fn addr(&self, packet: &[u8]) -> u32 {
        let n = self.dev.address_bytes as usize;
        let mut addr = 0u32;
        for &b in &packet[1..1 + n] {
            addr = addr << 8 | b as u32;
        }
        addr
    }

    fn status(&mut self) -> u8 {
        let mut status = 0;
        if self.wip_reads > 0 {
            self.wip_reads -= 1;
            status |= self.dev.wip_mask;
        }
        if self.wel {
            status |= self.dev.wren_mask;
        }
        status
    }

    /// Exchanges one packet: interprets the request and overwrites the data
    /// section with the response.
    pub fn exchange(&mut self, packet: &mut [u8]) {
        if packet.is_empty() {
            return;
        }
        let op = packet[0];
        let data_ofs = 1 + self.dev.address_bytes as usize;
        let ops = self.dev.opcodes;
        if op == ops.rd_status {
            assert_eq!(packet.len(), 2, "status read must be {{opcode, 0}}");
            packet[1] = self.status();
        } else if op == ops.wr_ena {
            assert_eq!(packet.len(), 1);
            assert_eq!(self.wip_reads, 0, "write enable while busy");
            self.wel = true;
        } else if op == ops.rd_data {
            assert_eq!(self.wip_reads, 0, "data read while write in progress");
            let addr = self.addr(packet) as usize;
            let len = packet.len() - data_ofs;
            assert!(addr + len <= self.mem.len(), "read past end of device");
            packet[data_ofs..].copy_from_slice(&self.mem[addr..addr + len]);
            self.operations.push(Operation::Read {
                offset: addr as u32,
                len,
            });
        } else if op == ops.wr_page {
            assert!(self.wel, "page program without write enable");
            assert_eq!(self.wip_reads, 0, "page program while busy");
            let addr = self.addr(packet) as usize;
            let data = &packet[data_ofs..];
            assert!(!data.is_empty(), "empty page program");
            assert!(
                addr % PAGE_SIZE + data.len() <= PAGE_SIZE,
                "page program wraps at {addr:#x}+{}",
                data.len()
            );
            for (i, &val) in data.iter().enumerate() {
                // NOR programs can only flip bits from 1 to 0
                self.mem[addr + i] &= val;
            }
            self.operations.push(Operation::Write {
                offset: addr as u32,
                len: data.len(),
            });
            self.wel = false;
            self.wip_reads = WIP_READS_PROGRAM;
        } else if op == ops.erase_sector {
            assert!(self.wel, "sector erase without write enable");
            assert_eq!(self.wip_reads, 0, "sector erase while busy");
            assert_eq!(packet.len(), data_ofs);
            let addr = self.addr(packet) as usize;
            assert_eq!(addr % SECTOR_SIZE, 0, "unaligned sector erase");
            self.mem[addr..addr + SECTOR_SIZE].fill(0xFF);
            self.operations.push(Operation::Erase {
                offset: addr as u32,
                len: SECTOR_SIZE,
            });
            self.wel = false;
            self.wip_reads = WIP_READS_ERASE;
        } else {
            panic!("unhandled opcode {op:#04x}");
        }
    }
}

#[derive(Debug)]
pub struct FlashSimError;

impl NorFlashError for FlashSimError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashSimError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        bytes.copy_from_slice(&self.mem[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = 1;

    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from % SECTOR_SIZE as u32 == 0);
        assert!(to % SECTOR_SIZE as u32 == 0);
        self.mem[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            self.mem[offset + i] &= val;
        }
        Ok(())
    }
}

/// Polls the worker against the simulated flash until the driver goes idle.
pub fn run<const N: usize>(
    ring: &mut FlashRing<'_, N>,
    flash: &mut Flash,
    mut payload: Payload<'_>,
) {
    for _ in 0..CYCLE_LIMIT {
        if !ring.busy() {
            return;
        }
        ring.worker(payload.reborrow());
        flash.exchange(ring.spi_packet());
    }
    panic!("worker did not reach idle within {CYCLE_LIMIT} cycles");
}

/// Rebuild helper: submits a scan and polls it to completion.
pub fn rebuild<const N: usize>(ring: &mut FlashRing<'_, N>, flash: &mut Flash) {
    ring.rebuild().expect("rebuild refused");
    run(ring, flash, Payload::None);
    assert_eq!(ring.last_error(), None);
}

/// One-shot append helper: submits `data` and polls to completion.
pub fn append<const N: usize>(
    ring: &mut FlashRing<'_, N>,
    flash: &mut Flash,
    queue: u8,
    data: &[u8],
) {
    ring.append(queue, data.len() as u16).expect("append refused");
    run(ring, flash, Payload::Source(data));
    assert_eq!(ring.last_error(), None);
}

/// Deterministic byte soup for round-trip checks.
pub fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2891336453).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            (state >> 16) as u8
        })
        .collect()
}
