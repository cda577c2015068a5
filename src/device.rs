//! Flash device parameter sets.
//!
//! The driver is device-agnostic: every opcode, the address width and the
//! page/sector topology come from a [`FlashDevice`] value handed to
//! [`FlashRing::new`](crate::FlashRing::new). A single firmware image can
//! therefore talk to different parts, and tests can exercise several.

/// Instruction opcodes of a 25-series SPI NOR flash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OpcodeSet {
    /// Read manufacturer / device id.
    pub rdid: u8,
    /// Write enable (sets the WEL latch).
    pub wr_ena: u8,
    /// Write disable.
    pub wr_dsbl: u8,
    /// Chip erase.
    pub erase_bulk: u8,
    /// Sector erase.
    pub erase_sector: u8,
    /// Read status register 1.
    pub rd_status: u8,
    /// Read data, single SPI mode.
    pub rd_data: u8,
    /// Page program.
    pub wr_page: u8,
}

/// Build-time description of one flash part: name, command set, topology
/// and status-register masks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashDevice {
    /// Part name, e.g. `"W25Q16JV"`.
    pub name: &'static str,
    /// Manufacturer/device id as ascii-hex, as returned by `rdid`.
    pub id_hex: &'static str,
    /// Instruction opcodes.
    pub opcodes: OpcodeSet,
    /// Address width in bytes of read/program/erase instructions.
    pub address_bytes: u8,
    /// Erase granularity in bytes.
    pub sector_size: u32,
    /// Program granularity in bytes.
    pub page_size: u32,
    /// Total device size in bytes.
    pub total_size: u32,
    /// Dummy bytes between the `rdid` instruction and the id response.
    pub rdid_dummy_bytes: u8,
    /// Write-in-progress bit in status register 1.
    pub wip_mask: u8,
    /// Write-enable-latch bit in status register 1.
    pub wren_mask: u8,
}

impl FlashDevice {
    /// Winbond W25Q16JV, 2 MiB.
    pub const W25Q16JV: FlashDevice = FlashDevice {
        name: "W25Q16JV",
        id_hex: "ef14",
        opcodes: OpcodeSet {
            rdid: 0x90,
            wr_ena: 0x06,
            wr_dsbl: 0x04,
            erase_bulk: 0xc7,
            erase_sector: 0x20,
            rd_status: 0x05,
            rd_data: 0x03,
            wr_page: 0x02,
        },
        address_bytes: 3,
        sector_size: 4096,
        page_size: 256,
        total_size: 2 * 1024 * 1024,
        rdid_dummy_bytes: 3,
        wip_mask: 0x01,
        wren_mask: 0x02,
    };

    /// Winbond W25Q32JV, 4 MiB. Same command set as the W25Q16JV.
    pub const W25Q32JV: FlashDevice = FlashDevice {
        name: "W25Q32JV",
        id_hex: "ef15",
        total_size: 4 * 1024 * 1024,
        ..Self::W25Q16JV
    };

    /// Pages per erase sector.
    pub(crate) fn pages_per_sector(&self) -> u32 {
        self.sector_size / self.page_size
    }

    /// `false` for a zeroed/placeholder parameter set.
    pub(crate) fn is_configured(&self) -> bool {
        !self.name.is_empty()
            && self.page_size != 0
            && self.sector_size >= self.page_size
            && self.total_size >= self.sector_size
            && self.address_bytes != 0
    }
}
