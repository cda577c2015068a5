//! On-flash record framing.
//!
//! A record starts with an 8-byte header and ends with an 8-byte footer that
//! repeats the header; the bytes between are payload, padded with 0xFF up to
//! the record size. A record counts as complete only when header and footer
//! match and the magic equals the owning queue's magic.

/// Serialized size of [`RecordHeader`] on flash.
pub(crate) const HEADER_SIZE: usize = 8;

/// Marker at both ends of a record: the queue magic and the record id.
///
/// Stored little-endian, byte for byte `[m0 m1 m2 m3 i0 i1 i2 i3]`. The
/// codec below is the single source of truth for the wire layout; the struct
/// is never overlaid onto a flash buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct RecordHeader {
    pub magic: u32,
    pub id: u32,
}

const _: () = assert!(HEADER_SIZE == 2 * core::mem::size_of::<u32>());

impl RecordHeader {
    pub(crate) fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..].copy_from_slice(&self.id.to_le_bytes());
        buf
    }

    /// Reads a header back from `buf[..HEADER_SIZE]`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`].
    pub(crate) fn from_bytes(buf: &[u8]) -> Self {
        RecordHeader {
            magic: u32::from_le_bytes(buf[..4].try_into().unwrap()),
            id: u32::from_le_bytes(buf[4..HEADER_SIZE].try_into().unwrap()),
        }
    }

    /// An erased (all-ones) slot, the NOR idle state.
    pub(crate) fn is_blank(buf: &[u8]) -> bool {
        buf[..HEADER_SIZE].iter().all(|&b| b == 0xFF)
    }
}
