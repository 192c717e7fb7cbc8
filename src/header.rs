//! The 64-byte record header: pack/unpack/validate.
//!
//! Every on-disk record is `[RecordHeader; 64 bytes][payload]`. The header
//! is little-endian and fixed-layout regardless of host architecture, which
//! is what lets a cache directory be read back by any future version of this
//! crate (or, for that matter, the original Objective-C implementation this
//! format is compatible with). We get that independent of host endianness
//! for free by using `zerocopy`'s explicit byte-order integer types instead
//! of native `u32`/`u64` fields.

use snafu::Snafu;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Constant magic value identifying a valid record header: ASCII-ish
/// `b"SPTS"`-style sentinel carried over from the format this crate is
/// wire-compatible with.
pub const MAGIC: u32 = 0x4654_5053;

/// The on-disk size of [`RecordHeader`], in bytes. Enforced at build time
/// below via a `const` assertion rather than trusted as a comment.
pub const HEADER_SIZE: u32 = 64;

/// Bit 0 of [`RecordHeader::flags`]: the record may not have finished being
/// written the last time this process touched it. Readers treat such
/// records as absent; the bit is reserved for a streaming-write extension
/// this crate does not implement.
pub const FLAG_STREAM_INCOMPLETE: u32 = 0x1;

/// Fixed 64-byte record header, stored at offset 0 of every record file.
///
/// Field order, size, and offsets are load-bearing: this struct's layout
/// *is* the wire format. Do not reorder, resize, or insert fields; add new
/// ones only by repurposing a `reserved*` slot, the way the original format
/// documents "Version 2: add fields here if required".
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    magic: U32,
    header_size: U32,
    ref_count: U32,
    reserved1: U32,
    ttl: U64,
    update_time_sec: U64,
    payload_size_bytes: U64,
    reserved2: U64,
    reserved3: U32,
    reserved4: U32,
    flags: U32,
    crc: U32,
}

const _ASSERT_HEADER_SIZE: () = assert!(std::mem::size_of::<RecordHeader>() == HEADER_SIZE as usize);

/// Reason a [`RecordHeader`] failed validation.
///
/// Any corrupt-file error here causes the caller (`RecordStore`) to delete
/// the offending file and report the specific variant.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[snafu(display("record header magic mismatch: expected {:#x}, found {:#x}", MAGIC, found))]
    MagicMismatch { found: u32 },

    /// Reserved for platforms where the header's in-memory alignment would
    /// not match its on-disk layout. Using `zerocopy`'s byte-order types
    /// makes every field inherently unaligned, so this crate never actually
    /// produces this variant; it is kept so callers matching on
    /// [`HeaderError`] can do so exhaustively against a stable error set.
    #[snafu(display("record header alignment mismatch"))]
    HeaderAlignmentMismatch,

    #[snafu(display("record header size mismatch: expected {}, found {}", HEADER_SIZE, found))]
    WrongHeaderSize { found: u32 },

    #[snafu(display("record header CRC mismatch: expected {:#x}, found {:#x}", expected, found))]
    InvalidHeaderCrc { expected: u32, found: u32 },

    #[snafu(display("only {} bytes available, need at least {} to read a header", len, HEADER_SIZE))]
    NotEnoughDataToGetHeader { len: usize },
}

impl RecordHeader {
    /// Builds a new header for a freshly stored record, computing its CRC.
    pub fn make(ttl: u64, payload_size: u64, update_time: u64, is_locked: bool) -> Self {
        let mut header = Self {
            magic: U32::new(MAGIC),
            header_size: U32::new(HEADER_SIZE),
            ref_count: U32::new(if is_locked { 1 } else { 0 }),
            reserved1: U32::ZERO,
            ttl: U64::new(ttl),
            update_time_sec: U64::new(update_time),
            payload_size_bytes: U64::new(payload_size),
            reserved2: U64::ZERO,
            reserved3: U32::ZERO,
            reserved4: U32::ZERO,
            flags: U32::ZERO,
            crc: U32::ZERO,
        };
        header.crc = U32::new(header.calculate_crc());
        header
    }

    /// Reads a [`RecordHeader`] out of the first 64 bytes of `bytes`, if
    /// there are enough bytes to do so. Returns `None` rather than an error
    /// because "too short to have a header" is handled by the caller
    /// (`NotEnoughDataToGetHeader`), which has access to the exact length.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (header, _rest) = <Self as FromBytes>::read_from_prefix(bytes).ok()?;
        Some(header)
    }

    /// CRC-32 over header bytes `[0..60)`: everything up to but not
    /// including the `crc` field itself, which sits in the last 4 bytes.
    pub fn calculate_crc(&self) -> u32 {
        let mut copy = *self;
        copy.crc = U32::ZERO;
        crate::crc32::crc32(&copy.as_bytes()[..60])
    }

    /// Validates magic, declared size, and CRC. Does not inspect
    /// `payload_size_bytes` against the actual file length; that check
    /// belongs to [`crate::store::RecordStore`], which has the file size in
    /// hand.
    pub fn validate(&self) -> Result<(), HeaderError> {
        let magic = self.magic.get();
        if magic != MAGIC {
            return Err(HeaderError::MagicMismatch { found: magic });
        }
        let header_size = self.header_size.get();
        if header_size != HEADER_SIZE {
            return Err(HeaderError::WrongHeaderSize { found: header_size });
        }
        let expected = self.calculate_crc();
        let found = self.crc.get();
        if expected != found {
            return Err(HeaderError::InvalidHeaderCrc { expected, found });
        }
        Ok(())
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.get()
    }

    pub fn set_ref_count(&mut self, value: u32) {
        self.ref_count = U32::new(value);
    }

    pub fn ttl(&self) -> u64 {
        self.ttl.get()
    }

    pub fn update_time_sec(&self) -> u64 {
        self.update_time_sec.get()
    }

    pub fn set_update_time_sec(&mut self, value: u64) {
        self.update_time_sec = U64::new(value);
    }

    pub fn payload_size_bytes(&self) -> u64 {
        self.payload_size_bytes.get()
    }

    pub fn is_locked(&self) -> bool {
        self.ref_count() > 0
    }

    pub fn is_stream_incomplete(&self) -> bool {
        self.flags.get() & FLAG_STREAM_INCOMPLETE != 0
    }

    /// Recomputes and stores the CRC. Call after mutating any other field
    /// in place (e.g. `set_ref_count`, `set_update_time_sec`).
    pub fn refresh_crc(&mut self) {
        self.crc = U32::new(self.calculate_crc());
    }

    /// Returns whether this record is expired at time `now`, given the
    /// configured default expiration period (used when `ttl == 0`).
    pub fn is_expired(&self, now: u64, default_expiration_period: u64) -> bool {
        let age = now.saturating_sub(self.update_time_sec());
        let limit = if self.ttl() == 0 {
            default_expiration_period
        } else {
            self.ttl()
        };
        age > limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn make_produces_a_header_that_validates() {
        let header = RecordHeader::make(30, 128, 1000, true);
        assert!(header.validate().is_ok());
        assert_eq!(header.ref_count(), 1);
        assert_eq!(header.ttl(), 30);
        assert_eq!(header.payload_size_bytes(), 128);
        assert!(header.is_locked());
    }

    #[test]
    fn parse_rejects_too_short_input() {
        let short = vec![0u8; HEADER_SIZE as usize - 1];
        assert!(RecordHeader::parse(&short).is_none());
    }

    #[test]
    fn validate_detects_magic_mismatch() {
        let mut header = RecordHeader::make(0, 0, 0, false);
        header.magic = U32::new(0xDEAD_BEEF);
        assert_eq!(
            header.validate(),
            Err(HeaderError::MagicMismatch { found: 0xDEAD_BEEF })
        );
    }

    #[test]
    fn validate_detects_crc_tamper() {
        let mut header = RecordHeader::make(0, 10, 0, false);
        header.ref_count = U32::new(99);
        assert!(matches!(
            header.validate(),
            Err(HeaderError::InvalidHeaderCrc { .. })
        ));
    }

    #[test]
    fn expiry_uses_ttl_when_nonzero_else_default_period() {
        let header = RecordHeader::make(30, 0, 1000, false);
        assert!(!header.is_expired(1020, 600));
        assert!(header.is_expired(1031, 600));

        let header = RecordHeader::make(0, 0, 1000, false);
        assert!(!header.is_expired(1500, 600));
        assert!(header.is_expired(1601, 600));
    }

    proptest! {
        #[test]
        fn round_trip_through_bytes_always_validates(
            ttl in 0u64..100_000,
            payload_size in 0u64..10_000_000,
            update_time in 0u64..4_000_000_000,
            locked in any::<bool>(),
        ) {
            let header = RecordHeader::make(ttl, payload_size, update_time, locked);
            let bytes = header.as_bytes().to_vec();
            let parsed = RecordHeader::parse(&bytes).expect("64 bytes is always enough");
            prop_assert_eq!(parsed.validate(), Ok(()));
            prop_assert_eq!(parsed.ttl(), ttl);
            prop_assert_eq!(parsed.payload_size_bytes(), payload_size);
            prop_assert_eq!(parsed.update_time_sec(), update_time);
            prop_assert_eq!(parsed.ref_count(), if locked { 1 } else { 0 });
        }
    }
}
