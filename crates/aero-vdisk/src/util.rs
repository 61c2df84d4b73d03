use crate::{DiskError, Result};

pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Err(DiskError::OffsetOverflow);
    }
    let rem = value % alignment;
    if rem == 0 {
        return Ok(value);
    }
    value
        .checked_add(alignment - rem)
        .ok_or(DiskError::OffsetOverflow)
}

pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

pub fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

pub fn put_u16(bytes: &mut [u8], at: usize, v: u16) {
    bytes[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u32(bytes: &mut [u8], at: usize, v: u32) {
    bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u64(bytes: &mut [u8], at: usize, v: u64) {
    bytes[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Allocate a zeroed buffer without aborting on absurd sizes from untrusted metadata.
pub fn try_zeroed_vec(len: u64) -> Result<Vec<u8>> {
    let len: usize = len
        .try_into()
        .map_err(|_| DiskError::Unsupported("buffer too large"))?;
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| DiskError::QuotaExceeded)?;
    v.resize(len, 0);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_u64_supports_non_power_of_two_alignments() {
        assert_eq!(align_up_u64(0, 10).unwrap(), 0);
        assert_eq!(align_up_u64(20, 10).unwrap(), 20);
        assert_eq!(align_up_u64(1, 10).unwrap(), 10);
        assert_eq!(align_up_u64(12, 10).unwrap(), 20);
    }

    #[test]
    fn align_up_u64_errors_on_zero_alignment() {
        assert!(matches!(
            align_up_u64(1, 0).unwrap_err(),
            DiskError::OffsetOverflow
        ));
    }

    #[test]
    fn align_up_u64_reports_overflow() {
        // u64::MAX is not 10-byte aligned and cannot be rounded up without overflowing.
        assert!(matches!(
            align_up_u64(u64::MAX, 10).unwrap_err(),
            DiskError::OffsetOverflow
        ));
    }

    #[test]
    fn little_endian_helpers_roundtrip_at_offsets() {
        let mut buf = [0u8; 16];
        put_u16(&mut buf, 1, 0xBEEF);
        put_u32(&mut buf, 3, 0xDEAD_BEEF);
        put_u64(&mut buf, 8, 0x0102_0304_0506_0708);
        assert_eq!(le_u16(&buf, 1), 0xBEEF);
        assert_eq!(le_u32(&buf, 3), 0xDEAD_BEEF);
        assert_eq!(le_u64(&buf, 8), 0x0102_0304_0506_0708);
        assert_eq!(buf[8], 0x08);
    }

    #[test]
    fn checked_range_rejects_reads_past_capacity() {
        assert!(checked_range(10, 5, 15).is_ok());
        assert!(matches!(
            checked_range(10, 6, 15).unwrap_err(),
            DiskError::OutOfBounds { .. }
        ));
        assert!(matches!(
            checked_range(u64::MAX, 1, u64::MAX).unwrap_err(),
            DiskError::OffsetOverflow
        ));
    }
}
