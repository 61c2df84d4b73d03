/// Checksum algorithm protecting a header block, selected by the format generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumKind {
    /// XOR of every little-endian `u32` word (first-generation headers).
    XorFold,
    /// CRC32-Castagnoli.
    Crc32c,
}

impl ChecksumKind {
    /// Checksum `block` as if the 4-byte field at `field` were zero.
    pub fn compute(self, block: &[u8], field: usize) -> u32 {
        match self {
            Self::XorFold => xor_fold(block, field),
            Self::Crc32c => crc32c_with_zeroed_field(block, field),
        }
    }
}

pub fn crc32c_with_zeroed_field(block: &[u8], field: usize) -> u32 {
    let crc = crc32c::crc32c(&block[..field]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &block[field + 4..])
}

fn xor_fold(block: &[u8], field: usize) -> u32 {
    block
        .chunks(4)
        .enumerate()
        .filter(|(i, _)| i * 4 != field)
        .fold(0u32, |acc, (_, w)| {
            let mut word = [0u8; 4];
            word[..w.len()].copy_from_slice(w);
            acc ^ u32::from_le_bytes(word)
        })
}
