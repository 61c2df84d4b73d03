use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::{DiskError, Result};

/// Decodes one compressed grain payload into a caller-provided buffer.
///
/// Kept separate from allocation so formats can plug in other codecs.
pub trait GrainDecoder: Send {
    /// Fill `out` from `payload`, returning how many bytes were produced.
    fn decode(&self, payload: &[u8], out: &mut [u8]) -> Result<usize>;
}

/// Deflate payloads wrapped in a zlib stream header (RFC 1950).
#[derive(Clone, Copy, Debug, Default)]
pub struct ZlibGrainDecoder;

impl GrainDecoder for ZlibGrainDecoder {
    fn decode(&self, payload: &[u8], out: &mut [u8]) -> Result<usize> {
        validate_zlib_header(payload)?;
        let mut decoder = ZlibDecoder::new(payload);
        let mut filled = 0usize;
        while filled < out.len() {
            match decoder.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => return Err(DiskError::CorruptImage("compressed grain payload invalid")),
            }
        }
        Ok(filled)
    }
}

/// Check the two-byte zlib header: deflate method, window size, check bits and no preset
/// dictionary.
pub fn validate_zlib_header(payload: &[u8]) -> Result<()> {
    let [cmf, flg, ..] = *payload else {
        return Err(DiskError::CorruptImage("compressed grain header truncated"));
    };
    if cmf & 0x0F != 8 {
        return Err(DiskError::CorruptImage("compressed grain header bad method"));
    }
    if cmf >> 4 > 7 {
        return Err(DiskError::CorruptImage("compressed grain header bad window"));
    }
    if (u16::from(cmf) << 8 | u16::from(flg)) % 31 != 0 {
        return Err(DiskError::CorruptImage("compressed grain header check bits"));
    }
    if flg & 0x20 != 0 {
        return Err(DiskError::CorruptImage("compressed grain header preset dictionary"));
    }
    Ok(())
}
