use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checksum::crc32c_with_zeroed_field;
use crate::util::{align_up_u64, le_u32, le_u64, put_u32, put_u64, try_zeroed_vec};
use crate::{DiskError, Result, StorageBackend};

pub const LOG_ENTRY_MAGIC: [u8; 4] = *b"loge";
/// Entries are padded to, and aligned on, this many bytes.
pub const LOG_BLOCK: u64 = 4096;

const DATA_DESCRIPTOR: [u8; 4] = *b"desc";
const ZERO_DESCRIPTOR: [u8; 4] = *b"zero";
const CHECKSUM_FIELD: usize = 4;
const ENTRY_HEADER_LEN: usize = 64;
const DESCRIPTOR_LEN: usize = 32;
const ZERO_CHUNK: usize = 64 * 1024;

/// One change recorded by a log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogDescriptor {
    /// Write `data` at `file_offset`.
    Data { file_offset: u64, data: Vec<u8> },
    /// Zero `length` bytes at `file_offset`.
    Zero { file_offset: u64, length: u64 },
}

impl LogDescriptor {
    fn payload_len(&self) -> usize {
        match self {
            Self::Data { data, .. } => data.len(),
            Self::Zero { .. } => 0,
        }
    }

    fn apply<B: StorageBackend>(&self, backend: &mut B) -> Result<()> {
        match self {
            Self::Data { file_offset, data } => backend.write_at(*file_offset, data),
            Self::Zero {
                file_offset,
                length,
            } => {
                let zeros = vec![0u8; ZERO_CHUNK.min(*length as usize)];
                let mut done = 0u64;
                while done < *length {
                    let n = (*length - done).min(zeros.len() as u64) as usize;
                    backend.write_at(file_offset + done, &zeros[..n])?;
                    done += n as u64;
                }
                Ok(())
            }
        }
    }
}

/// A durable record of metadata changes that have not necessarily reached their final
/// location yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: u64,
    /// Log-relative offset of the oldest entry whose changes may not be durable.
    pub tail: u64,
    /// The file was at least this long when the entry was written.
    pub flushed_file_offset: u64,
    /// The file must be at least this long once the entry is applied.
    pub last_file_offset: u64,
    pub log_id: Uuid,
    pub descriptors: Vec<LogDescriptor>,
}

impl LogEntry {
    /// Encoded size of an entry carrying `descriptors`.
    pub fn encoded_len(descriptors: &[LogDescriptor]) -> Result<u64> {
        let raw = ENTRY_HEADER_LEN
            + descriptors.len() * DESCRIPTOR_LEN
            + descriptors.iter().map(LogDescriptor::payload_len).sum::<usize>();
        align_up_u64(raw as u64, LOG_BLOCK)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = Self::encoded_len(&self.descriptors)?;
        let len32 =
            u32::try_from(len).map_err(|_| DiskError::Unsupported("log entry too large"))?;
        let mut raw = try_zeroed_vec(len)?;

        raw[..4].copy_from_slice(&LOG_ENTRY_MAGIC);
        put_u32(&mut raw, 8, len32);
        put_u32(&mut raw, 12, self.descriptors.len() as u32);
        put_u64(&mut raw, 16, self.sequence);
        put_u64(&mut raw, 24, self.tail);
        put_u64(&mut raw, 32, self.flushed_file_offset);
        put_u64(&mut raw, 40, self.last_file_offset);
        raw[48..64].copy_from_slice(&self.log_id.to_bytes_le());

        let mut payload_at = ENTRY_HEADER_LEN + self.descriptors.len() * DESCRIPTOR_LEN;
        for (i, desc) in self.descriptors.iter().enumerate() {
            let at = ENTRY_HEADER_LEN + i * DESCRIPTOR_LEN;
            match desc {
                LogDescriptor::Data { file_offset, data } => {
                    raw[at..at + 4].copy_from_slice(&DATA_DESCRIPTOR);
                    put_u64(&mut raw, at + 8, *file_offset);
                    put_u64(&mut raw, at + 16, data.len() as u64);
                    raw[payload_at..payload_at + data.len()].copy_from_slice(data);
                    payload_at += data.len();
                }
                LogDescriptor::Zero {
                    file_offset,
                    length,
                } => {
                    raw[at..at + 4].copy_from_slice(&ZERO_DESCRIPTOR);
                    put_u64(&mut raw, at + 8, *file_offset);
                    put_u64(&mut raw, at + 16, *length);
                }
            }
        }

        let checksum = crc32c_with_zeroed_field(&raw, CHECKSUM_FIELD);
        put_u32(&mut raw, CHECKSUM_FIELD, checksum);
        Ok(raw)
    }

    /// Decode and validate a whole entry. `raw.len()` must equal the recorded length.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < ENTRY_HEADER_LEN || raw[..4] != LOG_ENTRY_MAGIC {
            return Err(DiskError::CorruptImage("log entry magic mismatch"));
        }
        if le_u32(raw, 8) as usize != raw.len() {
            return Err(DiskError::CorruptImage("log entry length mismatch"));
        }
        if crc32c_with_zeroed_field(raw, CHECKSUM_FIELD) != le_u32(raw, CHECKSUM_FIELD) {
            return Err(DiskError::CorruptImage("log entry checksum mismatch"));
        }
        let count = le_u32(raw, 12) as usize;
        let table_end = count
            .checked_mul(DESCRIPTOR_LEN)
            .and_then(|n| n.checked_add(ENTRY_HEADER_LEN))
            .filter(|end| *end <= raw.len())
            .ok_or(DiskError::CorruptImage("log descriptor count too large"))?;

        let mut descriptors = Vec::with_capacity(count);
        let mut payload_at = table_end;
        for i in 0..count {
            let at = ENTRY_HEADER_LEN + i * DESCRIPTOR_LEN;
            let file_offset = le_u64(raw, at + 8);
            let length = le_u64(raw, at + 16);
            file_offset
                .checked_add(length)
                .ok_or(DiskError::CorruptImage("log descriptor overflows"))?;
            let kind = &raw[at..at + 4];
            if kind == DATA_DESCRIPTOR {
                let end = usize::try_from(length)
                    .ok()
                    .and_then(|l| payload_at.checked_add(l))
                    .filter(|end| *end <= raw.len())
                    .ok_or(DiskError::CorruptImage("log payload beyond entry"))?;
                descriptors.push(LogDescriptor::Data {
                    file_offset,
                    data: raw[payload_at..end].to_vec(),
                });
                payload_at = end;
            } else if kind == ZERO_DESCRIPTOR {
                descriptors.push(LogDescriptor::Zero {
                    file_offset,
                    length,
                });
            } else {
                return Err(DiskError::CorruptImage("unknown log descriptor"));
            }
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&raw[48..64]);
        Ok(Self {
            sequence: le_u64(raw, 16),
            tail: le_u64(raw, 24),
            flushed_file_offset: le_u64(raw, 32),
            last_file_offset: le_u64(raw, 40),
            log_id: Uuid::from_bytes_le(id),
            descriptors,
        })
    }
}

/// Location of the log inside the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogRegion {
    pub offset: u64,
    pub size: u64,
}

/// Outcome of [`replay_log`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Sequence numbers of the entries that were applied, in order.
    pub applied: Vec<u64>,
    /// Log-relative offset of the first entry that was rejected (bad checksum, bad length
    /// or a sequence gap). `None` when the scan ended on empty space or a stale entry.
    pub discarded_at: Option<u64>,
    /// Log-relative offset just past the last accepted entry.
    pub end: u64,
    /// Sequence number of the last accepted entry.
    pub last_sequence: Option<u64>,
}

impl ReplayReport {
    /// Nothing had to be applied and nothing was rejected, so the log can be appended to
    /// as it is.
    pub fn is_clean(&self) -> bool {
        self.applied.is_empty() && self.discarded_at.is_none()
    }
}

enum ScanStop {
    End,
    Discard,
}

/// Read the entry at log-relative `pos`. The inner `Err` says why the scan stops there.
fn read_entry<B: StorageBackend>(
    backend: &mut B,
    region: LogRegion,
    pos: u64,
    log_id: Uuid,
) -> Result<std::result::Result<LogEntry, ScanStop>> {
    let mut first = [0u8; ENTRY_HEADER_LEN];
    backend.read_at(region.offset + pos, &mut first)?;
    if first[..4] != LOG_ENTRY_MAGIC {
        return Ok(Err(ScanStop::End));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&first[48..64]);
    if Uuid::from_bytes_le(id) != log_id {
        // Left over from before the last checkpoint.
        return Ok(Err(ScanStop::End));
    }
    let len = le_u32(&first, 8) as u64;
    if len < LOG_BLOCK || len % LOG_BLOCK != 0 || len > region.size - pos {
        return Ok(Err(ScanStop::Discard));
    }
    let mut raw = try_zeroed_vec(len)?;
    backend.read_at(region.offset + pos, &mut raw)?;
    Ok(LogEntry::decode(&raw).map_err(|_| ScanStop::Discard))
}

/// Scan the log, accept the longest valid prefix and apply it.
///
/// Entries must carry `log_id` and consecutive sequence numbers (the first may start
/// anywhere). The scan stops at the first entry that fails validation; nothing after it is
/// applied. Of the accepted prefix, entries at or after the last entry's `tail` are applied
/// in order, the file is extended to the last entry's `last_file_offset` and flushed.
///
/// Replaying the same log twice leaves the file byte-identical.
pub fn replay_log<B: StorageBackend>(
    backend: &mut B,
    region: LogRegion,
    log_id: Uuid,
) -> Result<ReplayReport> {
    let mut accepted: Vec<(u64, LogEntry)> = Vec::new();
    let mut discarded_at = None;
    let mut pos = 0u64;
    while pos + LOG_BLOCK <= region.size {
        let entry = match read_entry(backend, region, pos, log_id)? {
            Ok(entry) => entry,
            Err(ScanStop::End) => break,
            Err(ScanStop::Discard) => {
                discarded_at = Some(pos);
                break;
            }
        };
        if let Some((_, prev)) = accepted.last() {
            if entry.sequence != prev.sequence.wrapping_add(1) {
                discarded_at = Some(pos);
                break;
            }
        }
        let len = LogEntry::encoded_len(&entry.descriptors)?;
        accepted.push((pos, entry));
        pos += len;
    }

    if let Some(at) = discarded_at {
        warn!(offset = at, accepted = accepted.len(), "log truncated at damaged entry");
    }
    let Some((_, last)) = accepted.last() else {
        return Ok(ReplayReport {
            applied: Vec::new(),
            discarded_at,
            end: 0,
            last_sequence: None,
        });
    };

    let file_len = backend.len()?;
    if file_len < last.flushed_file_offset {
        return Err(DiskError::CorruptImage(
            "file shorter than the log's flushed offset",
        ));
    }
    let tail = last.tail;
    let last_file_offset = last.last_file_offset;
    let last_sequence = Some(last.sequence);

    let mut applied = Vec::new();
    for (at, entry) in accepted.iter().filter(|(at, _)| *at >= tail) {
        if applied.is_empty() {
            info!(entries = accepted.len(), tail, "replaying log");
        }
        for desc in &entry.descriptors {
            desc.apply(backend)?;
        }
        debug!(sequence = entry.sequence, offset = at, "applied log entry");
        applied.push(entry.sequence);
    }
    let grow = file_len < last_file_offset;
    if grow {
        backend.set_len(last_file_offset)?;
    }
    // A settled log leaves the file untouched, so clean images replay on read-only media.
    if grow || !applied.is_empty() {
        backend.flush()?;
    }
    Ok(ReplayReport {
        applied,
        discarded_at,
        end: pos,
        last_sequence,
    })
}

/// Appends entries to a log region.
///
/// The log is linear: entries are written from the start of the region until it is full,
/// then the owner checkpoints and calls [`LogWriter::reset`] with a fresh log id, which
/// invalidates everything written before.
#[derive(Clone, Debug)]
pub struct LogWriter {
    region: LogRegion,
    log_id: Uuid,
    head: u64,
    tail: u64,
    sequence: u64,
}

impl LogWriter {
    pub fn new(region: LogRegion, log_id: Uuid) -> Self {
        Self {
            region,
            log_id,
            head: 0,
            tail: 0,
            sequence: 0,
        }
    }

    pub fn log_id(&self) -> Uuid {
        self.log_id
    }

    pub fn region(&self) -> LogRegion {
        self.region
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether an entry of `len` bytes fits after the current head.
    pub fn fits(&self, len: u64) -> Result<bool> {
        if len > self.region.size {
            return Err(DiskError::Unsupported("log entry larger than the log"));
        }
        Ok(self.head + len <= self.region.size)
    }

    /// Continue a log that replay found settled: append after `end`, numbering from
    /// `sequence`.
    pub fn resume(&mut self, end: u64, sequence: u64) {
        self.head = end;
        self.tail = end;
        self.sequence = sequence;
    }

    /// No entry has been appended since the tail last advanced.
    pub fn is_settled(&self) -> bool {
        self.tail == self.head
    }

    pub fn reset(&mut self, log_id: Uuid) {
        self.log_id = log_id;
        self.head = 0;
        self.tail = 0;
    }

    /// Everything appended so far is durable at its final location.
    pub fn mark_flushed(&mut self) {
        self.tail = self.head;
    }

    /// Write one entry and flush it. The caller must have checked [`LogWriter::fits`].
    pub fn append<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        descriptors: Vec<LogDescriptor>,
        flushed_file_offset: u64,
        last_file_offset: u64,
    ) -> Result<u64> {
        let tail = self.tail;
        self.append_with_tail(
            backend,
            descriptors,
            tail,
            flushed_file_offset,
            last_file_offset,
        )
    }

    /// Persist the tail after [`LogWriter::mark_flushed`] as an empty entry whose tail
    /// points past itself, so replay has nothing left to apply. The caller must have
    /// checked that one [`LOG_BLOCK`] fits.
    pub fn append_tail<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        file_len: u64,
    ) -> Result<u64> {
        self.mark_flushed();
        let past = self.head + LOG_BLOCK;
        let sequence = self.append_with_tail(backend, Vec::new(), past, file_len, file_len)?;
        self.mark_flushed();
        Ok(sequence)
    }

    fn append_with_tail<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        descriptors: Vec<LogDescriptor>,
        tail: u64,
        flushed_file_offset: u64,
        last_file_offset: u64,
    ) -> Result<u64> {
        let entry = LogEntry {
            sequence: self.sequence + 1,
            tail,
            flushed_file_offset,
            last_file_offset,
            log_id: self.log_id,
            descriptors,
        };
        let raw = entry.encode()?;
        if !self.fits(raw.len() as u64)? {
            return Err(DiskError::Io("log full".into()));
        }
        backend.write_at(self.region.offset + self.head, &raw)?;
        backend.flush()?;
        self.head += raw.len() as u64;
        self.sequence = entry.sequence;
        Ok(entry.sequence)
    }
}
