use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coordinator asks a worker to stop after its current round; payload is the
/// run number the stop belongs to.
pub const TAG_STOP: i32 = 0xCAFE;
/// Worker finished its loop; payload is its final status code.
pub const TAG_COMPLETED: i32 = 0xDEAD;
/// Worker sends one batch of chunk results.
pub const TAG_RESULTS: i32 = 0xBEEF;

/// Per-record header: start, end, code, data length.
const RECORD_HEADER: usize = 8 + 8 + 4 + 4;

/// Outcome of one device chunk as reported to the coordinator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub start: u64,
    pub end: u64,
    /// 0 ok, 1 stop, negative for an error kind.
    pub code: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated batch: need {needed} bytes at offset {offset}, have {len}")]
    Truncated { offset: usize, needed: usize, len: usize },
    #[error("batch declares {count} records but only {len} bytes follow")]
    BadCount { count: u64, len: usize },
    #[error("{0} trailing bytes after last record")]
    Trailing(usize),
    #[error("expected {expected} byte payload, got {got}")]
    BadLength { expected: usize, got: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("chunk [{start}, {end}) carries {len} bytes, more than a u32 length can describe")]
    DataTooLarge { start: u64, end: u64, len: usize },
}

fn length_field(start: u64, end: u64, len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::DataTooLarge { start, end, len })
}

/// Serializes chunk results as
/// `[count u64][start u64][end u64][code i32][len u32][data]...`, little-endian.
pub fn encode_batch(results: &[ChunkResult]) -> Result<Vec<u8>, EncodeError> {
    let lens = results
        .iter()
        .map(|r| length_field(r.start, r.end, r.data.len()))
        .collect::<Result<Vec<_>, _>>()?;
    let body: usize = results.iter().map(|r| RECORD_HEADER + r.data.len()).sum();
    let mut out = Vec::with_capacity(8 + body);
    out.extend_from_slice(&(results.len() as u64).to_le_bytes());
    for (r, len) in results.iter().zip(lens) {
        out.extend_from_slice(&r.start.to_le_bytes());
        out.extend_from_slice(&r.end.to_le_bytes());
        out.extend_from_slice(&r.code.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&r.data);
    }
    Ok(out)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let s = &self.buf[self.pos..end];
                self.pos = end;
                Ok(s)
            }
            None => Err(DecodeError::Truncated { offset: self.pos, needed: n, len: self.buf.len() }),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.take(N)?);
        Ok(a)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Parses a batch produced by [`encode_batch`], bounds-checking every field.
pub fn decode_batch(buf: &[u8]) -> Result<Vec<ChunkResult>, DecodeError> {
    let mut r = Reader { buf, pos: 0 };
    let count = u64::from_le_bytes(r.array()?);
    let max = (r.remaining() / RECORD_HEADER) as u64;
    if count > max {
        return Err(DecodeError::BadCount { count, len: r.remaining() });
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start = u64::from_le_bytes(r.array()?);
        let end = u64::from_le_bytes(r.array()?);
        let code = i32::from_le_bytes(r.array()?);
        let len = u32::from_le_bytes(r.array()?) as usize;
        let data = r.take(len)?.to_vec();
        out.push(ChunkResult { start, end, code, data });
    }
    if r.remaining() != 0 {
        return Err(DecodeError::Trailing(r.remaining()));
    }
    Ok(out)
}

pub fn encode_stop(run: u64) -> Vec<u8> {
    run.to_le_bytes().to_vec()
}

pub fn decode_stop(buf: &[u8]) -> Result<u64, DecodeError> {
    let a: [u8; 8] = buf
        .try_into()
        .map_err(|_| DecodeError::BadLength { expected: 8, got: buf.len() })?;
    Ok(u64::from_le_bytes(a))
}

/// Completion notices carry a single status code.
pub fn encode_code(code: i32) -> Vec<u8> {
    code.to_le_bytes().to_vec()
}

pub fn decode_code(buf: &[u8]) -> Result<i32, DecodeError> {
    let a: [u8; 4] = buf
        .try_into()
        .map_err(|_| DecodeError::BadLength { expected: 4, got: buf.len() })?;
    Ok(i32::from_le_bytes(a))
}
