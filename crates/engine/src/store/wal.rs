use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use replica_common::Sequence;

use super::StoredUpdate;

const FRAME_HEADER_BYTES: usize = 16;
const MAX_UPDATE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalReplaySummary {
    pub valid_frames: usize,
    pub last_sequence: Option<Sequence>,
    pub truncated: bool,
    pub checksum_failed: bool,
}

/// Append-only per-document update log:
/// [len:u32 little-endian][checksum:u32 little-endian][sequence:u64 little-endian][payload:len bytes]
///
/// The checksum covers the sequence bytes and the payload.
#[derive(Debug, Clone)]
pub struct WalStore {
    path: PathBuf,
}

impl WalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create wal directory `{}`", parent.display())
            })?;
        }

        // Ensure the file exists so replay can open it consistently.
        open_append(&path)
            .with_context(|| format!("failed to open wal file `{}`", path.display()))?;

        Ok(Self { path })
    }

    pub fn append_update(&self, sequence: Sequence, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(sequence, payload)?;
        let mut file = open_append(&self.path).with_context(|| {
            format!("failed to open wal file `{}` for append", self.path.display())
        })?;
        file.write_all(&frame).context("failed to write wal frame payload")?;
        file.sync_data().context("failed to fsync wal file")?;
        Ok(())
    }

    /// Read every valid record in order. Corrupted/truncated frames are treated as a
    /// recoverable tail: reading stops at the first bad frame and the WAL is truncated
    /// to the last valid offset.
    pub fn read_all(&self) -> Result<(Vec<StoredUpdate>, WalReplaySummary)> {
        let mut records = Vec::new();
        let summary = self.replay(|sequence, payload| {
            records.push(StoredUpdate { sequence, payload: payload.to_vec() });
            Ok(())
        })?;
        Ok((records, summary))
    }

    pub fn replay<F>(&self, mut on_update: F) -> Result<WalReplaySummary>
    where
        F: FnMut(Sequence, &[u8]) -> Result<()>,
    {
        let mut file = OpenOptions::new().read(true).open(&self.path).with_context(|| {
            format!("failed to open wal file `{}` for replay", self.path.display())
        })?;

        let mut valid_frames = 0usize;
        let mut last_sequence = None;
        let mut truncate_to = None;
        let mut checksum_failed = false;
        loop {
            let frame_offset =
                file.stream_position().context("failed to read wal stream position")?;
            let mut header = [0u8; FRAME_HEADER_BYTES];
            let bytes_read = file.read(&mut header).context("failed reading wal frame header")?;
            if bytes_read == 0 {
                break;
            }

            if bytes_read < FRAME_HEADER_BYTES
                && file.read_exact(&mut header[bytes_read..]).is_err()
            {
                truncate_to = Some(frame_offset);
                break;
            }

            let (len, expected_checksum, sequence_bytes) = split_header(&header);
            if len > MAX_UPDATE_BYTES {
                truncate_to = Some(frame_offset);
                break;
            }

            let mut payload = vec![0u8; len];
            if file.read_exact(&mut payload).is_err() {
                truncate_to = Some(frame_offset);
                break;
            }

            if checksum(&sequence_bytes, &payload) != expected_checksum {
                truncate_to = Some(frame_offset);
                checksum_failed = true;
                break;
            }

            let sequence = Sequence::from_le_bytes(sequence_bytes);
            on_update(sequence, &payload).context("failed to apply wal frame payload")?;
            last_sequence = Some(sequence);
            valid_frames = valid_frames.saturating_add(1);
        }

        drop(file);
        if let Some(offset) = truncate_to {
            truncate_wal(&self.path, offset)?;
        }

        Ok(WalReplaySummary {
            valid_frames,
            last_sequence,
            truncated: truncate_to.is_some(),
            checksum_failed,
        })
    }

    /// Drop every record; used once the log has been folded into a snapshot.
    pub fn clear(&self) -> Result<()> {
        truncate_wal(&self.path, 0)
    }

    /// Keep only records with a sequence above `folded`, rewriting the log in
    /// place. Returns how many records were dropped.
    ///
    /// Callers must keep appends to this log out while it runs.
    pub fn retain_after(&self, folded: Sequence) -> Result<usize> {
        let (records, _) = self.read_all()?;
        let kept: Vec<&StoredUpdate> =
            records.iter().filter(|record| record.sequence > folded).collect();
        let dropped = records.len() - kept.len();
        if kept.is_empty() {
            self.clear()?;
            return Ok(dropped);
        }
        if dropped == 0 {
            return Ok(0);
        }

        let mut bytes = Vec::new();
        for record in &kept {
            bytes.extend_from_slice(&encode_frame(record.sequence, &record.payload)?);
        }
        let staging = self.path.with_extension("wal.rewrite");
        let mut file = fs::File::create(&staging)
            .with_context(|| format!("failed to create `{}`", staging.display()))?;
        file.write_all(&bytes).context("failed to write rewritten wal")?;
        file.sync_data().context("failed to fsync rewritten wal")?;
        drop(file);
        fs::rename(&staging, &self.path).with_context(|| {
            format!("failed to replace wal file `{}`", self.path.display())
        })?;
        Ok(dropped)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_frame(sequence: Sequence, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_UPDATE_BYTES {
        anyhow::bail!("wal payload of {} bytes exceeds {MAX_UPDATE_BYTES}", payload.len());
    }
    let len = u32::try_from(payload.len()).context("wal payload exceeds u32::MAX")?;
    let sequence_bytes = sequence.to_le_bytes();
    let checksum = checksum(&sequence_bytes, payload);
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&sequence_bytes);
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn split_header(header: &[u8; FRAME_HEADER_BYTES]) -> (usize, u32, [u8; 8]) {
    let mut len = [0u8; 4];
    let mut checksum = [0u8; 4];
    let mut sequence = [0u8; 8];
    len.copy_from_slice(&header[..4]);
    checksum.copy_from_slice(&header[4..8]);
    sequence.copy_from_slice(&header[8..]);
    (u32::from_le_bytes(len) as usize, u32::from_le_bytes(checksum), sequence)
}

fn checksum(sequence: &[u8], payload: &[u8]) -> u32 {
    // FNV-1a 32-bit checksum for simple corruption detection.
    let mut hash = 0x811c9dc5u32;
    for byte in sequence.iter().chain(payload) {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn open_append(path: &Path) -> std::io::Result<fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn truncate_wal(path: &Path, offset: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open wal file `{}` for truncation", path.display()))?;
    file.set_len(offset)
        .with_context(|| format!("failed to truncate wal file `{}` to {offset}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("failed to fsync truncated wal file `{}`", path.display()))?;
    Ok(())
}
