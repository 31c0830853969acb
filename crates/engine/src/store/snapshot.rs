// Full-state snapshot files, one per document: `<root>/snapshots/{doc_key}.snap`.
//
//   offset  size  field
//   0       4     magic `SNP1`
//   4       1     format version
//   5       1     body encoding (0 raw, 1 run-length)
//   6       8     last sequence folded in, little-endian
//   14      4     decoded body length, little-endian
//   18      ..    body

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use replica_common::{DocKey, Sequence};
use uuid::Uuid;

use super::StoredSnapshot;

const MAGIC: &[u8; 4] = b"SNP1";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Raw,
    /// `(count, byte)` pairs, counts 1..=255.
    RunLength,
}

impl BodyEncoding {
    fn tag(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::RunLength => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Raw),
            1 => Ok(Self::RunLength),
            other => bail!("unknown snapshot body encoding {other}"),
        }
    }

    /// Run-length encode when that is strictly smaller.
    fn pick(payload: &[u8]) -> (Self, Cow<'_, [u8]>) {
        let packed = run_length_encode(payload);
        if packed.len() < payload.len() {
            (Self::RunLength, Cow::Owned(packed))
        } else {
            (Self::Raw, Cow::Borrowed(payload))
        }
    }

    fn decode(self, body: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let decoded = match self {
            Self::Raw => body.to_vec(),
            Self::RunLength => run_length_decode(body, expected_len)?,
        };
        ensure!(
            decoded.len() == expected_len,
            "snapshot body decodes to {} bytes, header says {expected_len}",
            decoded.len()
        );
        Ok(decoded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SnapshotHeader {
    encoding: BodyEncoding,
    sequence: Sequence,
    body_len: u32,
}

impl SnapshotHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4] = FORMAT_VERSION;
        out[5] = self.encoding.tag();
        out[6..14].copy_from_slice(&self.sequence.to_le_bytes());
        out[14..].copy_from_slice(&self.body_len.to_le_bytes());
        out
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= HEADER_LEN, "truncated header ({} bytes)", bytes.len());
        ensure!(&bytes[..4] == MAGIC, "bad magic");
        ensure!(bytes[4] == FORMAT_VERSION, "unsupported format version {}", bytes[4]);
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[6..14]);
        let mut body_len = [0u8; 4];
        body_len.copy_from_slice(&bytes[14..HEADER_LEN]);
        Ok(Self {
            encoding: BodyEncoding::from_tag(bytes[5])?,
            sequence: Sequence::from_le_bytes(sequence),
            body_len: u32::from_le_bytes(body_len),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join("snapshots");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot directory `{}`", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, doc_key: &DocKey) -> PathBuf {
        self.dir.join(format!("{doc_key}.snap"))
    }

    /// Replace the snapshot for `doc_key`. Readers see either the old file or
    /// the new one, never a partial write.
    pub fn save_snapshot(
        &self,
        doc_key: &DocKey,
        sequence: Sequence,
        payload: &[u8],
    ) -> Result<BodyEncoding> {
        let body_len = u32::try_from(payload.len())
            .with_context(|| format!("snapshot for `{doc_key}` is too large"))?;
        let (encoding, body) = BodyEncoding::pick(payload);
        let header = SnapshotHeader { encoding, sequence, body_len };

        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&body);
        replace_file(&self.path_for(doc_key), &bytes)?;
        Ok(encoding)
    }

    pub fn load_snapshot(&self, doc_key: &DocKey) -> Result<Option<StoredSnapshot>> {
        let path = self.path_for(doc_key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read `{}`", path.display()))
            }
        };

        let header = SnapshotHeader::parse(&bytes)
            .with_context(|| format!("snapshot `{}` is unreadable", path.display()))?;
        let payload = header
            .encoding
            .decode(&bytes[HEADER_LEN..], header.body_len as usize)
            .with_context(|| format!("snapshot `{}` is corrupt", path.display()))?;
        Ok(Some(StoredSnapshot { sequence: header.sequence, payload }))
    }
}

/// Write `bytes` to a sibling temp file, sync it, then rename over `target`.
fn replace_file(target: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = target.file_name().and_then(|name| name.to_str()).unwrap_or("snapshot");
    let staging = target.with_file_name(format!(".{file_name}.{}", Uuid::new_v4()));
    let mut file = File::create(&staging)
        .with_context(|| format!("failed to create `{}`", staging.display()))?;
    file.write_all(bytes).with_context(|| format!("failed to write `{}`", staging.display()))?;
    file.sync_all().with_context(|| format!("failed to sync `{}`", staging.display()))?;
    drop(file);
    fs::rename(&staging, target).with_context(|| {
        format!("failed to move `{}` into place at `{}`", staging.display(), target.display())
    })
}

fn run_length_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for run in input.chunk_by(|a, b| a == b) {
        for piece in run.chunks(usize::from(u8::MAX)) {
            // `chunks(255)` bounds the length.
            out.push(piece.len() as u8);
            out.push(piece[0]);
        }
    }
    out
}

fn run_length_decode(body: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    ensure!(body.len() % 2 == 0, "run-length body has odd length {}", body.len());
    let mut out = Vec::with_capacity(expected_len);
    for pair in body.chunks_exact(2) {
        let (count, byte) = (usize::from(pair[0]), pair[1]);
        ensure!(count > 0, "zero-length run at offset {}", out.len());
        ensure!(out.len() + count <= expected_len, "runs overflow the declared length");
        out.resize(out.len() + count, byte);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ydoc::YDoc;
    use replica_common::UpdateOrigin;
    use tempfile::tempdir;

    fn key(name: &str) -> DocKey {
        DocKey::new(name).expect("valid doc key")
    }

    #[test]
    fn document_state_survives_save_and_load() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path()).expect("snapshot store");
        let doc_key = key("note-1");
        let doc = YDoc::with_client_id(7);
        doc.insert_text_with_origin("content", 0, "folded state", UpdateOrigin::Local);

        store.save_snapshot(&doc_key, 42, &doc.encode_state()).expect("save");
        let loaded = store.load_snapshot(&doc_key).expect("load").expect("snapshot exists");

        assert_eq!(loaded.sequence, 42);
        let restored = YDoc::from_state(&loaded.payload).expect("state should restore");
        assert_eq!(restored.get_text_string("content"), "folded state");
    }

    #[test]
    fn long_runs_are_stored_run_length_encoded() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path()).expect("snapshot store");
        let doc_key = key("zeros");
        let payload = vec![0u8; 1000];

        assert_eq!(store.save_snapshot(&doc_key, 3, &payload).expect("save"), BodyEncoding::RunLength);
        let on_disk = fs::metadata(store.path_for(&doc_key)).expect("metadata").len();
        // Four runs of at most 255 bytes.
        assert_eq!(on_disk, (HEADER_LEN + 8) as u64);
        assert_eq!(store.load_snapshot(&doc_key).unwrap().unwrap().payload, payload);
    }

    #[test]
    fn incompressible_payload_is_stored_raw() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let (encoding, body) = BodyEncoding::pick(&payload);
        assert_eq!(encoding, BodyEncoding::Raw);
        assert_eq!(body.as_ref(), payload.as_slice());
    }

    #[test]
    fn header_layout_is_stable() {
        let header = SnapshotHeader { encoding: BodyEncoding::RunLength, sequence: 9, body_len: 4 };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..6], b"SNP1\x01\x01");
        assert_eq!(SnapshotHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path()).expect("snapshot store");
        assert!(store.load_snapshot(&key("absent")).expect("load").is_none());
    }

    #[test]
    fn damaged_files_are_errors() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path()).expect("snapshot store");
        let doc_key = key("note-1");
        store.save_snapshot(&doc_key, 1, b"abc").expect("save");
        let path = store.path_for(&doc_key);

        let mut bytes = fs::read(&path).unwrap();
        bytes[0] = b'X';
        fs::write(&path, &bytes).unwrap();
        assert!(store.load_snapshot(&doc_key).is_err());

        fs::write(&path, b"SNP1").unwrap();
        assert!(store.load_snapshot(&doc_key).is_err());
    }

    #[test]
    fn run_length_decode_rejects_malformed_bodies() {
        assert!(run_length_decode(&[3], 3).is_err());
        assert!(run_length_decode(&[0, 7], 0).is_err());
        assert!(run_length_decode(&[4, 7], 3).is_err());
        assert_eq!(run_length_decode(&[2, 7, 1, 8], 3).unwrap(), vec![7, 7, 8]);
    }

    #[test]
    fn no_staging_files_are_left_behind() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path()).expect("snapshot store");
        store.save_snapshot(&key("note-1"), 1, b"one").unwrap();
        store.save_snapshot(&key("note-1"), 2, b"two").unwrap();

        let names: Vec<_> = fs::read_dir(tmp.path().join("snapshots"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["note-1.snap".to_string()]);
    }
}
