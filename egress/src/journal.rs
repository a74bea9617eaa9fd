//! The append-only CAR journal. The WIP file is
//! `egress.car.wip`; rotation renames it to `egress.<cid>.car` where the
//! cid commits to the entire file contents, including header bytes and
//! any entries written before a restart. A running SHA-256 is reseeded
//! from the existing WIP bytes on open so the batch identity survives
//! process boundaries.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// CAR multicodec, used both for batch cids and entry block cids.
pub const CAR_CODEC: u64 = 0x0202;

pub const WIP_FILE_NAME: &str = "egress.car.wip";

const BATCH_PREFIX: &str = "egress.";
const BATCH_SUFFIX: &str = ".car";

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header encoding failed: {0}")]
    Header(String),
    #[error("invalid batch cid: {0}")]
    Cid(#[from] cid::Error),
    #[error("unknown batch {0}")]
    UnknownBatch(Cid),
}

pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Serialize, Deserialize)]
struct CarHeader {
    roots: Vec<Cid>,
    version: u64,
}

/// Varint-framed DAG-CBOR header for a rootless CAR v1.
fn header_bytes() -> JournalResult<Vec<u8>> {
    let body = serde_ipld_dagcbor::to_vec(&CarHeader {
        roots: Vec::new(),
        version: 1,
    })
    .map_err(|err| JournalError::Header(err.to_string()))?;
    Ok(frame(&body))
}

/// LdWrite framing: varint length prefix over the payload.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut length = unsigned_varint::encode::usize_buffer();
    let mut out = unsigned_varint::encode::usize(payload.len(), &mut length).to_vec();
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStat {
    /// Bytes currently in the WIP file, header included.
    pub wip_size: u64,
    /// Rotated batches still on disk.
    pub batches: usize,
}

struct Wip {
    file: File,
    hasher: Sha256,
    size: u64,
}

pub struct EgressJournal {
    dir: PathBuf,
    max_batch_size: u64,
    header_len: u64,
    wip: Mutex<Option<Wip>>,
}

impl EgressJournal {
    /// Open (or create) the journal in `dir`. Existing WIP bytes are
    /// streamed into a fresh running hash so the eventual batch cid is a
    /// function of the file contents alone.
    pub fn open(dir: &Path, max_batch_size: u64) -> JournalResult<Self> {
        std::fs::create_dir_all(dir)?;
        let header = header_bytes()?;
        let journal = Self {
            dir: dir.to_path_buf(),
            max_batch_size,
            header_len: header.len() as u64,
            wip: Mutex::new(None),
        };
        let wip = journal.open_wip(&header)?;
        *journal.wip.try_lock().expect("journal not shared yet") = Some(wip);
        Ok(journal)
    }

    fn wip_path(&self) -> PathBuf {
        self.dir.join(WIP_FILE_NAME)
    }

    fn batch_path(&self, cid: &Cid) -> PathBuf {
        self.dir.join(format!("{BATCH_PREFIX}{cid}{BATCH_SUFFIX}"))
    }

    fn open_wip(&self, header: &[u8]) -> JournalResult<Wip> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.wip_path())?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;

        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            size += read as u64;
        }

        if size == 0 {
            file.write_all(header)?;
            hasher.update(header);
            size = header.len() as u64;
        } else {
            debug!(size, "reseeded journal hash from existing wip file");
        }
        file.seek(SeekFrom::End(0))?;
        Ok(Wip { file, hasher, size })
    }

    /// Append one receipt archive as an `LdWrite(cid, archive)` block.
    /// Returns the batch cid when the write pushed the file to the
    /// rotation threshold.
    pub async fn append(&self, archive: &[u8]) -> JournalResult<Option<Cid>> {
        let block_cid = Cid::new_v1(CAR_CODEC, Code::Sha2_256.digest(archive));
        let cid_bytes = block_cid.to_bytes();

        let mut payload = Vec::with_capacity(cid_bytes.len() + archive.len());
        payload.extend_from_slice(&cid_bytes);
        payload.extend_from_slice(archive);
        let entry = frame(&payload);

        let mut guard = self.wip.lock().await;
        let wip = guard.as_mut().expect("journal closed");
        wip.file.write_all(&entry)?;
        wip.hasher.update(&entry);
        wip.size += entry.len() as u64;

        if wip.size >= self.max_batch_size {
            let rotated = self.rotate_locked(&mut *guard)?;
            return Ok(Some(rotated));
        }
        Ok(None)
    }

    /// Rotate regardless of size. No-op when the WIP file holds only the
    /// header.
    pub async fn force_rotate(&self) -> JournalResult<Option<Cid>> {
        let mut guard = self.wip.lock().await;
        let wip = guard.as_mut().expect("journal closed");
        if wip.size <= self.header_len {
            return Ok(None);
        }
        Ok(Some(self.rotate_locked(&mut *guard)?))
    }

    fn rotate_locked(&self, guard: &mut Option<Wip>) -> JournalResult<Cid> {
        let wip = guard.take().expect("journal closed");
        let digest: [u8; 32] = wip.hasher.finalize().into();
        let mh = multihash_wrap_sha256(&digest);
        let cid = Cid::new_v1(CAR_CODEC, mh);

        wip.file.sync_all()?;
        drop(wip.file);
        std::fs::rename(self.wip_path(), self.batch_path(&cid))?;
        info!(batch = %cid, "egress batch rotated");

        let header = header_bytes()?;
        *guard = Some(self.open_wip(&header)?);
        Ok(cid)
    }

    /// Full bytes of a rotated batch.
    pub async fn read_batch(&self, cid: &Cid) -> JournalResult<Vec<u8>> {
        match std::fs::read(self.batch_path(cid)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(JournalError::UnknownBatch(*cid))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// All rotated batch cids currently on disk.
    pub async fn list(&self) -> JournalResult<Vec<Cid>> {
        let mut batches = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(middle) = name
                .strip_prefix(BATCH_PREFIX)
                .and_then(|rest| rest.strip_suffix(BATCH_SUFFIX))
            else {
                continue;
            };
            batches.push(middle.parse::<Cid>()?);
        }
        Ok(batches)
    }

    pub async fn remove(&self, cid: &Cid) -> JournalResult<()> {
        match std::fs::remove_file(self.batch_path(cid)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(JournalError::UnknownBatch(*cid))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn stat(&self) -> JournalResult<JournalStat> {
        let wip_size = {
            let guard = self.wip.lock().await;
            guard.as_ref().map(|wip| wip.size).unwrap_or(0)
        };
        Ok(JournalStat {
            wip_size,
            batches: self.list().await?.len(),
        })
    }

    /// Flush and drop the WIP handle. Appends after close panic.
    pub async fn close(&self) -> JournalResult<()> {
        let mut guard = self.wip.lock().await;
        if let Some(wip) = guard.take() {
            wip.file.sync_all()?;
        }
        Ok(())
    }
}

/// Raw sha2-256 multihash over an already-computed digest.
fn multihash_wrap_sha256(digest: &[u8; 32]) -> cid::multihash::Multihash<64> {
    cid::multihash::Multihash::wrap(0x12, digest).expect("32-byte digest fits")
}
