//! Append-only chunk files for block bodies and revert logs
//!
//! Each record is `[length u32][crc32 u32][payload]`. Files are named
//! `<prefix><file id>.dat` and rotate once they reach the configured size.

use crate::encoding::{write_u32, write_varint, Decodable, Encodable, Reader};
use crate::error::{ConsensusError, Result};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RECORD_HEADER_SIZE: u64 = 8;

/// Location of one stored payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRef {
    pub file_id: u32,
    /// Offset of the record header within the file
    pub offset: u64,
    /// Payload length
    pub length: u32,
}

impl Encodable for ChunkRef {
    fn encode(&self, w: &mut Vec<u8>) {
        write_varint(w, self.file_id as u64);
        write_varint(w, self.offset);
        write_u32(w, self.length);
    }
}

impl Decodable for ChunkRef {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { file_id: r.read_varint_u32()?, offset: r.read_varint()?, length: r.read_u32()? })
    }
}

pub trait ChunkStore: Send + Sync {
    /// Append a payload, returning where it was written
    fn append(&self, payload: &[u8]) -> Result<ChunkRef>;

    /// Read a payload back, verifying its length and checksum
    fn read(&self, chunk: &ChunkRef) -> Result<Vec<u8>>;
}

fn record(payload: &[u8]) -> Result<Vec<u8>> {
    let length = u32::try_from(payload.len())
        .map_err(|_| ConsensusError::SizeLimitExceeded(format!("chunk payload {} bytes", payload.len())))?;
    let mut out = Vec::with_capacity(payload.len() + RECORD_HEADER_SIZE as usize);
    write_u32(&mut out, length);
    write_u32(&mut out, crc32fast::hash(payload));
    out.extend_from_slice(payload);
    Ok(out)
}

fn check_record(chunk: &ChunkRef, header: &[u8; 8], payload: &[u8]) -> Result<()> {
    let mut r = Reader::new(header);
    let length = r.read_u32()?;
    let crc = r.read_u32()?;
    if length != chunk.length {
        return Err(ConsensusError::Storage(format!(
            "chunk {}:{} length {} does not match reference {}",
            chunk.file_id, chunk.offset, length, chunk.length
        )));
    }
    if crc32fast::hash(payload) != crc {
        return Err(ConsensusError::Storage(format!("chunk {}:{} checksum mismatch", chunk.file_id, chunk.offset)));
    }
    Ok(())
}

struct WriteHead {
    file_id: u32,
    offset: u64,
    file: File,
}

/// Rotating chunk files in one directory
pub struct FileChunkStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    head: Mutex<WriteHead>,
}

impl FileChunkStore {
    /// Open (or create) the chunk files `prefix*.dat` under `dir`, appending to the newest
    pub fn open(dir: impl AsRef<Path>, prefix: &str, max_file_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut file_id = 0u32;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(".dat"))
                .and_then(|id| id.parse::<u32>().ok())
            {
                file_id = file_id.max(id);
            }
        }
        let path = Self::file_path(&dir, prefix, file_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();
        debug!(path = %path.display(), offset, "opened chunk file");
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            max_file_size,
            head: Mutex::new(WriteHead { file_id, offset, file }),
        })
    }

    fn file_path(dir: &Path, prefix: &str, file_id: u32) -> PathBuf {
        dir.join(format!("{}{:05}.dat", prefix, file_id))
    }
}

impl ChunkStore for FileChunkStore {
    fn append(&self, payload: &[u8]) -> Result<ChunkRef> {
        let data = record(payload)?;
        let mut head = self.head.lock();
        if head.offset > 0 && head.offset + data.len() as u64 > self.max_file_size {
            let file_id = head.file_id + 1;
            let path = Self::file_path(&self.dir, &self.prefix, file_id);
            head.file = OpenOptions::new().create(true).append(true).open(&path)?;
            head.file_id = file_id;
            head.offset = 0;
            debug!(path = %path.display(), "rotated chunk file");
        }
        if let Err(e) = head.file.write_all(&data).and_then(|()| head.file.flush()) {
            // Drop any torn record; if that fails, follow the real file end
            if let Err(truncate) = head.file.set_len(head.offset) {
                warn!(file_id = head.file_id, offset = head.offset, error = %truncate, "cannot truncate torn chunk record");
            }
            head.offset = head.file.metadata()?.len();
            return Err(e.into());
        }
        let chunk = ChunkRef { file_id: head.file_id, offset: head.offset, length: payload.len() as u32 };
        head.offset += data.len() as u64;
        Ok(chunk)
    }

    fn read(&self, chunk: &ChunkRef) -> Result<Vec<u8>> {
        let path = Self::file_path(&self.dir, &self.prefix, chunk.file_id);
        let mut file = File::open(&path)
            .map_err(|e| ConsensusError::Storage(format!("chunk file {}: {}", path.display(), e)))?;
        file.seek(SeekFrom::Start(chunk.offset))?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        let mut payload = vec![0u8; chunk.length as usize];
        file.read_exact(&mut payload)?;
        check_record(chunk, &header, &payload)?;
        Ok(payload)
    }
}

/// In-memory chunk store: one growing buffer per file id
#[derive(Default)]
pub struct MemoryChunkStore {
    files: RwLock<Vec<Vec<u8>>>,
    max_file_size: u64,
}

impl MemoryChunkStore {
    pub fn new(max_file_size: u64) -> Self {
        Self { files: RwLock::new(vec![Vec::new()]), max_file_size }
    }
}

impl ChunkStore for MemoryChunkStore {
    fn append(&self, payload: &[u8]) -> Result<ChunkRef> {
        let data = record(payload)?;
        let mut files = self.files.write();
        if files.is_empty() {
            files.push(Vec::new());
        }
        let last_len = files.last().map_or(0, |f| f.len() as u64);
        if last_len > 0 && last_len + data.len() as u64 > self.max_file_size {
            files.push(Vec::new());
        }
        let file_id = (files.len() - 1) as u32;
        let file = &mut files[file_id as usize];
        let offset = file.len() as u64;
        file.extend_from_slice(&data);
        Ok(ChunkRef { file_id, offset, length: payload.len() as u32 })
    }

    fn read(&self, chunk: &ChunkRef) -> Result<Vec<u8>> {
        let files = self.files.read();
        let file = files
            .get(chunk.file_id as usize)
            .ok_or_else(|| ConsensusError::Storage(format!("no chunk file {}", chunk.file_id)))?;
        let start = chunk.offset as usize;
        let end = start + RECORD_HEADER_SIZE as usize + chunk.length as usize;
        if end > file.len() {
            return Err(ConsensusError::Storage(format!(
                "chunk {}:{} beyond end of file",
                chunk.file_id, chunk.offset
            )));
        }
        let mut header = [0u8; 8];
        header.copy_from_slice(&file[start..start + 8]);
        let payload = file[start + 8..end].to_vec();
        check_record(chunk, &header, &payload)?;
        Ok(payload)
    }
}
