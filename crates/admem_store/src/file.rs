//! File-based store for persistent blobs.

use crate::adapter::{Region, StoreAdapter, WalEntryBytes};
use crate::checksum::crc32;
use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Magic bytes at the start of the WAL file.
const WAL_FILE_MAGIC: [u8; 4] = *b"AWLF";

/// magic (4) + id floor (8)
const WAL_FILE_HEADER_SIZE: usize = 12;

/// id (8) + payload length (4) + crc32 (4)
const FRAME_HEADER_SIZE: usize = 16;

/// A file-based store.
///
/// The region lives in one file, pre-sized to the store capacity. The WAL
/// lives next to it in `<path>.wal` as a sequence of framed entries:
///
/// ```text
/// | "AWLF" | id floor (8) | { id (8) | len (4) | crc32 (4) | payload (len) }* |
/// ```
///
/// # Durability
///
/// - `write` and `submit_wal` call `File::sync_data()` before returning
/// - A torn frame at the WAL tail is discarded on open
/// - A failed append is truncated away before `submit_wal` returns, so
///   later entries never land behind a partial frame
/// - `discard_wal` rewrites the log into a temporary file and renames it
///   over the old one, persisting the id floor so ids are never reused
///
/// # Locking
///
/// The region file is locked exclusively for the lifetime of the store.
/// A second open of the same path fails with an I/O error.
///
/// # Example
///
/// ```no_run
/// use admem_store::{FileStore, Region, StoreAdapter};
/// use std::path::Path;
///
/// let store = FileStore::create(Path::new("pool.blob"), 1 << 20).unwrap();
/// store.write(Region::new(0, 4), b"blob").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    wal_path: PathBuf,
    capacity: u64,
    region: Mutex<File>,
    wal: Mutex<WalLog>,
    next_wal_id: AtomicU64,
}

/// The open WAL file and the end of its last complete frame.
#[derive(Debug)]
struct WalLog {
    file: File,
    end: u64,
}

impl WalLog {
    fn append(&mut self, frame: &[u8]) -> StoreResult<()> {
        self.append_with(frame, |file, bytes| file.write_all(bytes))
    }

    /// Writes `frame` at the end of the log through `write`.
    ///
    /// On failure the file is cut back to the previous end.
    fn append_with(
        &mut self,
        frame: &[u8],
        write: impl FnOnce(&mut File, &[u8]) -> io::Result<()>,
    ) -> StoreResult<()> {
        let result = self
            .file
            .seek(SeekFrom::Start(self.end))
            .and_then(|_| write(&mut self.file, frame))
            .and_then(|()| self.file.sync_data());

        match result {
            Ok(()) => {
                self.end += frame.len() as u64;
                Ok(())
            }
            Err(err) => {
                if let Err(trim) = self
                    .file
                    .set_len(self.end)
                    .and_then(|()| self.file.sync_data())
                {
                    warn!(end = self.end, error = %trim, "failed to trim partial WAL frame");
                }
                Err(err.into())
            }
        }
    }
}

/// Result of parsing a WAL file image.
#[derive(Debug)]
struct WalScan {
    floor: u64,
    entries: Vec<WalEntryBytes>,
    valid_len: u64,
}

impl FileStore {
    /// Creates (or reopens) a store at `path` with at least `capacity` bytes.
    ///
    /// Parent directories are created if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be created, sized or locked.
    pub fn create(path: &Path, capacity: u64) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive()?;
        if file.metadata()?.len() < capacity {
            file.set_len(capacity)?;
            file.sync_all()?;
        }
        Self::finish_open(path, file)
    }

    /// Opens an existing store. The capacity is the region file's length.
    ///
    /// # Errors
    ///
    /// Returns an error if the region file does not exist, is locked by
    /// another handle, or the WAL file is not a WAL file.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive()?;
        Self::finish_open(path, file)
    }

    fn finish_open(path: &Path, region: File) -> StoreResult<Self> {
        let capacity = region.metadata()?.len();
        let wal_path = wal_path_for(path);
        let mut wal = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&wal_path)?;

        let image = read_all(&mut wal)?;
        let scan = if image.len() < WAL_FILE_HEADER_SIZE {
            // Missing or torn file header: the log never held an entry.
            wal.set_len(0)?;
            wal.seek(SeekFrom::Start(0))?;
            wal.write_all(&encode_file_header(1))?;
            wal.sync_all()?;
            WalScan {
                floor: 1,
                entries: Vec::new(),
                valid_len: WAL_FILE_HEADER_SIZE as u64,
            }
        } else {
            let scan = parse_wal(&image)?;
            if scan.valid_len < image.len() as u64 {
                warn!(
                    path = %wal_path.display(),
                    valid = scan.valid_len,
                    total = image.len(),
                    "discarding torn WAL tail"
                );
                wal.set_len(scan.valid_len)?;
                wal.sync_all()?;
            }
            scan
        };

        let next = scan
            .entries
            .last()
            .map_or(scan.floor, |(id, _)| (id + 1).max(scan.floor));

        Ok(Self {
            path: path.to_path_buf(),
            wal_path,
            capacity,
            region: Mutex::new(region),
            wal: Mutex::new(WalLog {
                file: wal,
                end: scan.valid_len,
            }),
            next_wal_id: AtomicU64::new(next),
        })
    }

    /// Returns the path of the region file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the WAL file.
    #[must_use]
    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }
}

impl StoreAdapter for FileStore {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read(&self, region: Region, buf: &mut [u8]) -> StoreResult<()> {
        region.check(self.capacity, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let mut file = self.region.lock();
        file.seek(SeekFrom::Start(region.addr))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, region: Region, buf: &[u8]) -> StoreResult<()> {
        region.check(self.capacity, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let mut file = self.region.lock();
        file.seek(SeekFrom::Start(region.addr))?;
        file.write_all(buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn reserve_wal_id(&self) -> StoreResult<u64> {
        Ok(self.next_wal_id.fetch_add(1, Ordering::SeqCst))
    }

    fn submit_wal(&self, id: u64, payload: &[u8]) -> StoreResult<()> {
        let frame = encode_frame(id, payload)?;
        self.wal.lock().append(&frame)
    }

    fn read_wal(&self, after: u64) -> StoreResult<Vec<WalEntryBytes>> {
        let image = {
            let mut wal = self.wal.lock();
            read_all(&mut wal.file)?
        };
        let scan = parse_wal(&image)?;
        Ok(scan
            .entries
            .into_iter()
            .filter(|(id, _)| *id > after)
            .collect())
    }

    fn discard_wal(&self, upto: u64) -> StoreResult<()> {
        let mut wal = self.wal.lock();
        let scan = parse_wal(&read_all(&mut wal.file)?)?;
        let floor = scan.floor.max(upto.saturating_add(1));

        let mut image = encode_file_header(floor).to_vec();
        for (id, payload) in scan.entries.iter().filter(|(id, _)| *id > upto) {
            image.extend_from_slice(&encode_frame(*id, payload)?);
        }

        let mut tmp_path = self.wal_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&image)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.wal_path)?;

        wal.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.wal_path)?;
        wal.end = image.len() as u64;
        self.next_wal_id.fetch_max(floor, Ordering::SeqCst);
        Ok(())
    }
}

fn wal_path_for(path: &Path) -> PathBuf {
    let mut wal = path.as_os_str().to_owned();
    wal.push(".wal");
    PathBuf::from(wal)
}

fn read_all(file: &mut File) -> StoreResult<Vec<u8>> {
    let mut image = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut image)?;
    Ok(image)
}

fn encode_file_header(floor: u64) -> [u8; WAL_FILE_HEADER_SIZE] {
    let mut header = [0u8; WAL_FILE_HEADER_SIZE];
    header[0..4].copy_from_slice(&WAL_FILE_MAGIC);
    header[4..12].copy_from_slice(&floor.to_le_bytes());
    header
}

fn encode_frame(id: u64, payload: &[u8]) -> StoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("WAL payload of {} bytes is too large", payload.len()),
        ))
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&frame_crc(id, len, payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn frame_crc(id: u64, len: u32, payload: &[u8]) -> u32 {
    let mut covered = Vec::with_capacity(12 + payload.len());
    covered.extend_from_slice(&id.to_le_bytes());
    covered.extend_from_slice(&len.to_le_bytes());
    covered.extend_from_slice(payload);
    crc32(&covered)
}

/// Parses a WAL file image. Stops at the first incomplete or mismatching
/// frame, which is reported through `valid_len`.
fn parse_wal(image: &[u8]) -> StoreResult<WalScan> {
    if image.len() < WAL_FILE_HEADER_SIZE || image[0..4] != WAL_FILE_MAGIC {
        return Err(StoreError::Corrupted("invalid WAL file header".into()));
    }
    let mut floor_bytes = [0u8; 8];
    floor_bytes.copy_from_slice(&image[4..12]);
    let floor = u64::from_le_bytes(floor_bytes);

    let mut entries = Vec::new();
    let mut pos = WAL_FILE_HEADER_SIZE;
    while pos + FRAME_HEADER_SIZE <= image.len() {
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&image[pos..pos + 8]);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&image[pos + 8..pos + 12]);
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&image[pos + 12..pos + 16]);

        let id = u64::from_le_bytes(id_bytes);
        let len = u32::from_le_bytes(len_bytes);
        let body_start = pos + FRAME_HEADER_SIZE;
        let body_end = body_start + len as usize;
        if body_end > image.len() {
            break;
        }
        let payload = &image[body_start..body_end];
        if frame_crc(id, len, payload) != u32::from_le_bytes(crc_bytes) {
            break;
        }
        entries.push((id, payload.to_vec()));
        pos = body_end;
    }

    entries.sort_by_key(|(id, _)| *id);
    Ok(WalScan {
        floor,
        entries,
        valid_len: pos as u64,
    })
}
