//! # Segment file log
//!
//! A queue's durable backing store: one or more append-only segment files
//! under the queue's directory, plus a `commits.log` side index recording
//! which entry ids have been committed. On restart, every entry not present
//! in `commits.log` becomes the recovered queue contents, in original
//! enqueue order (§4.7).
//!
//! Each on-disk frame is `[u32 len][record bytes][u32 crc32]`; `len` covers
//! only the record bytes, so a reader that can't read a full frame at EOF
//! treats it as a truncated tail write and discards it, per §4.7.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::durable::record::{self, RECORD_VERSION};
use crate::error::DispatchError;
use crate::queue::DispatchItem;

/// Rotate to a new segment once the active one exceeds this size.
const MAX_SEGMENT_BYTES: u64 = 8 * 1024 * 1024;

/// Monotonically increasing id assigned to every appended entry, in write
/// order; stable across restarts because recovery re-derives the same
/// sequence by scanning segments in the same deterministic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

struct ActiveSegment {
    path: PathBuf,
    file: File,
    size: u64,
    index: u64,
}

/// Durable, append-only, segmented log backing one queue's directory.
pub struct SegmentLog {
    dir: PathBuf,
    active: Mutex<ActiveSegment>,
    committed: Mutex<HashSet<u64>>,
    commits_file: Mutex<File>,
    next_id: AtomicU64,
    /// Highest entry id written to each segment file, used to decide when a
    /// whole segment can be reclaimed.
    segment_bounds: Mutex<BTreeMap<u64, (PathBuf, u64)>>,
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("segment-{index:010}.log"))
}

impl SegmentLog {
    /// Open (creating if absent) the segment log rooted at `dir`, returning
    /// the log and every uncommitted entry recovered from disk, in their
    /// original enqueue order.
    pub fn open(dir: &Path) -> io::Result<(Self, Vec<(EntryId, DispatchItem)>)> {
        fs::create_dir_all(dir)?;

        let committed = load_commits(dir)?;
        let commits_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("commits.log"))?;

        let mut segment_indices: Vec<u64> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let stripped = name.strip_prefix("segment-")?.strip_suffix(".log")?;
                stripped.parse::<u64>().ok()
            })
            .collect();
        segment_indices.sort_unstable();

        let mut next_id = 0u64;
        let mut recovered = Vec::new();
        let mut segment_bounds = BTreeMap::new();

        for &index in &segment_indices {
            let path = segment_path(dir, index);
            let bytes = fs::read(&path)?;
            let mut cursor = 0usize;
            let mut highest_in_segment = next_id;

            loop {
                if cursor == bytes.len() {
                    break;
                }
                if bytes.len() < cursor + 4 {
                    break; // truncated tail
                }
                let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
                let body_start = cursor + 4;
                let body_end = body_start + len;
                let crc_end = body_end + 4;
                if bytes.len() < crc_end {
                    break; // truncated tail
                }

                let record_bytes = &bytes[body_start..body_end];
                let stored_crc = u32::from_le_bytes(bytes[body_end..crc_end].try_into().unwrap());
                cursor = crc_end;

                let id = next_id;
                next_id += 1;
                highest_in_segment = next_id;

                if record::checksum(record_bytes) != stored_crc {
                    log::warn!("discarding corrupt record {id} in {}: checksum mismatch", path.display());
                    continue;
                }

                match record::decode(record_bytes, path.to_string_lossy().as_ref()) {
                    Ok(item) => {
                        if !committed.contains(&id) {
                            recovered.push((EntryId(id), item));
                        }
                    }
                    Err(DispatchError::UnsupportedRecordVersion { found, expected, .. }) => {
                        log::warn!(
                            "skipping segment {} at record {id}: unsupported record version {found} (expected {expected})",
                            path.display()
                        );
                        break;
                    }
                    Err(error) => {
                        log::warn!("discarding unreadable record {id} in {}: {error}", path.display());
                    }
                }
            }

            segment_bounds.insert(index, (path, highest_in_segment));
        }

        let active_index = segment_indices.last().copied().unwrap_or(0);
        let active_path = segment_path(dir, active_index);
        let active_file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&active_path)?;
        let active_size = active_file.metadata()?.len();

        if !segment_bounds.contains_key(&active_index) {
            segment_bounds.insert(active_index, (active_path.clone(), next_id));
        }

        Ok((
            Self {
                dir: dir.to_path_buf(),
                active: Mutex::new(ActiveSegment {
                    path: active_path,
                    file: active_file,
                    size: active_size,
                    index: active_index,
                }),
                committed: Mutex::new(committed),
                commits_file: Mutex::new(commits_file),
                next_id: AtomicU64::new(next_id),
                segment_bounds: Mutex::new(segment_bounds),
            },
            recovered,
        ))
    }

    /// Append `item`, returning the id it was assigned. The entry starts
    /// uncommitted (pending); call [`Self::commit`] once delivered.
    pub fn append(&self, item: &DispatchItem) -> Result<EntryId, DispatchError> {
        let record_bytes = record::encode(item);
        let crc = record::checksum(&record_bytes);

        let mut frame = Vec::with_capacity(record_bytes.len() + 8);
        frame.extend_from_slice(&(record_bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(&record_bytes);
        frame.extend_from_slice(&crc.to_le_bytes());

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let location = item.location.clone();
        let io_result = (|| -> io::Result<()> {
            let mut active = self.active.lock();
            self.rotate_if_needed(&mut active)?;
            active.file.write_all(&frame)?;
            active.file.flush()?;
            active.size += frame.len() as u64;
            let index = active.index;
            drop(active);
            self.segment_bounds
                .lock()
                .entry(index)
                .and_modify(|(_, highest)| *highest = id + 1)
                .or_insert_with(|| (segment_path(&self.dir, index), id + 1));
            Ok(())
        })();

        io_result.map_err(|e| DispatchError::QueueIoError {
            location,
            details: e.to_string(),
        })?;

        Ok(EntryId(id))
    }

    fn rotate_if_needed(&self, active: &mut ActiveSegment) -> io::Result<()> {
        if active.size < MAX_SEGMENT_BYTES {
            return Ok(());
        }
        let next_index = active.index + 1;
        let path = segment_path(&self.dir, next_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        *active = ActiveSegment {
            path,
            file,
            size: 0,
            index: next_index,
        };
        Ok(())
    }

    /// Mark `id` committed and reclaim any fully-committed, non-active
    /// segment files.
    pub fn commit(&self, id: EntryId) -> Result<(), DispatchError> {
        {
            let mut commits_file = self.commits_file.lock();
            commits_file
                .write_all(&id.0.to_le_bytes())
                .and_then(|_| commits_file.flush())
                .map_err(|e| DispatchError::QueueIoError {
                    location: self.dir.to_string_lossy().to_string(),
                    details: e.to_string(),
                })?;
        }
        self.committed.lock().insert(id.0);
        self.reclaim();
        Ok(())
    }

    fn reclaim(&self) {
        let active_index = self.active.lock().index;
        let committed = self.committed.lock();
        let mut bounds = self.segment_bounds.lock();

        let reclaimable: Vec<u64> = bounds
            .iter()
            .filter(|(&index, (_, highest))| {
                index != active_index && (0..*highest).all(|id| committed.contains(&id))
            })
            .map(|(&index, _)| index)
            .collect();

        for index in reclaimable {
            if let Some((path, _)) = bounds.remove(&index) {
                if let Err(error) = fs::remove_file(&path) {
                    log::warn!("failed to reclaim segment {}: {error}", path.display());
                }
            }
        }
    }

    /// Flush and close the active segment and the commits file.
    pub fn close(&self) {
        let _ = self.active.lock().file.sync_all();
        let _ = self.commits_file.lock().sync_all();
    }

    /// The directory backing this log, used for the descriptor path and for
    /// deleting the whole queue on `remove`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn load_commits(dir: &Path) -> io::Result<HashSet<u64>> {
    let path = dir.join("commits.log");
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let mut bytes = Vec::new();
    File::open(&path)?.read_to_end(&mut bytes)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}
