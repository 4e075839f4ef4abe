//! Write-back journal
//!
//! An append-only, segmented log of committed mutations that have not yet
//! reached the backend. Appends are synchronous with the local write path;
//! the backend flush is asynchronous. After a crash the journal is replayed
//! in sequence order and each record is re-applied only if it is newer than
//! the state already present, so replay is idempotent.
//!
//! # On-disk layout
//!
//! The journal is a directory of segment files named after the sequence
//! number of their first record (`00000000000000000001.seg`). Each record is
//! a frame (see [`frame`]) holding a bincode-encoded [`JournalRecord`].
//! Segments rotate once they exceed the configured size and are deleted as a
//! whole by [`Journal::truncate_before`].

mod frame;
mod record;

pub use record::{JournalRecord, Mutation, MutationOp, VersionBump};

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::JournalConfig;
use crate::error::{FsError, Result};
use frame::Frame;
use record::JournalRecordRef;

const SEGMENT_EXT: &str = "seg";

/// Destination for committed mutations.
///
/// The metadata index hands every mutation to its sink before applying it;
/// a sink error aborts the mutation.
pub trait MutationSink: std::fmt::Debug + Send + Sync {
    /// Durably record `mutation`, returning its sequence number.
    fn commit(&self, mutation: &Mutation) -> Result<u64>;
}

#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    config: JournalConfig,
    active: Mutex<Active>,
}

#[derive(Debug)]
struct Active {
    file: File,
    path: PathBuf,
    start_seq: u64,
    len: u64,
    next_seq: u64,
    /// First sequence number of each sealed segment
    sealed: BTreeMap<u64, PathBuf>,
}

impl Journal {
    /// Open the journal in `dir`, creating it if needed.
    ///
    /// The newest segment is scanned to find the next sequence number. A
    /// frame cut short at its tail is a torn append that was never
    /// acknowledged and is discarded; a frame with a bad checksum is
    /// corruption and fails the open.
    pub fn open(dir: impl AsRef<Path>, config: JournalConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| FsError::Journal(format!("{}: {}", dir.display(), e)))?;

        let mut segments = list_segments(&dir)?;
        let (start_seq, path) = match segments.pop_last() {
            Some(last) => last,
            None => (1, segment_path(&dir, 1)),
        };

        let (len, next_seq) = if path.exists() {
            recover_tail(&path, start_seq)?
        } else {
            (0, start_seq)
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| FsError::Journal(format!("{}: {}", path.display(), e)))?;

        info!(
            dir = %dir.display(),
            segments = segments.len() + 1,
            next_seq = next_seq,
            "journal opened"
        );

        Ok(Self {
            dir,
            config,
            active: Mutex::new(Active {
                file,
                path,
                start_seq,
                len,
                next_seq,
                sealed: segments,
            }),
        })
    }

    /// Append `mutation`, returning its sequence number.
    pub fn append(&self, mutation: &Mutation) -> Result<u64> {
        let mut active = self.active.lock();
        let seq = active.next_seq;
        let payload = bincode::serialize(&JournalRecordRef { seq, mutation })
            .map_err(|e| FsError::Journal(format!("encode record {}: {}", seq, e)))?;
        let bytes = frame::encode(&payload);

        if let Err(e) = active.file.write_all(&bytes) {
            // cut the partial frame so later appends stay readable
            let len = active.len;
            if let Err(trim) = active.file.set_len(len) {
                warn!(
                    segment = %active.path.display(),
                    len = len,
                    error = %trim,
                    "failed to cut partial journal record"
                );
            }
            return Err(FsError::Journal(format!("append record {}: {}", seq, e)));
        }
        if self.config.sync {
            active
                .file
                .sync_data()
                .map_err(|e| FsError::Journal(format!("sync record {}: {}", seq, e)))?;
        }
        active.len += bytes.len() as u64;
        active.next_seq += 1;

        if active.len >= self.config.segment_bytes {
            self.rotate(&mut active)?;
        }
        Ok(seq)
    }

    /// Lazily replay every record with `seq >= from`, in order.
    pub fn replay_from(&self, from: u64) -> Result<Replay> {
        let active = self.active.lock();
        let mut starts: Vec<(u64, PathBuf)> = active
            .sealed
            .iter()
            .map(|(start, path)| (*start, path.clone()))
            .collect();
        starts.push((active.start_seq, active.path.clone()));

        // skip segments that end before `from`
        let mut segments = VecDeque::new();
        for (i, (_, path)) in starts.iter().enumerate() {
            let ends_before = starts
                .get(i + 1)
                .map(|(next_start, _)| *next_start <= from)
                .unwrap_or(false);
            if !ends_before {
                segments.push_back(path.clone());
            }
        }

        Ok(Replay {
            segments,
            current: None,
            from,
            failed: false,
        })
    }

    /// Drop every segment whose records all precede `seq`.
    pub fn truncate_before(&self, seq: u64) -> Result<usize> {
        let mut active = self.active.lock();

        if active.len > 0 && active.next_seq <= seq {
            self.rotate(&mut active)?;
        }

        let mut removable = Vec::new();
        let starts: Vec<u64> = active.sealed.keys().copied().collect();
        for (i, start) in starts.iter().enumerate() {
            let next_start = starts.get(i + 1).copied().unwrap_or(active.start_seq);
            if next_start <= seq {
                removable.push(*start);
            }
        }

        for start in &removable {
            if let Some(path) = active.sealed.remove(start) {
                fs::remove_file(&path)
                    .map_err(|e| FsError::Journal(format!("{}: {}", path.display(), e)))?;
                debug!(segment = %path.display(), "pruned journal segment");
            }
        }
        Ok(removable.len())
    }

    /* Getters */

    pub fn next_seq(&self) -> u64 {
        self.active.lock().next_seq
    }

    pub fn segment_count(&self) -> usize {
        self.active.lock().sealed.len() + 1
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn rotate(&self, active: &mut Active) -> Result<()> {
        let start = active.next_seq;
        let path = segment_path(&self.dir, start);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| FsError::Journal(format!("{}: {}", path.display(), e)))?;

        let sealed_path = std::mem::replace(&mut active.path, path);
        let sealed_start = std::mem::replace(&mut active.start_seq, start);
        active.sealed.insert(sealed_start, sealed_path);
        active.file = file;
        active.len = 0;
        debug!(start_seq = start, "rotated journal segment");
        Ok(())
    }
}

impl MutationSink for Journal {
    fn commit(&self, mutation: &Mutation) -> Result<u64> {
        self.append(mutation)
    }
}

/// Lazy iterator over journal records. Yields an error and stops on the
/// first corrupt record.
#[derive(Debug)]
pub struct Replay {
    segments: VecDeque<PathBuf>,
    current: Option<(PathBuf, BufReader<File>)>,
    from: u64,
    failed: bool,
}

impl Iterator for Replay {
    type Item = Result<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.current.is_none() {
                let path = self.segments.pop_front()?;
                match File::open(&path) {
                    Ok(file) => self.current = Some((path, BufReader::new(file))),
                    Err(e) => return Some(Err(self.fail(&path, &e.to_string()))),
                }
            }
            let (path, reader) = self.current.as_mut()?;
            let path = path.clone();

            let frame = match frame::read_frame(reader) {
                Ok(frame) => frame,
                Err(e) => return Some(Err(self.fail(&path, &e.to_string()))),
            };
            match frame {
                Frame::Complete(payload) => match bincode::deserialize::<JournalRecord>(&payload)
                {
                    Ok(record) if record.seq < self.from => continue,
                    Ok(record) => return Some(Ok(record)),
                    Err(e) => return Some(Err(self.fail(&path, &e.to_string()))),
                },
                Frame::End => self.current = None,
                Frame::Torn if self.segments.is_empty() => {
                    warn!(segment = %path.display(), "journal ends in a partial record");
                    self.current = None;
                    return None;
                }
                Frame::Torn => {
                    return Some(Err(self.fail(&path, "partial record in sealed segment")))
                }
                Frame::Corrupt => return Some(Err(self.fail(&path, "checksum mismatch"))),
            }
        }
    }
}

impl Replay {
    fn fail(&mut self, path: &Path, detail: &str) -> FsError {
        self.failed = true;
        self.current = None;
        FsError::Journal(format!("corrupt journal segment {}: {}", path.display(), detail))
    }
}

fn segment_path(dir: &Path, start: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", start, SEGMENT_EXT))
}

fn list_segments(dir: &Path) -> Result<BTreeMap<u64, PathBuf>> {
    let mut segments = BTreeMap::new();
    let entries =
        fs::read_dir(dir).map_err(|e| FsError::Journal(format!("{}: {}", dir.display(), e)))?;
    for entry in entries {
        let path = entry
            .map_err(|e| FsError::Journal(format!("{}: {}", dir.display(), e)))?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        let start = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        match start {
            Some(start) => {
                segments.insert(start, path);
            }
            None => warn!(path = %path.display(), "ignoring unrecognised journal file"),
        }
    }
    Ok(segments)
}

/// Scan the newest segment, cutting a torn tail. Returns the valid length
/// and the next sequence number.
fn recover_tail(path: &Path, start_seq: u64) -> Result<(u64, u64)> {
    let err = |detail: String| FsError::Journal(format!("{}: {}", path.display(), detail));

    let file = File::open(path).map_err(|e| err(e.to_string()))?;
    let mut reader = BufReader::new(file);
    let mut valid_len = 0u64;
    let mut next_seq = start_seq;

    loop {
        match frame::read_frame(&mut reader).map_err(|e| err(e.to_string()))? {
            Frame::Complete(payload) => {
                let record: JournalRecord = bincode::deserialize(&payload)
                    .map_err(|e| err(format!("undecodable record: {}", e)))?;
                next_seq = record.seq + 1;
                valid_len += (frame::HEADER_LEN + payload.len()) as u64;
            }
            Frame::End => break,
            Frame::Torn => {
                warn!(
                    segment = %path.display(),
                    valid_len = valid_len,
                    "discarding partial record at journal tail"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| err(e.to_string()))?;
                file.set_len(valid_len).map_err(|e| err(e.to_string()))?;
                break;
            }
            Frame::Corrupt => {
                return Err(err(format!("checksum mismatch at offset {}", valid_len)));
            }
        }
    }

    Ok((valid_len, next_seq))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::types::InodeId;

    fn write(inode: u64, pre: u64, data: &[u8]) -> Mutation {
        Mutation::new(
            VersionBump::next(InodeId(inode), pre),
            Utc::now(),
            MutationOp::Write {
                offset: 0,
                data: data.to_vec(),
                new_size: data.len() as u64,
            },
        )
    }

    fn config(segment_bytes: u64) -> JournalConfig {
        JournalConfig {
            segment_bytes,
            sync: false,
        }
    }

    #[test]
    fn test_append_and_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), config(1 << 20)).unwrap();
        for i in 0..5u64 {
            assert_eq!(journal.append(&write(2, i, &[i as u8; 16])).unwrap(), i + 1);
        }

        let seqs: Vec<u64> = journal
            .replay_from(3)
            .unwrap()
            .map(|r| r.unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = TempDir::new().unwrap();
        {
            let journal = Journal::open(dir.path(), config(1 << 20)).unwrap();
            journal.append(&write(2, 0, b"a")).unwrap();
            journal.append(&write(2, 1, b"b")).unwrap();
        }
        let journal = Journal::open(dir.path(), config(1 << 20)).unwrap();
        assert_eq!(journal.next_seq(), 3);
        assert_eq!(journal.append(&write(2, 2, b"c")).unwrap(), 3);
        assert_eq!(journal.replay_from(0).unwrap().count(), 3);
    }

    #[test]
    fn test_rotation_and_truncate() {
        let dir = TempDir::new().unwrap();
        // every record overflows the segment
        let journal = Journal::open(dir.path(), config(16)).unwrap();
        for i in 0..4u64 {
            journal.append(&write(2, i, b"0123456789")).unwrap();
        }
        assert_eq!(journal.segment_count(), 5);

        let removed = journal.truncate_before(3).unwrap();
        assert_eq!(removed, 2);
        let seqs: Vec<u64> = journal
            .replay_from(0)
            .unwrap()
            .map(|r| r.unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn test_truncate_everything_rotates_active_segment() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), config(1 << 20)).unwrap();
        journal.append(&write(2, 0, b"a")).unwrap();
        journal.append(&write(2, 1, b"b")).unwrap();

        journal.truncate_before(journal.next_seq()).unwrap();
        assert_eq!(journal.replay_from(0).unwrap().count(), 0);
        assert_eq!(journal.segment_count(), 1);
        assert_eq!(journal.append(&write(2, 2, b"c")).unwrap(), 3);
    }

    #[test]
    fn test_failed_append_leaves_journal_usable() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), config(1 << 20)).unwrap();
        assert_eq!(journal.append(&write(2, 0, b"first")).unwrap(), 1);

        // a handle that can neither write nor cut the segment
        let path = journal.active.lock().path.clone();
        let read_only = File::open(&path).unwrap();
        let writable = std::mem::replace(&mut journal.active.lock().file, read_only);
        let err = journal.append(&write(2, 1, b"lost")).unwrap_err();
        assert!(matches!(err, FsError::Journal(_)));
        assert_eq!(journal.next_seq(), 2);

        journal.active.lock().file = writable;
        assert_eq!(journal.append(&write(2, 1, b"kept")).unwrap(), 2);
        let seqs: Vec<u64> = journal
            .replay_from(0)
            .unwrap()
            .map(|r| r.unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_torn_tail_is_cut_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let journal = Journal::open(dir.path(), config(1 << 20)).unwrap();
            journal.append(&write(2, 0, b"kept")).unwrap();
        }
        let segment = segment_path(dir.path(), 1);
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let journal = Journal::open(dir.path(), config(1 << 20)).unwrap();
        assert_eq!(journal.next_seq(), 2);
        let records: Vec<_> = journal.replay_from(0).unwrap().collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_ok());
    }

    #[test]
    fn test_corrupt_record_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let journal = Journal::open(dir.path(), config(1 << 20)).unwrap();
            journal.append(&write(2, 0, b"first")).unwrap();
            journal.append(&write(2, 1, b"second")).unwrap();
        }
        let segment = segment_path(dir.path(), 1);
        let mut bytes = fs::read(&segment).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&segment, bytes).unwrap();

        let err = Journal::open(dir.path(), config(1 << 20)).unwrap_err();
        assert!(matches!(err, FsError::Journal(_)));
    }

    #[test]
    fn test_corruption_in_sealed_segment_surfaces_on_replay() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), config(16)).unwrap();
        journal.append(&write(2, 0, b"0123456789")).unwrap();
        journal.append(&write(2, 1, b"0123456789")).unwrap();

        let segment = segment_path(dir.path(), 1);
        let mut bytes = fs::read(&segment).unwrap();
        bytes[10] ^= 0xff;
        fs::write(&segment, bytes).unwrap();

        let mut replay = journal.replay_from(0).unwrap();
        assert!(matches!(replay.next(), Some(Err(FsError::Journal(_)))));
        assert!(replay.next().is_none());
    }
}
