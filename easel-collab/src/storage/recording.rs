//! Session recordings: an append-only file of every committed message.
//!
//! File layout:
//! ```text
//! ┌────────────┬─────────┬──────────────────────────────────────────┐
//! │ "EASELREC" │ version │ record | record | record | ...          │
//! │ 8 bytes    │ u16 BE  │                                          │
//! └────────────┴─────────┴──────────────────────────────────────────┘
//!
//! record = u32 BE length ‖ lz4(bincode(RecordEntry))
//! ```
//!
//! Writes go through a dedicated blocking writer so that committing a message
//! never waits on the filesystem. The writer flushes every `FLUSH_EVERY`
//! records and on shutdown.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::protocol::MAX_MESSAGE_SIZE;

const MAGIC: &[u8; 8] = b"EASELREC";
const VERSION: u16 = 1;
const FLUSH_EVERY: usize = 64;
/// Upper bound on the bincode header fields of a [`RecordEntry`].
const ENTRY_OVERHEAD: usize = 64;

/// Longest on-disk record a valid writer can produce.
fn max_record_len() -> usize {
    4 + lz4_flex::block::get_maximum_output_size(MAX_MESSAGE_SIZE + ENTRY_OVERHEAD)
}

/// Default file name used when the recording pattern names a directory.
pub const DEFAULT_FILE_PATTERN: &str = "%d %t session %i.easelrec";

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a recording file")]
    BadMagic,

    #[error("unsupported recording version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("checksum mismatch at sequence {sequence}")]
    ChecksumMismatch { sequence: u64 },

    #[error("recording writer has stopped")]
    Closed,
}

/// One committed message as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Position in the session's committed log
    pub sequence: u64,
    /// Commit time, milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Encoded protocol message
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl RecordEntry {
    pub fn new(sequence: u64, timestamp_ms: i64, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(sequence, timestamp_ms, &payload);
        Self {
            sequence,
            timestamp_ms,
            payload,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.timestamp_ms, &self.payload)
    }

    /// FNV-1a over the header fields, then the payload in 4-byte words.
    fn compute_checksum(sequence: u64, timestamp_ms: i64, payload: &[u8]) -> u32 {
        const PRIME: u32 = 0x0100_0193;
        let mut hash: u32 = 0x811c_9dc5;
        for word in [
            sequence as u32,
            (sequence >> 32) as u32,
            timestamp_ms as u32,
            (timestamp_ms >> 32) as u32,
        ] {
            hash ^= word;
            hash = hash.wrapping_mul(PRIME);
        }
        for chunk in payload.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            hash ^= u32::from_le_bytes(word);
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }

    fn encode(&self) -> Result<Vec<u8>, RecordingError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RecordingError::Corrupt(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordingError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| RecordingError::Corrupt(e.to_string()))?;
        let (entry, _): (Self, _) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| RecordingError::Corrupt(e.to_string()))?;
        Ok(entry)
    }
}

/// Expand a recording path pattern for a new session.
///
/// Placeholders: leading `~/` (home directory), `%d` (date, YYYY-MM-DD),
/// `%t` (time, HH.MM.SS), `%i` (session id), `%a` (alias, or id if none).
/// A pattern naming an existing directory (or ending in `/`) gets
/// [`DEFAULT_FILE_PATTERN`] appended. If the result already exists, a
/// numeric suffix is inserted before the extension.
pub fn expand_pattern(
    pattern: &str,
    session_id: Uuid,
    alias: Option<&str>,
    now: DateTime<Local>,
) -> PathBuf {
    let mut pattern = pattern.to_string();
    if let Some(rest) = pattern.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        pattern = format!("{}/{}", home.trim_end_matches('/'), rest);
    }

    let mut path = PathBuf::from(&pattern);
    if pattern.ends_with('/') || path.is_dir() {
        path = path.join(DEFAULT_FILE_PATTERN);
    }

    let id = session_id.to_string();
    let expanded = path
        .to_string_lossy()
        .replace("%d", &now.format("%Y-%m-%d").to_string())
        .replace("%t", &now.format("%H.%M.%S").to_string())
        .replace("%i", &id)
        .replace("%a", alias.filter(|a| !a.is_empty()).unwrap_or(&id));

    unique_path(PathBuf::from(expanded))
}

fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (1u32..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{stem}-{n}.{ext}"),
                None => format!("{stem}-{n}"),
            };
            path.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

enum WriterCommand {
    Record { sequence: u64, frame: Frame },
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Handle to a session's recording file. Dropping every handle stops the
/// writer after it has flushed what it received.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<WriterCommand>,
    path: PathBuf,
}

impl std::fmt::Debug for WriterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record { sequence, .. } => write!(f, "Record({sequence})"),
            Self::Flush(_) => write!(f, "Flush"),
        }
    }
}

impl RecordingSink {
    /// Create the file, write the header, and start the writer thread.
    /// Must be called from within a tokio runtime. Does blocking file I/O.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, RecordingError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_be_bytes())?;
        writer.flush()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task_path = path.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = run_writer(writer, rx) {
                log::error!("Recording {} stopped: {e}", task_path.display());
            }
        });

        log::info!("Recording session to {}", path.display());
        Ok(Self { tx, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a committed frame. Never blocks.
    pub fn record(&self, sequence: u64, frame: Frame) -> Result<(), RecordingError> {
        self.tx
            .send(WriterCommand::Record { sequence, frame })
            .map_err(|_| RecordingError::Closed)
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) -> Result<(), RecordingError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(done_tx))
            .map_err(|_| RecordingError::Closed)?;
        done_rx
            .await
            .map_err(|_| RecordingError::Closed)?
            .map_err(|e| RecordingError::Io(std::io::Error::other(e)))
    }
}

fn run_writer(
    mut writer: BufWriter<std::fs::File>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) -> Result<(), RecordingError> {
    let mut unflushed = 0usize;
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            WriterCommand::Record { sequence, frame } => {
                let entry = RecordEntry::new(sequence, Utc::now().timestamp_millis(), frame.to_vec());
                let bytes = entry.encode()?;
                writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
                writer.write_all(&bytes)?;
                unflushed += 1;
                if unflushed >= FLUSH_EVERY {
                    writer.flush()?;
                    unflushed = 0;
                }
            }
            WriterCommand::Flush(done) => {
                let result = writer.flush().map_err(|e| e.to_string());
                unflushed = 0;
                let _ = done.send(result);
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Sequential reader over a recording file.
pub struct RecordingReader<R> {
    inner: R,
}

impl RecordingReader<std::io::BufReader<std::fs::File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let file = std::fs::File::open(path)?;
        Self::new(std::io::BufReader::new(file))
    }
}

impl<R: Read> RecordingReader<R> {
    /// Validate the header and position at the first record.
    pub fn new(mut inner: R) -> Result<Self, RecordingError> {
        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(RecordingError::BadMagic);
        }
        let mut version = [0u8; 2];
        inner.read_exact(&mut version)?;
        let version = u16::from_be_bytes(version);
        if version != VERSION {
            return Err(RecordingError::UnsupportedVersion(version));
        }
        Ok(Self { inner })
    }

    /// Next verified record, or `None` at a clean end of file.
    pub fn next_entry(&mut self) -> Result<Option<RecordEntry>, RecordingError> {
        let mut len = [0u8; 4];
        match self.inner.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len) as usize;
        if len > max_record_len() {
            return Err(RecordingError::Corrupt(format!("record length {len} out of range")));
        }
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| RecordingError::Corrupt("truncated record".into()))?;
        let entry = RecordEntry::decode(&buf)?;
        if !entry.verify() {
            return Err(RecordingError::ChecksumMismatch {
                sequence: entry.sequence,
            });
        }
        Ok(Some(entry))
    }

    /// Read every remaining record.
    pub fn read_all(&mut self) -> Result<Vec<RecordEntry>, RecordingError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn test_entry_checksum() {
        let entry = RecordEntry::new(3, 1_700_000_000_000, vec![1, 2, 3, 4, 5]);
        assert!(entry.verify());
        let mut tampered = entry.clone();
        tampered.payload[0] = 9;
        assert!(!tampered.verify());
    }

    #[test]
    fn test_expand_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let pattern = format!("{}/%a-%d-%t-%i.rec", dir.path().display());
        let path = expand_pattern(&pattern, id, Some("studio"), fixed_time());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("studio-2024-03-09-14.05.07-{id}.rec"));
    }

    #[test]
    fn test_expand_alias_falls_back_to_id() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let pattern = format!("{}/%a.rec", dir.path().display());
        let path = expand_pattern(&pattern, id, None, fixed_time());
        assert_eq!(path, dir.path().join(format!("{id}.rec")));
    }

    #[test]
    fn test_expand_directory_uses_default_name() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let path = expand_pattern(&dir.path().to_string_lossy(), id, None, fixed_time());
        assert_eq!(
            path,
            dir.path().join(format!("2024-03-09 14.05.07 session {id}.easelrec"))
        );
    }

    #[test]
    fn test_expand_adds_suffix_when_taken() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("s.rec"), b"").unwrap();
        std::fs::write(dir.path().join("s-1.rec"), b"").unwrap();
        let pattern = format!("{}/s.rec", dir.path().display());
        let path = expand_pattern(&pattern, Uuid::nil(), None, fixed_time());
        assert_eq!(path, dir.path().join("s-2.rec"));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("a.easelrec");
        let sink = RecordingSink::create(&path).unwrap();
        for seq in 0..100u64 {
            sink.record(seq, Arc::new(vec![seq as u8; 32])).unwrap();
        }
        sink.flush().await.unwrap();

        let entries = RecordingReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(entries.len(), 100);
        assert!(entries.iter().enumerate().all(|(i, e)| e.sequence == i as u64));
        assert_eq!(entries[7].payload, vec![7u8; 32]);
    }

    #[tokio::test]
    async fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.easelrec");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            RecordingSink::create(&path),
            Err(RecordingError::Io(_))
        ));
    }

    #[test]
    fn test_reader_rejects_bad_magic() {
        let bytes = b"NOTAREC!\x00\x01".to_vec();
        assert!(matches!(
            RecordingReader::new(std::io::Cursor::new(bytes)),
            Err(RecordingError::BadMagic)
        ));
    }

    #[test]
    fn test_reader_detects_corruption() {
        let entry = RecordEntry::new(0, 0, vec![1, 2, 3]);
        let mut bad = entry.clone();
        bad.checksum ^= 1;
        let body = bad.encode().unwrap();

        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&VERSION.to_be_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&body);

        let mut reader = RecordingReader::new(std::io::Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.next_entry(),
            Err(RecordingError::ChecksumMismatch { sequence: 0 })
        ));
    }

    #[test]
    fn test_reader_rejects_impossible_length() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&VERSION.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());

        let mut reader = RecordingReader::new(std::io::Cursor::new(bytes)).unwrap();
        assert!(matches!(reader.next_entry(), Err(RecordingError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_largest_message_fits_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.easelrec");
        let sink = RecordingSink::create(&path).unwrap();
        sink.record(0, Arc::new(vec![0xa5; MAX_MESSAGE_SIZE])).unwrap();
        sink.flush().await.unwrap();

        let entries = RecordingReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(entries[0].payload.len(), MAX_MESSAGE_SIZE);
    }
}
