//! Append-only JSONL transcript with signed checkpoints.
//!
//! At each turn boundary the writer signs the existing file prefix
//! (`byte_offset` = current file size) and appends a `checkpoint` event
//! carrying the hash and signature. Verification recomputes the hash of
//! bytes `[0, byte_offset)` per checkpoint and checks the signature against
//! the trust store. Concurrent appends from sibling threads writing to a
//! shared channel transcript serialize through a `.lock` file around the
//! checkpoint write.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::warn;

use crate::error::Result;
use crate::error::RyeErr;
use crate::signing::Keypair;
use crate::signing::sha256_hex;
use crate::signing::verify_hash_signature;
use rye_protocol::CheckpointPayload;
use rye_protocol::EventType;
use rye_protocol::TranscriptEvent;

const TRANSCRIPT_FILE: &str = "transcript.jsonl";

const CHECKPOINT_TS_FORMAT: &[FormatItem] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// Outcome of transcript verification.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptVerification {
    pub valid: bool,
    pub checkpoints: usize,
    pub error: Option<String>,
    pub failed_at_turn: Option<u64>,
    pub unsigned_trailing_bytes: Option<u64>,
}

impl TranscriptVerification {
    fn ok(checkpoints: usize) -> Self {
        Self {
            valid: true,
            checkpoints,
            error: None,
            failed_at_turn: None,
            unsigned_trailing_bytes: None,
        }
    }

    fn fail(checkpoints: usize, turn: u64, error: String) -> Self {
        Self {
            valid: false,
            checkpoints,
            error: Some(error),
            failed_at_turn: Some(turn),
            unsigned_trailing_bytes: None,
        }
    }
}

pub struct TranscriptWriter {
    thread_id: String,
    jsonl_path: PathBuf,
    lock_path: PathBuf,
}

impl TranscriptWriter {
    pub fn new(thread_id: impl Into<String>, thread_dir: &Path) -> Self {
        Self {
            thread_id: thread_id.into(),
            jsonl_path: thread_dir.join(TRANSCRIPT_FILE),
            lock_path: thread_dir.join(format!("{TRANSCRIPT_FILE}.lock")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.jsonl_path
    }

    fn unix_now() -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Append one event. Events within one transcript are strictly
    /// monotonic in file offset.
    pub fn write_event(&self, event_type: EventType, payload: Value) -> Result<()> {
        let event = TranscriptEvent {
            timestamp: Self::unix_now(),
            thread_id: self.thread_id.clone(),
            event_type,
            payload,
        };
        self.append_line(&serde_json::to_string(&event)?)
    }

    fn append_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.jsonl_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.jsonl_path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Sign the transcript up to its current size and append the
    /// checkpoint event. Takes the file lock so siblings sharing a channel
    /// transcript cannot interleave inside the sign-then-append window.
    pub fn checkpoint(&self, turn: u64, keypair: &Keypair) -> Result<()> {
        if !self.jsonl_path.exists() {
            return Ok(());
        }
        let _lock = FileLock::acquire(&self.lock_path)?;

        let content = std::fs::read(&self.jsonl_path)?;
        let byte_offset = content.len() as u64;
        let hash = sha256_hex(&content);
        let sig = keypair.sign_hash(&hash);
        let ts = OffsetDateTime::now_utc()
            .format(CHECKPOINT_TS_FORMAT)
            .map_err(|e| RyeErr::Configuration(format!("cannot format timestamp: {e}")))?;

        let payload = CheckpointPayload {
            turn,
            byte_offset,
            hash,
            sig,
            fp: keypair.fingerprint().to_string(),
            ts,
        };
        self.write_event(EventType::Checkpoint, serde_json::to_value(&payload)?)
    }

    /// Verify every checkpoint in order. Unsigned trailing bytes after the
    /// last checkpoint are rejected unless `allow_unsigned_trailing` (used
    /// when resuming a paused conversation mid-turn).
    pub fn verify(
        &self,
        lookup_key: impl Fn(&str) -> Option<String>,
        allow_unsigned_trailing: bool,
    ) -> Result<TranscriptVerification> {
        if !self.jsonl_path.exists() {
            return Ok(TranscriptVerification::ok(0));
        }
        let content = std::fs::read(&self.jsonl_path)?;

        let mut checkpoints: Vec<CheckpointPayload> = Vec::new();
        for line in String::from_utf8_lossy(&content).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<TranscriptEvent>(line) else {
                continue;
            };
            if event.event_type == EventType::Checkpoint {
                if let Ok(payload) = serde_json::from_value::<CheckpointPayload>(event.payload) {
                    checkpoints.push(payload);
                }
            }
        }
        if checkpoints.is_empty() {
            return Ok(TranscriptVerification::ok(0));
        }

        for cp in &checkpoints {
            let end = cp.byte_offset as usize;
            if end > content.len() {
                return Ok(TranscriptVerification::fail(
                    checkpoints.len(),
                    cp.turn,
                    format!("checkpoint offset {end} beyond transcript length"),
                ));
            }
            let actual_hash = sha256_hex(&content[..end]);
            if actual_hash != cp.hash {
                return Ok(TranscriptVerification::fail(
                    checkpoints.len(),
                    cp.turn,
                    format!("content hash mismatch at turn {}", cp.turn),
                ));
            }
            let Some(pem) = lookup_key(&cp.fp) else {
                return Ok(TranscriptVerification::fail(
                    checkpoints.len(),
                    cp.turn,
                    format!("untrusted signing key {} at turn {}", cp.fp, cp.turn),
                ));
            };
            if !verify_hash_signature(&cp.hash, &cp.sig, &pem) {
                return Ok(TranscriptVerification::fail(
                    checkpoints.len(),
                    cp.turn,
                    format!("signature verification failed at turn {}", cp.turn),
                ));
            }
        }

        // The last checkpoint line itself ends somewhere after its
        // byte_offset; anything beyond that line is unsigned trailing data.
        let last = &checkpoints[checkpoints.len() - 1];
        let line_end = content[last.byte_offset as usize..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|p| last.byte_offset as usize + p + 1);
        if let Some(line_end) = line_end {
            if line_end < content.len() {
                let trailing = (content.len() - line_end) as u64;
                if !allow_unsigned_trailing {
                    let mut result = TranscriptVerification::fail(
                        checkpoints.len(),
                        last.turn,
                        format!(
                            "unsigned content after last checkpoint ({trailing} bytes after turn {})",
                            last.turn
                        ),
                    );
                    result.unsigned_trailing_bytes = Some(trailing);
                    return Ok(result);
                }
                warn!(
                    trailing,
                    turn = last.turn,
                    "unsigned trailing content after last checkpoint"
                );
            }
        }

        Ok(TranscriptVerification::ok(checkpoints.len()))
    }

    /// Re-parse all events from disk. Full replay reads the file; the
    /// runner itself only retains a rolling window in memory.
    pub fn read_events(&self) -> Result<Vec<TranscriptEvent>> {
        if !self.jsonl_path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.jsonl_path)?;
        let mut events = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("skipping malformed transcript line: {e}"),
            }
        }
        Ok(events)
    }
}

/// Exclusive advisory lock via `create_new`. Stale locks are broken after
/// a bounded wait so a crashed sibling cannot wedge the channel.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<FileLock> {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(FileLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() > deadline {
                        warn!(path = %path.display(), "breaking stale transcript lock");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
