//! Thread state persistence: signed `thread.json` metadata and the
//! `state.json` harness snapshot, both written via temp-file-then-rename.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::config::Config;
use crate::error::Result;
use crate::error::RyeErr;
use crate::signing::Keypair;
use crate::signing::sign_json;
use rye_protocol::Cost;
use rye_protocol::Hook;
use rye_protocol::Limits;
use rye_protocol::ThreadMetadata;

const META_FILE: &str = "thread.json";
const STATE_FILE: &str = "state.json";

/// Runtime companion to thread metadata, persisted at every turn boundary
/// so a process restart can resume an interrupted conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessState {
    pub capabilities: Vec<String>,
    pub cost: Cost,
    pub limits: Limits,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default)]
    pub cancelled: bool,
    /// Byte offset of the last signed checkpoint in the transcript.
    #[serde(default)]
    pub transcript_offset: u64,
}

/// Atomic JSON write: temp file in the same directory, then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_sibling(path);
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp_path, body)?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

pub fn save_state(thread_dir: &Path, state: &HarnessState) -> Result<()> {
    write_json_atomic(&thread_dir.join(STATE_FILE), state)
}

pub fn load_state(thread_dir: &Path) -> Result<HarnessState> {
    let path = thread_dir.join(STATE_FILE);
    if !path.is_file() {
        return Err(RyeErr::ThreadNotFound(format!(
            "thread state not found: {}",
            path.display()
        )));
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Persist signed thread metadata.
pub fn save_metadata(thread_dir: &Path, meta: &ThreadMetadata, keypair: &Keypair) -> Result<()> {
    let mut value = serde_json::to_value(meta)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("_signature");
    }
    let signed = sign_json(keypair, &value)?;
    write_json_atomic(&thread_dir.join(META_FILE), &signed)
}

pub fn load_metadata(thread_dir: &Path) -> Result<ThreadMetadata> {
    let path = thread_dir.join(META_FILE);
    if !path.is_file() {
        return Err(RyeErr::ThreadNotFound(format!(
            "thread metadata not found: {}",
            path.display()
        )));
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn thread_dir(config: &Config, thread_id: &str) -> PathBuf {
    config.thread_dir(thread_id)
}
