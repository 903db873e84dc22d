//! Lockfiles pin a resolved chain with per-element integrity hashes.
//!
//! Read precedence is project → user → system; writes always land in the
//! current project (or the user space when there is no project), regardless
//! of the resolved tool's origin space. Signing a tool rewrites its
//! signature line, changing its hash, so the signer deletes the tool's
//! lockfile to force re-resolution.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;
use tracing::warn;

use crate::config::Config;
use crate::config::ensure_parent_directory;
use crate::error::Result;
use crate::error::RyeErr;
use crate::metadata::ChainElement;

const LOCKFILES_DIR: &str = "lockfiles";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockfileRoot {
    pub tool_id: String,
    pub version: String,
    pub integrity_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedElement {
    pub item_id: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,
    pub space: String,
    pub integrity_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lockfile {
    pub version: u32,
    pub generated_at: String,
    pub root: LockfileRoot,
    pub resolved_chain: Vec<LockedElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_deps: Option<serde_json::Value>,
}

impl Lockfile {
    /// Pin a freshly resolved chain. `chain[0]` is the root tool.
    pub fn from_chain(chain: &[ChainElement]) -> Option<Lockfile> {
        let root = chain.first()?;
        Some(Lockfile {
            version: 1,
            generated_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            root: LockfileRoot {
                tool_id: root.item_id.clone(),
                version: root.metadata.version.clone(),
                integrity_hash: root.integrity_hash.clone(),
            },
            resolved_chain: chain
                .iter()
                .map(|e| LockedElement {
                    item_id: e.item_id.clone(),
                    version: e.metadata.version.clone(),
                    executor_id: e.metadata.executor_id.clone(),
                    space: e.space.label(),
                    integrity_hash: e.integrity_hash.clone(),
                })
                .collect(),
            registry_metadata: None,
            verified_deps: None,
        })
    }

    /// Compare on-disk hashes against the pinned chain. Any mismatch is a
    /// hard integrity failure.
    pub fn verify_against(&self, chain: &[ChainElement]) -> Result<()> {
        for locked in &self.resolved_chain {
            let Some(current) = chain.iter().find(|e| e.item_id == locked.item_id) else {
                return Err(RyeErr::Integrity(format!(
                    "lockfile pins '{}' which is no longer in the chain",
                    locked.item_id
                )));
            };
            if current.integrity_hash != locked.integrity_hash {
                return Err(RyeErr::Integrity(format!(
                    "lockfile hash mismatch for '{}': expected {}, found {}",
                    locked.item_id, locked.integrity_hash, current.integrity_hash
                )));
            }
        }
        Ok(())
    }
}

fn lockfile_name(tool_id: &str, version: &str) -> String {
    format!("{tool_id}@{version}.lock.json")
}

pub struct LockfileResolver<'a> {
    config: &'a Config,
}

impl<'a> LockfileResolver<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn read_candidates(&self, tool_id: &str, version: &str) -> Vec<PathBuf> {
        let name = lockfile_name(tool_id, version);
        self.config
            .search_ai_dirs()
            .into_iter()
            .map(|(_, ai_dir)| ai_dir.join(LOCKFILES_DIR).join(&name))
            .collect()
    }

    fn write_path(&self, tool_id: &str, version: &str) -> PathBuf {
        self.config
            .writable_ai_dir()
            .join(LOCKFILES_DIR)
            .join(lockfile_name(tool_id, version))
    }

    /// First matching lockfile across the tiers, or `None`. Unparseable
    /// files are skipped with a warning rather than trusted.
    pub fn get(&self, tool_id: &str, version: &str) -> Option<Lockfile> {
        for path in self.read_candidates(tool_id, version) {
            if !path.is_file() {
                continue;
            }
            match load_lockfile(&path) {
                Ok(lockfile) => return Some(lockfile),
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable lockfile: {e}");
                }
            }
        }
        None
    }

    /// Persist a lockfile to the writable tier, signed on line 1.
    pub fn save(&self, lockfile: &Lockfile, keypair: &crate::signing::Keypair) -> Result<PathBuf> {
        let path = self.write_path(&lockfile.root.tool_id, &lockfile.root.version);
        ensure_parent_directory(&path)?;
        let body = serde_json::to_string_pretty(lockfile)?;
        let signer = crate::signing::ItemSigner::new(keypair);
        let signed = signer.sign_content(&path, &body)?;
        std::fs::write(&path, signed)?;
        debug!(path = %path.display(), "lockfile written");
        Ok(path)
    }

    /// Delete from the writable tiers (project, then user). Returns whether
    /// anything was removed. Used when a tool is re-signed.
    pub fn delete(&self, tool_id: &str, version: &str) -> Result<bool> {
        let name = lockfile_name(tool_id, version);
        let mut candidates = Vec::new();
        if let Some(project) = self.config.project_ai_dir() {
            candidates.push(project.join(LOCKFILES_DIR).join(&name));
        }
        candidates.push(self.config.user_ai_dir().join(LOCKFILES_DIR).join(&name));

        for path in candidates {
            if path.is_file() {
                std::fs::remove_file(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn load_lockfile(path: &Path) -> Result<Lockfile> {
    let raw = std::fs::read_to_string(path)?;
    let body: String = raw
        .lines()
        .filter(|line| !line.starts_with("# rye:signed:"))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use crate::metadata::ToolMetadata;
    use crate::signing::Keypair;
    use crate::spaces::Space;
    use pretty_assertions::assert_eq;

    fn element(item_id: &str, hash: &str) -> ChainElement {
        let metadata: ToolMetadata =
            toml::from_str("version = \"1.0.0\"\ntool_type = \"x\"\n").unwrap();
        ChainElement {
            item_id: item_id.to_string(),
            space: Space::Project,
            path: PathBuf::from("/dev/null"),
            integrity_hash: hash.to_string(),
            metadata,
        }
    }

    fn setup() -> (tempfile::TempDir, Config, Keypair) {
        let tmp = tempfile::tempdir().unwrap();
        let config =
            Config::with_spaces(Some(tmp.path().join("proj")), tmp.path().join("home")).unwrap();
        let keypair = Keypair::ensure(&config.keys_dir()).unwrap();
        (tmp, config, keypair)
    }

    #[test]
    fn save_then_get_round_trips() {
        let (_tmp, config, keypair) = setup();
        let resolver = LockfileResolver::new(&config);
        let chain = vec![element("t", "aaa"), element("r", "bbb")];
        let lockfile = Lockfile::from_chain(&chain).unwrap();
        let path = resolver.save(&lockfile, &keypair).unwrap();
        assert!(path.starts_with(config.project_ai_dir().unwrap()));

        let loaded = resolver.get("t", "1.0.0").unwrap();
        assert_eq!(loaded.resolved_chain.len(), 2);
        loaded.verify_against(&chain).unwrap();
    }

    #[test]
    fn hash_drift_is_integrity_error() {
        let chain = vec![element("t", "aaa")];
        let lockfile = Lockfile::from_chain(&chain).unwrap();
        let drifted = vec![element("t", "changed")];
        let err = lockfile.verify_against(&drifted).unwrap_err();
        assert!(matches!(err, RyeErr::Integrity(_)));
    }

    #[test]
    fn delete_clears_writable_tier() {
        let (_tmp, config, keypair) = setup();
        let resolver = LockfileResolver::new(&config);
        let lockfile = Lockfile::from_chain(&[element("t", "aaa")]).unwrap();
        resolver.save(&lockfile, &keypair).unwrap();
        assert!(resolver.delete("t", "1.0.0").unwrap());
        assert!(resolver.get("t", "1.0.0").is_none());
        assert!(!resolver.delete("t", "1.0.0").unwrap());
    }

    #[test]
    fn writes_to_user_without_project() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::with_spaces(None, tmp.path().join("home")).unwrap();
        let keypair = Keypair::ensure(&config.keys_dir()).unwrap();
        let resolver = LockfileResolver::new(&config);
        let lockfile = Lockfile::from_chain(&[element("t", "aaa")]).unwrap();
        let path = resolver.save(&lockfile, &keypair).unwrap();
        assert!(path.starts_with(config.user_ai_dir()));
    }
}
