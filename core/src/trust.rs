//! Identity-aware trust store for Ed25519 public keys.
//!
//! Trusted keys are signed TOML identity documents binding a key to an
//! owner. They follow the standard three-tier resolution: project → user →
//! system bundles, first match wins.
//!
//! ```text
//! # rye:signed:TS:HASH:SIG:FP
//! fingerprint = "16e73c5829f69d6f"
//! owner = "leo"
//! attestation = ""
//!
//! [public_key]
//! pem = """
//! -----BEGIN PUBLIC KEY-----
//! ...
//! """
//! ```

use std::path::PathBuf;

use serde::Deserialize;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::signing::Keypair;
use crate::signing::compute_fingerprint;

const TRUSTED_KEYS_DIR: &str = "trusted_keys";

/// A trusted key with identity binding.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustedKeyInfo {
    pub fingerprint: String,
    pub owner: String,
    pub public_key_pem: String,
    pub attestation: Option<String>,
    /// "project", "user", or "system:{bundle_id}".
    pub source: String,
}

#[derive(Deserialize)]
struct TrustedKeyDoc {
    fingerprint: String,
    #[serde(default = "unknown_owner")]
    owner: String,
    #[serde(default)]
    attestation: String,
    public_key: PublicKeyDoc,
}

#[derive(Deserialize)]
struct PublicKeyDoc {
    pem: String,
}

fn unknown_owner() -> String {
    "unknown".to_string()
}

impl TrustedKeyInfo {
    fn to_toml(&self) -> String {
        let pem = self.public_key_pem.trim();
        let attestation = self.attestation.clone().unwrap_or_default();
        format!(
            "fingerprint = \"{}\"\nowner = \"{}\"\nattestation = \"{}\"\n\n[public_key]\npem = \"\"\"\n{}\n\"\"\"\n",
            self.fingerprint, self.owner, attestation, pem
        )
    }

    fn from_toml(raw: &str, source: &str) -> Result<TrustedKeyInfo> {
        // Strip the signature comment before parsing TOML.
        let body: String = raw
            .lines()
            .filter(|line| !line.starts_with("# rye:signed:"))
            .collect::<Vec<_>>()
            .join("\n");
        let doc: TrustedKeyDoc = toml::from_str(&body)?;
        let attestation = if doc.attestation.is_empty() {
            None
        } else {
            Some(doc.attestation)
        };
        Ok(TrustedKeyInfo {
            fingerprint: doc.fingerprint,
            owner: doc.owner,
            public_key_pem: format!("{}\n", doc.public_key.pem.trim()),
            attestation,
            source: source.to_string(),
        })
    }
}

/// Manages trusted Ed25519 public keys with three-tier resolution.
pub struct TrustStore<'a> {
    config: &'a Config,
}

impl<'a> TrustStore<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn search_dirs(&self) -> Vec<(String, PathBuf)> {
        self.config
            .search_ai_dirs()
            .into_iter()
            .map(|(label, ai_dir)| (label, ai_dir.join(TRUSTED_KEYS_DIR)))
            .collect()
    }

    pub fn is_trusted(&self, fingerprint: &str) -> bool {
        self.get_key(fingerprint).is_some()
    }

    /// Get a trusted key by fingerprint, project → user → system. The
    /// fingerprint embedded in the document is cross-checked against the
    /// actual key; a mismatch skips the file.
    pub fn get_key(&self, fingerprint: &str) -> Option<TrustedKeyInfo> {
        for (source, dir) in self.search_dirs() {
            let key_file = dir.join(format!("{fingerprint}.toml"));
            if !key_file.is_file() {
                continue;
            }
            let raw = match std::fs::read_to_string(&key_file) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %key_file.display(), "failed to read trusted key: {e}");
                    continue;
                }
            };
            match TrustedKeyInfo::from_toml(&raw, &source) {
                Ok(info) => {
                    let actual = compute_fingerprint(&info.public_key_pem);
                    if actual != fingerprint {
                        warn!(
                            path = %key_file.display(),
                            expected = fingerprint,
                            actual,
                            "fingerprint mismatch in trusted key file"
                        );
                        continue;
                    }
                    return Some(info);
                }
                Err(e) => {
                    warn!(path = %key_file.display(), "failed to parse trusted key: {e}");
                }
            }
        }
        None
    }

    pub fn get_public_key(&self, fingerprint: &str) -> Option<String> {
        self.get_key(fingerprint).map(|info| info.public_key_pem)
    }

    /// Add a public key to the trust store, signing the document with the
    /// local identity. Returns the fingerprint.
    pub fn add_key(
        &self,
        keypair: &Keypair,
        public_key_pem: &str,
        owner: &str,
        attestation: Option<String>,
        to_project: bool,
    ) -> Result<String> {
        let fingerprint = compute_fingerprint(public_key_pem);
        let dir = if to_project {
            self.config
                .project_ai_dir()
                .unwrap_or_else(|| self.config.user_ai_dir())
                .join(TRUSTED_KEYS_DIR)
        } else {
            self.config.user_ai_dir().join(TRUSTED_KEYS_DIR)
        };
        std::fs::create_dir_all(&dir)?;

        let info = TrustedKeyInfo {
            fingerprint: fingerprint.clone(),
            owner: owner.to_string(),
            public_key_pem: public_key_pem.to_string(),
            attestation,
            source: String::new(),
        };
        let signer = crate::signing::ItemSigner::new(keypair);
        let path = dir.join(format!("{fingerprint}.toml"));
        let signed = signer.sign_content(&path, &info.to_toml())?;
        std::fs::write(&path, signed)?;
        info!(%fingerprint, owner, "trusted key added");
        Ok(fingerprint)
    }

    /// Remove a key from the user trust store. Returns whether it existed.
    pub fn remove_key(&self, fingerprint: &str) -> Result<bool> {
        let key_file = self
            .config
            .user_ai_dir()
            .join(TRUSTED_KEYS_DIR)
            .join(format!("{fingerprint}.toml"));
        if key_file.is_file() {
            std::fs::remove_file(&key_file)?;
            info!(fingerprint, "trusted key removed");
            return Ok(true);
        }
        Ok(false)
    }

    /// Pin a registry key on first use (TOFU). A no-op when the fingerprint
    /// is already trusted; subsequent mismatching keys simply fail lookup.
    pub fn pin_registry_key(
        &self,
        keypair: &Keypair,
        public_key_pem: &str,
        registry_name: &str,
    ) -> Result<String> {
        let fingerprint = compute_fingerprint(public_key_pem);
        if self.get_key(&fingerprint).is_some() {
            return Ok(fingerprint);
        }
        self.add_key(keypair, public_key_pem, registry_name, None, false)
    }

    /// The pinned key for a registry, found by owner match.
    pub fn get_registry_key(&self, registry_name: &str) -> Option<String> {
        self.list_keys()
            .into_iter()
            .find(|info| info.owner == registry_name)
            .map(|info| info.public_key_pem)
    }

    /// List all trusted keys across all spaces, higher precedence first,
    /// deduplicated by fingerprint.
    pub fn list_keys(&self) -> Vec<TrustedKeyInfo> {
        let mut seen = std::collections::HashSet::new();
        let mut keys = Vec::new();
        for (source, dir) in self.search_dirs() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                    continue;
                }
                let Ok(raw) = std::fs::read_to_string(&path) else {
                    continue;
                };
                match TrustedKeyInfo::from_toml(&raw, &source) {
                    Ok(info) => {
                        if seen.insert(info.fingerprint.clone()) {
                            keys.push(info);
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "failed to parse trusted key: {e}");
                    }
                }
            }
        }
        keys
    }

    /// Make sure the local signing key is trusted, adding it to the user
    /// store with owner `local` when missing. Called on first sign.
    pub fn ensure_self_trusted(&self, keypair: &Keypair) -> Result<()> {
        if !self.is_trusted(keypair.fingerprint()) {
            self.add_key(
                keypair,
                &keypair.public_key_pem().to_string(),
                "local",
                None,
                false,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn setup() -> (tempfile::TempDir, Config, Keypair) {
        let tmp = tempfile::tempdir().unwrap();
        let user = tmp.path().join("home");
        std::fs::create_dir_all(&user).unwrap();
        let config = Config::with_spaces(Some(tmp.path().join("proj")), user.clone()).unwrap();
        let keypair = Keypair::ensure(&config.keys_dir()).unwrap();
        (tmp, config, keypair)
    }

    #[test]
    fn add_then_get_round_trips() {
        let (_tmp, config, keypair) = setup();
        let store = TrustStore::new(&config);
        let pem = keypair.public_key_pem().to_string();
        let fp = store.add_key(&keypair, &pem, "leo", None, false).unwrap();
        let info = store.get_key(&fp).unwrap();
        assert_eq!(info.owner, "leo");
        assert_eq!(info.source, "user");
        assert_eq!(info.public_key_pem.trim(), pem.trim());
    }

    #[test]
    fn self_trust_is_idempotent() {
        let (_tmp, config, keypair) = setup();
        let store = TrustStore::new(&config);
        store.ensure_self_trusted(&keypair).unwrap();
        store.ensure_self_trusted(&keypair).unwrap();
        assert_eq!(store.list_keys().len(), 1);
        assert!(store.is_trusted(keypair.fingerprint()));
    }

    #[test]
    fn registry_pinning_is_tofu() {
        let (_tmp, config, keypair) = setup();
        let store = TrustStore::new(&config);
        let pem = keypair.public_key_pem().to_string();
        let fp1 = store
            .pin_registry_key(&keypair, &pem, "rye-registry")
            .unwrap();
        let fp2 = store
            .pin_registry_key(&keypair, &pem, "rye-registry")
            .unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(store.get_registry_key("rye-registry").unwrap().trim(), pem.trim());
    }

    #[test]
    fn fingerprint_mismatch_is_skipped() {
        let (_tmp, config, keypair) = setup();
        let store = TrustStore::new(&config);
        let pem = keypair.public_key_pem().to_string();
        let dir = config.user_ai_dir().join("trusted_keys");
        std::fs::create_dir_all(&dir).unwrap();
        // A document claiming the wrong fingerprint for its embedded key.
        let bogus = TrustedKeyInfo {
            fingerprint: "0000000000000000".to_string(),
            owner: "evil".to_string(),
            public_key_pem: pem,
            attestation: None,
            source: String::new(),
        };
        std::fs::write(dir.join("0000000000000000.toml"), bogus.to_toml()).unwrap();
        assert!(store.get_key("0000000000000000").is_none());
    }
}
