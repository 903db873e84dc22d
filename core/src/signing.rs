//! Ed25519 signing identity and the `rye:signed:` line format.
//!
//! Every durable artifact carries a signature line (or `_signature` JSON
//! field) of the form
//! `rye:signed:<iso-ts>:<content-hash>:<ed25519-sig>:<pubkey-fp>[|provider@user]`
//! where the hash is SHA-256 over the canonicalized content: the artifact
//! stripped of any prior signature line and, for code files, of a shebang.

use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::pkcs8::EncodePublicKey;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use sha2::Digest;
use sha2::Sha256;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::debug;

use crate::error::Result;
use crate::error::RyeErr;

pub const PRIVATE_KEY_FILE: &str = "private_key.pem";
pub const PUBLIC_KEY_FILE: &str = "public_key.pem";

const SIGNATURE_TAG: &str = "rye:signed:";

/// ISO-8601 UTC seconds, e.g. `2026-02-26T05:02:40Z`.
const SIGNATURE_TS_FORMAT: &[FormatItem] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// SHA-256 of arbitrary bytes as 64 lowercase hex chars.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Key fingerprint: SHA-256 of the public-key PEM bytes, first 8 bytes hex.
pub fn compute_fingerprint(public_key_pem: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key_pem.as_bytes());
    hex_encode(&hasher.finalize()[..8])
}

/// The process-wide signing identity loaded from (or generated into)
/// `{user_space}/.ai/keys/`.
pub struct Keypair {
    signing: SigningKey,
    public_pem: String,
    fingerprint: String,
}

impl Keypair {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Load the keypair, generating one with owner-only permissions when
    /// none exists yet.
    pub fn ensure(key_dir: &Path) -> Result<Keypair> {
        let private_path = key_dir.join(PRIVATE_KEY_FILE);
        if private_path.is_file() {
            return Self::load(key_dir);
        }
        let secret: [u8; 32] = rand::random();
        let signing = SigningKey::from_bytes(&secret);
        Self::save(key_dir, &signing)?;
        debug!(dir = %key_dir.display(), "generated new signing keypair");
        Self::load(key_dir)
    }

    pub fn load(key_dir: &Path) -> Result<Keypair> {
        let private_pem = std::fs::read_to_string(key_dir.join(PRIVATE_KEY_FILE))?;
        let public_pem = std::fs::read_to_string(key_dir.join(PUBLIC_KEY_FILE))?;
        let signing = SigningKey::from_pkcs8_pem(&private_pem)
            .map_err(|e| RyeErr::Configuration(format!("invalid private key: {e}")))?;
        let fingerprint = compute_fingerprint(&public_pem);
        Ok(Keypair {
            signing,
            public_pem,
            fingerprint,
        })
    }

    /// Import a private key PEM (e.g. from `RYE_SIGNING_KEY`), deriving and
    /// persisting the public half. Env vars often carry literal `\n`; those
    /// are normalized first.
    pub fn import_pem(key_dir: &Path, raw_pem: &str) -> Result<Keypair> {
        let pem = raw_pem.replace("\\n", "\n");
        let signing = SigningKey::from_pkcs8_pem(&pem)
            .map_err(|e| RyeErr::Configuration(format!("invalid private key PEM: {e}")))?;
        Self::save(key_dir, &signing)?;
        Self::load(key_dir)
    }

    fn save(key_dir: &Path, signing: &SigningKey) -> Result<()> {
        std::fs::create_dir_all(key_dir)?;
        set_permissions(key_dir, 0o700)?;

        let private_pem = signing
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| RyeErr::Configuration(format!("cannot encode private key: {e}")))?;
        let public_pem = signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| RyeErr::Configuration(format!("cannot encode public key: {e}")))?;

        let private_path = key_dir.join(PRIVATE_KEY_FILE);
        std::fs::write(&private_path, private_pem.as_bytes())?;
        set_permissions(&private_path, 0o600)?;

        let public_path = key_dir.join(PUBLIC_KEY_FILE);
        std::fs::write(&public_path, public_pem.as_bytes())?;
        set_permissions(&public_path, 0o644)?;
        Ok(())
    }

    /// Sign a hex hash string, returning the base64url signature.
    pub fn sign_hash(&self, content_hash: &str) -> String {
        let sig = self.signing.sign(content_hash.as_bytes());
        URL_SAFE_NO_PAD.encode(sig.to_bytes())
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Verify a base64url Ed25519 signature over a hex hash string.
pub fn verify_hash_signature(content_hash: &str, sig_b64: &str, public_key_pem: &str) -> bool {
    let Ok(key) = VerifyingKey::from_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(sig_b64.as_bytes()) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);
    key.verify(content_hash.as_bytes(), &signature).is_ok()
}

/// A parsed `rye:signed:` line.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureLine {
    pub timestamp: String,
    pub hash: String,
    pub sig: String,
    pub fingerprint: String,
    /// Optional `provider@username` registry provenance claim.
    pub provenance: Option<String>,
}

impl SignatureLine {
    /// Parse the inner `rye:signed:TS:HASH:SIG:FP[|prov]` form. The
    /// timestamp itself contains colons, so fields are split from the right.
    pub fn parse(inner: &str) -> Option<SignatureLine> {
        let rest = inner.strip_prefix(SIGNATURE_TAG)?;
        let (rest, provenance) = match rest.split_once('|') {
            Some((head, prov)) => (head, Some(prov.to_string())),
            None => (rest, None),
        };
        let mut fields = rest.rsplitn(4, ':');
        let fingerprint = fields.next()?.to_string();
        let sig = fields.next()?.to_string();
        let hash = fields.next()?.to_string();
        let timestamp = fields.next()?.to_string();
        if hash.len() != 64 || fingerprint.len() != 16 {
            return None;
        }
        Some(SignatureLine {
            timestamp,
            hash,
            sig,
            fingerprint,
            provenance,
        })
    }

    pub fn render(&self) -> String {
        let mut line = format!(
            "{SIGNATURE_TAG}{}:{}:{}:{}",
            self.timestamp, self.hash, self.sig, self.fingerprint
        );
        if let Some(prov) = &self.provenance {
            line.push('|');
            line.push_str(prov);
        }
        line
    }
}

/// How the signature line is embedded per artifact format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStyle {
    /// `<!-- rye:signed:... -->` on line 1 (markdown / HTML).
    MarkdownComment,
    /// `<prefix> rye:signed:...` on line 1, or after a shebang.
    CodeComment,
    /// Plain `# rye:signed:...` on line 1 (lockfiles, trusted-key TOML).
    HashComment,
}

impl SignatureStyle {
    /// Pick a style from a file extension using the comment-prefix table.
    pub fn for_path(path: &Path, prefixes: &CommentPrefixes) -> SignatureStyle {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match ext {
            "md" | "html" | "htm" => SignatureStyle::MarkdownComment,
            "toml" | "json" => SignatureStyle::HashComment,
            _ if prefixes.get(ext).is_some() => SignatureStyle::CodeComment,
            _ => SignatureStyle::HashComment,
        }
    }

    fn wrap(&self, inner: &str, comment_prefix: &str) -> String {
        match self {
            SignatureStyle::MarkdownComment => format!("<!-- {inner} -->"),
            SignatureStyle::CodeComment => format!("{comment_prefix} {inner}"),
            SignatureStyle::HashComment => format!("# {inner}"),
        }
    }
}

/// Per-extension comment prefixes for code signature lines, resolved
/// three-tier from `config/signing/comment_prefixes.toml` with built-in
/// defaults.
#[derive(Debug, Clone)]
pub struct CommentPrefixes {
    map: std::collections::HashMap<String, String>,
}

impl Default for CommentPrefixes {
    fn default() -> Self {
        let mut map = std::collections::HashMap::new();
        for (ext, prefix) in [
            ("py", "#"),
            ("sh", "#"),
            ("rb", "#"),
            ("rs", "//"),
            ("js", "//"),
            ("ts", "//"),
            ("go", "//"),
            ("c", "//"),
            ("h", "//"),
            ("cpp", "//"),
            ("java", "//"),
            ("sql", "--"),
            ("lua", "--"),
        ] {
            map.insert(ext.to_string(), prefix.to_string());
        }
        CommentPrefixes { map }
    }
}

impl CommentPrefixes {
    pub fn get(&self, ext: &str) -> Option<&str> {
        self.map.get(ext).map(String::as_str)
    }

    /// Merge overrides from a three-tier resolved TOML table of
    /// `extension = "prefix"` pairs.
    pub fn with_overrides(mut self, overrides: &toml::Table) -> Self {
        for (ext, prefix) in overrides {
            if let Some(prefix) = prefix.as_str() {
                self.map.insert(ext.clone(), prefix.to_string());
            }
        }
        self
    }
}

/// Strip any existing signature line, returning `(canonical_content,
/// shebang)` where the shebang (if present) is preserved for re-rendering
/// but excluded from hashing.
fn canonicalize(content: &str) -> (String, Option<String>) {
    let mut lines: Vec<&str> = content.lines().collect();
    let shebang = if lines.first().is_some_and(|l| l.starts_with("#!")) {
        Some(lines.remove(0).to_string())
    } else {
        None
    };
    if let Some(first) = lines.first() {
        if first.contains(SIGNATURE_TAG) {
            lines.remove(0);
        }
    }
    let mut body = lines.join("\n");
    if content.ends_with('\n') && !body.is_empty() {
        body.push('\n');
    }
    (body, shebang)
}

/// Extract the signature line (if any) from raw file content.
pub fn extract_signature(content: &str) -> Option<SignatureLine> {
    for line in content.lines().take(2) {
        if let Some(start) = line.find(SIGNATURE_TAG) {
            let inner = &line[start..];
            let inner = inner.trim_end_matches("-->").trim_end();
            return SignatureLine::parse(inner);
        }
    }
    None
}

pub struct ItemSigner<'a> {
    keypair: &'a Keypair,
    prefixes: CommentPrefixes,
}

impl<'a> ItemSigner<'a> {
    pub fn new(keypair: &'a Keypair) -> Self {
        Self {
            keypair,
            prefixes: CommentPrefixes::default(),
        }
    }

    pub fn with_prefixes(keypair: &'a Keypair, prefixes: CommentPrefixes) -> Self {
        Self { keypair, prefixes }
    }

    /// Sign file content, replacing any prior signature line. Idempotent:
    /// re-signing unchanged content produces the same hash.
    pub fn sign_content(&self, path: &Path, content: &str) -> Result<String> {
        let (canonical, shebang) = canonicalize(content);
        let hash = sha256_hex(canonical.as_bytes());
        let sig = self.keypair.sign_hash(&hash);
        let ts = OffsetDateTime::now_utc()
            .format(SIGNATURE_TS_FORMAT)
            .map_err(|e| RyeErr::Configuration(format!("cannot format timestamp: {e}")))?;

        let line = SignatureLine {
            timestamp: ts,
            hash,
            sig,
            fingerprint: self.keypair.fingerprint().to_string(),
            provenance: None,
        };

        let style = SignatureStyle::for_path(path, &self.prefixes);
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let prefix = self.prefixes.get(ext).unwrap_or("#");
        let rendered = style.wrap(&line.render(), prefix);

        let mut out = String::new();
        if let Some(shebang) = shebang {
            out.push_str(&shebang);
            out.push('\n');
        }
        out.push_str(&rendered);
        out.push('\n');
        out.push_str(&canonical);
        Ok(out)
    }
}

/// Outcome of verifying an artifact's signature against a trust lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub issues: Vec<String>,
    pub fingerprint: Option<String>,
    pub registry_provenance: Option<String>,
}

/// Verify signed file content. `lookup_key` resolves a fingerprint to a
/// trusted public-key PEM (the trust store provides this).
pub fn verify_content(
    content: &str,
    lookup_key: impl Fn(&str) -> Option<String>,
) -> VerifyOutcome {
    let Some(line) = extract_signature(content) else {
        return VerifyOutcome {
            valid: false,
            issues: vec!["unsigned".to_string()],
            fingerprint: None,
            registry_provenance: None,
        };
    };

    let (canonical, _) = canonicalize(content);
    let actual_hash = sha256_hex(canonical.as_bytes());
    let mut issues = Vec::new();
    if actual_hash != line.hash {
        issues.push("hash_mismatch".to_string());
    }

    match lookup_key(&line.fingerprint) {
        None => issues.push("untrusted_key".to_string()),
        Some(pem) => {
            if issues.is_empty() && !verify_hash_signature(&line.hash, &line.sig, &pem) {
                issues.push("signature_invalid".to_string());
            }
        }
    }

    VerifyOutcome {
        valid: issues.is_empty(),
        issues,
        fingerprint: Some(line.fingerprint),
        registry_provenance: line.provenance,
    }
}

/// Sign a JSON object by adding a `_signature` field over the canonical
/// JSON (sorted keys, compact separators) of the remaining fields.
pub fn sign_json(keypair: &Keypair, value: &serde_json::Value) -> Result<serde_json::Value> {
    let mut obj = value
        .as_object()
        .cloned()
        .ok_or_else(|| RyeErr::Validation {
            issues: vec!["can only sign JSON objects".to_string()],
        })?;
    obj.remove("_signature");
    let canonical = canonical_json(&serde_json::Value::Object(obj.clone()));
    let hash = sha256_hex(canonical.as_bytes());
    let sig = keypair.sign_hash(&hash);
    let ts = OffsetDateTime::now_utc()
        .format(SIGNATURE_TS_FORMAT)
        .map_err(|e| RyeErr::Configuration(format!("cannot format timestamp: {e}")))?;
    let line = SignatureLine {
        timestamp: ts,
        hash,
        sig,
        fingerprint: keypair.fingerprint().to_string(),
        provenance: None,
    };
    obj.insert(
        "_signature".to_string(),
        serde_json::Value::String(line.render()),
    );
    Ok(serde_json::Value::Object(obj))
}

/// Verify a JSON object's `_signature` field.
pub fn verify_json(
    value: &serde_json::Value,
    lookup_key: impl Fn(&str) -> Option<String>,
) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    let Some(sig_str) = obj.get("_signature").and_then(|v| v.as_str()) else {
        return false;
    };
    let Some(line) = SignatureLine::parse(sig_str) else {
        return false;
    };
    let mut content = obj.clone();
    content.remove("_signature");
    let canonical = canonical_json(&serde_json::Value::Object(content));
    if sha256_hex(canonical.as_bytes()) != line.hash {
        return false;
    }
    let Some(pem) = lookup_key(&line.fingerprint) else {
        return false;
    };
    verify_hash_signature(&line.hash, &line.sig, &pem)
}

/// Canonical JSON: object keys sorted recursively, compact separators.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                serde_json::Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sort(v)))
                        .collect(),
                )
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Resolve the default key directory for a config.
pub fn default_key_dir(config: &crate::config::Config) -> PathBuf {
    config.keys_dir()
}
