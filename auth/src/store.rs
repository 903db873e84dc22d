use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use aes_gcm::Aes256Gcm;
use aes_gcm::Key;
use aes_gcm::Nonce;
use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use pbkdf2::pbkdf2_hmac;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::warn;

use crate::AuthError;
use crate::RefreshConfig;
use crate::Result;
use crate::TokenData;
use crate::token_data::TokenMetadata;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_FILE: &str = ".salt";
const NONCE_LEN: usize = 12;

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Secure credential management using the OS keychain or encrypted files.
pub struct AuthStore {
    service_name: String,
    auth_dir: PathBuf,
    salt: Option<Vec<u8>>,
    use_keyring: bool,
    metadata_cache: Mutex<HashMap<String, TokenMetadata>>,
    http: reqwest::Client,
}

impl AuthStore {
    /// Open the store. `auth_dir` is `{USER_SPACE}/.ai/auth/`; it is
    /// created with owner-only permissions when file fallback engages.
    pub fn new(service_name: impl Into<String>, auth_dir: PathBuf) -> Result<Self> {
        let service_name = service_name.into();
        let use_keyring = keyring_available(&service_name);

        let mut store = Self {
            service_name,
            auth_dir,
            salt: None,
            use_keyring,
            metadata_cache: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        };
        if !store.use_keyring {
            store.init_file_backend()?;
        }
        Ok(store)
    }

    /// Force the encrypted-file backend. Used by tests and headless hosts.
    pub fn with_file_backend(service_name: impl Into<String>, auth_dir: PathBuf) -> Result<Self> {
        let mut store = Self {
            service_name: service_name.into(),
            auth_dir,
            salt: None,
            use_keyring: false,
            metadata_cache: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        };
        store.init_file_backend()?;
        Ok(store)
    }

    fn init_file_backend(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.auth_dir)?;
        set_permissions(&self.auth_dir, 0o700)?;
        let salt_path = self.auth_dir.join(SALT_FILE);
        let salt = if salt_path.is_file() {
            std::fs::read(&salt_path)?
        } else {
            let salt: [u8; 16] = rand::random();
            std::fs::write(&salt_path, salt)?;
            set_permissions(&salt_path, 0o600)?;
            salt.to_vec()
        };
        self.salt = Some(salt);
        Ok(())
    }

    /// Derive the file-encryption key from the machine-specific seed
    /// `{login}@{hostname}:lillux-auth` and the per-install salt. Not high
    /// security; keeps tokens out of casual reach.
    fn derive_key(&self) -> Result<[u8; 32]> {
        let salt = self
            .salt
            .as_ref()
            .ok_or_else(|| AuthError::Storage("file backend not initialized".to_string()))?;
        let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string());
        let seed = format!("{}@{}:lillux-auth", whoami::username(), hostname);
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(seed.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
        Ok(key)
    }

    fn token_path(&self, service: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}_{service}", self.service_name).as_bytes());
        let digest = hasher.finalize();
        let prefix: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        self.auth_dir.join(format!("{prefix}.token"))
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.derive_key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| AuthError::Storage("encryption failed".to_string()))?;
        let mut out = nonce_bytes.to_vec();
        out.extend(ciphertext);
        Ok(out)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() <= NONCE_LEN {
            return Err(AuthError::Storage("token file truncated".to_string()));
        }
        let key = self.derive_key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &blob[NONCE_LEN..])
            .map_err(|_| AuthError::Storage("decryption failed".to_string()))
    }

    fn keyring_entry(&self, service: &str) -> Option<keyring::Entry> {
        let account = format!("{}_{service}_access_token", self.service_name);
        keyring::Entry::new(&self.service_name, &account).ok()
    }

    fn read_token(&self, service: &str) -> Option<TokenData> {
        if self.use_keyring {
            if let Some(entry) = self.keyring_entry(service) {
                if let Ok(raw) = entry.get_password() {
                    if let Ok(token) = serde_json::from_str(&raw) {
                        return Some(token);
                    }
                }
            }
        }
        let path = self.token_path(service);
        if !path.is_file() {
            return None;
        }
        let blob = std::fs::read(&path).ok()?;
        let plaintext = self.decrypt(&blob).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }

    fn write_token(&self, service: &str, token: &TokenData) -> Result<()> {
        let raw = serde_json::to_string(token)?;

        if self.use_keyring {
            if let Some(entry) = self.keyring_entry(service) {
                match entry.set_password(&raw) {
                    Ok(()) => {
                        self.cache_metadata(service, token);
                        return Ok(());
                    }
                    Err(e) => warn!("keyring write failed, falling back to file: {e}"),
                }
            }
        }

        if self.salt.is_none() {
            return Err(AuthError::Storage(
                "no credential backend available".to_string(),
            ));
        }
        let blob = self.encrypt(raw.as_bytes())?;
        let path = self.token_path(service);
        std::fs::write(&path, blob)?;
        set_permissions(&path, 0o600)?;
        self.cache_metadata(service, token);
        Ok(())
    }

    fn cache_metadata(&self, service: &str, token: &TokenData) {
        if let Ok(mut cache) = self.metadata_cache.lock() {
            cache.insert(
                service.to_string(),
                TokenMetadata {
                    expires_at: token.expires_at,
                    scopes: token.scopes.clone(),
                    has_refresh_token: token.refresh_token.is_some(),
                },
            );
        }
    }

    /// Store a token.
    pub fn set_token(
        &self,
        service: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in: u64,
        scopes: Option<Vec<String>>,
        refresh_config: Option<RefreshConfig>,
    ) -> Result<()> {
        let token = TokenData {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: now_unix() + expires_in as f64,
            scopes: scopes.unwrap_or_default(),
            refresh_config,
        };
        self.write_token(service, &token)?;
        debug!(service, "token stored");
        Ok(())
    }

    /// Non-secret metadata for a service, if a token was stored this
    /// process lifetime.
    pub fn get_cached_metadata(&self, service: &str) -> Option<TokenMetadata> {
        self.metadata_cache.lock().ok()?.get(service).cloned()
    }

    /// Whether the service has a usable credential: unexpired, or expired
    /// but refreshable.
    pub fn is_authenticated(&self, service: &str) -> bool {
        match self.read_token(service) {
            Some(token) => !token.is_expired(now_unix()) || token.refresh_token.is_some(),
            None => false,
        }
    }

    /// Remove the stored credential for a service.
    pub fn clear_token(&self, service: &str) {
        if self.use_keyring {
            if let Some(entry) = self.keyring_entry(service) {
                let _ = entry.delete_credential();
            }
        }
        let _ = std::fs::remove_file(self.token_path(service));
        if let Ok(mut cache) = self.metadata_cache.lock() {
            cache.remove(service);
        }
    }

    /// Retrieve a valid access token, refreshing through the OAuth2 token
    /// endpoint when expired and refresh material is present.
    pub async fn get_token(&self, service: &str, scope: Option<&str>) -> Result<String> {
        let token = self
            .read_token(service)
            .ok_or_else(|| AuthError::AuthenticationRequired {
                service: service.to_string(),
                message: "no token stored".to_string(),
            })?;

        let token = if token.is_expired(now_unix()) {
            let refresh_token =
                token
                    .refresh_token
                    .clone()
                    .ok_or_else(|| AuthError::AuthenticationRequired {
                        service: service.to_string(),
                        message: "token expired and no refresh token".to_string(),
                    })?;
            let refresh_config =
                token
                    .refresh_config
                    .clone()
                    .ok_or_else(|| AuthError::Refresh {
                        service: service.to_string(),
                        status: 0,
                        body: "missing refresh configuration".to_string(),
                    })?;
            let refreshed = self
                .refresh(service, &refresh_token, &refresh_config)
                .await?;
            let new_token = TokenData {
                access_token: refreshed.access_token,
                refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
                expires_at: now_unix() + refreshed.expires_in as f64,
                scopes: token.scopes.clone(),
                refresh_config: Some(refresh_config),
            };
            self.write_token(service, &new_token)?;
            new_token
        } else {
            token
        };

        if let Some(scope) = scope {
            if !token.has_scope(scope) {
                return Err(AuthError::AuthenticationRequired {
                    service: service.to_string(),
                    message: format!("token lacks scope '{scope}'"),
                });
            }
        }
        Ok(token.access_token)
    }

    async fn refresh(
        &self,
        service: &str,
        refresh_token: &str,
        config: &RefreshConfig,
    ) -> Result<RefreshedToken> {
        debug!(service, "refreshing expired token");
        let response = self
            .http
            .post(&config.refresh_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", config.client_id.as_str()),
                ("client_secret", config.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Refresh {
                service: service.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let payload: serde_json::Value = response.json().await?;
        let access_token = payload
            .get("access_token")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| AuthError::Refresh {
                service: service.to_string(),
                status: status.as_u16(),
                body: "response missing access_token".to_string(),
            })?
            .to_string();
        Ok(RefreshedToken {
            access_token,
            refresh_token: payload
                .get("refresh_token")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            expires_in: payload
                .get("expires_in")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(3600),
        })
    }
}

struct RefreshedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

/// Probe for a working keychain backend without leaving residue.
fn keyring_available(service_name: &str) -> bool {
    let probe = format!("{service_name}-probe");
    match keyring::Entry::new(&probe, "probe") {
        Ok(entry) => match entry.set_password("probe") {
            Ok(()) => {
                let _ = entry.delete_credential();
                true
            }
            Err(_) => false,
        },
        Err(_) => false,
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
