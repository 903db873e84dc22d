use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// Signed object binding a thread to a capability set.
///
/// The signature covers the canonical JSON (sorted keys, sorted caps) of all
/// fields except `signature`; minting and verification live in
/// `rye_core::token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub token_id: String,
    pub caps: Vec<String>,
    /// Audience identifier, preventing cross-service replay.
    pub aud: String,
    /// Expiry, RFC 3339 UTC.
    pub exp: String,
    pub directive_id: String,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug)]
pub enum TokenDecodeError {
    Base64(base64::DecodeError),
    Json(serde_json::Error),
}

impl std::fmt::Display for TokenDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenDecodeError::Base64(e) => write!(f, "invalid token encoding: {e}"),
            TokenDecodeError::Json(e) => write!(f, "invalid token payload: {e}"),
        }
    }
}

impl std::error::Error for TokenDecodeError {}

impl CapabilityToken {
    pub fn new(
        caps: Vec<String>,
        aud: impl Into<String>,
        exp: OffsetDateTime,
        directive_id: impl Into<String>,
        thread_id: impl Into<String>,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            token_id: Uuid::new_v4().to_string(),
            caps,
            aud: aud.into(),
            exp: exp
                .format(&Rfc3339)
                .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z")),
            directive_id: directive_id.into(),
            thread_id: thread_id.into(),
            parent_id,
            signature: None,
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        match OffsetDateTime::parse(&self.exp, &Rfc3339) {
            Ok(exp) => now > exp,
            Err(_) => true,
        }
    }

    /// The canonical bytes the Ed25519 signature covers: JSON with sorted
    /// keys and sorted caps, excluding `signature`.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut caps = self.caps.clone();
        caps.sort();
        let mut map = Map::new();
        map.insert("aud".to_string(), Value::String(self.aud.clone()));
        map.insert(
            "caps".to_string(),
            Value::Array(caps.into_iter().map(Value::String).collect()),
        );
        map.insert(
            "directive_id".to_string(),
            Value::String(self.directive_id.clone()),
        );
        map.insert("exp".to_string(), Value::String(self.exp.clone()));
        map.insert(
            "parent_id".to_string(),
            self.parent_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        map.insert("thread_id".to_string(), Value::String(self.thread_id.clone()));
        map.insert("token_id".to_string(), Value::String(self.token_id.clone()));
        // serde_json::Map preserves insertion order; keys above are inserted
        // sorted so the output is canonical.
        serde_json::to_vec(&Value::Object(map)).unwrap_or_default()
    }

    /// JWT-style wire form: `base64url(json(sorted-keys))`.
    pub fn to_jwt(&self) -> String {
        let mut map = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(obj) = &mut map {
            let sorted: Map<String, Value> = {
                let mut entries: Vec<(String, Value)> =
                    obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries.into_iter().collect()
            };
            *obj = sorted;
        }
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&map).unwrap_or_default())
    }

    pub fn from_jwt(token: &str) -> Result<Self, TokenDecodeError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(TokenDecodeError::Base64)?;
        serde_json::from_slice(&bytes).map_err(TokenDecodeError::Json)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use time::Duration;

    fn token() -> CapabilityToken {
        CapabilityToken::new(
            vec![
                "rye.execute.tool.rye.file-system.*".to_string(),
                "rye.load.knowledge.*".to_string(),
            ],
            "rye",
            OffsetDateTime::now_utc() + Duration::hours(1),
            "deploy",
            "t-1",
            None,
        )
    }

    #[test]
    fn jwt_round_trip() {
        let t = token();
        let back = CapabilityToken::from_jwt(&t.to_jwt()).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn signing_payload_sorts_caps() {
        let mut t = token();
        t.caps.reverse();
        let payload = String::from_utf8(t.signing_payload()).unwrap();
        let load_pos = payload.find("rye.load.knowledge").unwrap();
        let exec_pos = payload.find("rye.execute.tool").unwrap();
        assert!(exec_pos < load_pos);
    }

    #[test]
    fn expiry_check() {
        let t = token();
        assert!(!t.is_expired(OffsetDateTime::now_utc()));
        assert!(t.is_expired(OffsetDateTime::now_utc() + Duration::hours(2)));
    }
}
