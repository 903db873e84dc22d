//! Capability-token minting, signing, verification, and attenuation.

use rye_protocol::CapabilityToken;
use time::Duration;
use time::OffsetDateTime;

use crate::capability;
use crate::error::Result;
use crate::error::RyeErr;
use crate::signing::Keypair;
use crate::signing::sha256_hex;
use crate::signing::verify_hash_signature;

pub const DEFAULT_AUDIENCE: &str = "rye";
pub const DEFAULT_EXPIRY_HOURS: i64 = 1;

/// Mint and sign a token binding a thread to a capability set.
pub fn mint_token(
    keypair: &Keypair,
    caps: Vec<String>,
    directive_id: &str,
    thread_id: &str,
    parent_id: Option<String>,
) -> CapabilityToken {
    let exp = OffsetDateTime::now_utc() + Duration::hours(DEFAULT_EXPIRY_HOURS);
    let mut token =
        CapabilityToken::new(caps, DEFAULT_AUDIENCE, exp, directive_id, thread_id, parent_id);
    sign_token(keypair, &mut token);
    token
}

/// Sign (or re-sign) a token in place. The signature covers the SHA-256 of
/// the canonical payload so transcripts and tokens verify the same way.
pub fn sign_token(keypair: &Keypair, token: &mut CapabilityToken) {
    let payload_hash = sha256_hex(&token.signing_payload());
    token.signature = Some(keypair.sign_hash(&payload_hash));
}

/// Verify a token's signature and expiry against a trusted public key.
pub fn verify_token(token: &CapabilityToken, public_key_pem: &str) -> Result<()> {
    if token.is_expired(OffsetDateTime::now_utc()) {
        return Err(RyeErr::Integrity(format!(
            "capability token {} expired at {}",
            token.token_id, token.exp
        )));
    }
    let Some(signature) = &token.signature else {
        return Err(RyeErr::Integrity(format!(
            "capability token {} is unsigned",
            token.token_id
        )));
    };
    let payload_hash = sha256_hex(&token.signing_payload());
    if !verify_hash_signature(&payload_hash, signature, public_key_pem) {
        return Err(RyeErr::Integrity(format!(
            "capability token {} signature invalid",
            token.token_id
        )));
    }
    Ok(())
}

/// Derive a child token from a parent under the fnmatch-narrowing rule.
/// Expiry and audience are inherited from the parent; the parent's token id
/// becomes the child's `parent_id`.
pub fn attenuate_token(
    keypair: &Keypair,
    parent: &CapabilityToken,
    child_declared_caps: &[String],
    child_directive_id: &str,
    child_thread_id: &str,
) -> Result<CapabilityToken> {
    let exp = OffsetDateTime::parse(
        &parent.exp,
        &time::format_description::well_known::Rfc3339,
    )
    .map_err(|e| RyeErr::Integrity(format!("parent token has invalid expiry: {e}")))?;

    let child_caps: Vec<String> = child_declared_caps
        .iter()
        .map(|c| capability::normalize_cap(c))
        .collect();
    let caps = capability::attenuate(&child_caps, &parent.caps);

    let mut token = CapabilityToken::new(
        caps,
        parent.aud.clone(),
        exp,
        child_directive_id,
        child_thread_id,
        Some(parent.token_id.clone()),
    );
    sign_token(keypair, &mut token);
    Ok(token)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn keypair() -> (tempfile::TempDir, Keypair) {
        let tmp = tempfile::tempdir().unwrap();
        let kp = Keypair::ensure(tmp.path()).unwrap();
        (tmp, kp)
    }

    #[test]
    fn mint_verify_round_trip() {
        let (_tmp, kp) = keypair();
        let token = mint_token(
            &kp,
            vec!["rye.execute.tool.rye.file-system.*".to_string()],
            "deploy",
            "t-1",
            None,
        );
        verify_token(&token, kp.public_key_pem()).unwrap();
    }

    #[test]
    fn tampered_caps_fail_verification() {
        let (_tmp, kp) = keypair();
        let mut token = mint_token(&kp, vec!["rye.load.knowledge.*".to_string()], "d", "t", None);
        token.caps.push("rye.execute.*".to_string());
        assert!(verify_token(&token, kp.public_key_pem()).is_err());
    }

    #[test]
    fn attenuated_token_inherits_expiry_and_links_parent() {
        let (_tmp, kp) = keypair();
        let parent = mint_token(
            &kp,
            vec!["rye.execute.tool.rye.file-system.*".to_string()],
            "parent",
            "t-parent",
            None,
        );
        let child = attenuate_token(
            &kp,
            &parent,
            &[
                "rye.execute.tool.rye.file-system.fs_write".to_string(),
                "rye.execute.tool.network.http_get".to_string(),
            ],
            "child",
            "t-child",
        )
        .unwrap();
        assert_eq!(child.exp, parent.exp);
        assert_eq!(child.parent_id.as_deref(), Some(parent.token_id.as_str()));
        assert_eq!(
            child.caps,
            vec!["rye.execute.tool.rye.file-system.fs_write".to_string()]
        );
        verify_token(&child, kp.public_key_pem()).unwrap();
    }
}
