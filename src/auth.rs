// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Token Verification
//!
//! Credentials are bearer tokens minted by the account service at login and
//! presented by clients on join and on every send. A token is
//! `{user_id}.{expires_at}.{tag}` where `tag` is the base64url-encoded
//! HMAC-SHA256 of `{user_id}.{expires_at}` under the relay's shared secret.
//! The relay only verifies; `issue` exists for the account service and for
//! tests.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

/// Verifies an opaque credential and returns the owning user id.
pub trait TokenVerifier: Send + Sync {
    /// Returns the verified user id, or a reason the token was rejected.
    fn verify(&self, token: &str) -> Result<String, &'static str>;
}

/// HMAC-SHA256 bearer token verifier.
pub struct HmacTokenVerifier {
    key: hmac::Key,
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl HmacTokenVerifier {
    /// Creates a verifier from the shared secret.
    pub fn new(secret: &[u8]) -> Self {
        HmacTokenVerifier {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Mints a token for `user_id` valid for `ttl`.
    pub fn issue(&self, user_id: &str, ttl: Duration) -> String {
        let expires_at = unix_now_secs().saturating_add(ttl.as_secs());
        let signing_input = format!("{}.{}", user_id, expires_at);
        let tag = hmac::sign(&self.key, signing_input.as_bytes());
        format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(tag.as_ref()))
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Result<String, &'static str> {
        // user_id may itself contain dots; the tag and expiry never do.
        let mut parts = token.rsplitn(3, '.');
        let tag_b64 = parts.next().ok_or("malformed token")?;
        let expires_str = parts.next().ok_or("malformed token")?;
        let user_id = parts.next().ok_or("malformed token")?;

        if user_id.is_empty() {
            return Err("malformed token");
        }

        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| "malformed token")?;
        let expires_at: u64 = expires_str.parse().map_err(|_| "malformed token")?;

        if unix_now_secs() > expires_at {
            return Err("token expired");
        }

        let signing_input = format!("{}.{}", user_id, expires_at);
        hmac::verify(&self.key, signing_input.as_bytes(), &tag)
            .map_err(|_| "token signature mismatch")?;

        Ok(user_id.to_string())
    }
}

const SECRET_FILE_NAME: &str = "auth_secret.key";
const SECRET_LEN: usize = 32;

/// Generates a fresh random secret.
pub fn generate_secret() -> [u8; SECRET_LEN] {
    let rng = SystemRandom::new();
    let mut secret = [0u8; SECRET_LEN];
    rng.fill(&mut secret).expect("system RNG failure");
    secret
}

/// Saves the secret to `{data_dir}/auth_secret.key` with 0600 permissions.
pub fn save_secret(secret: &[u8; SECRET_LEN], data_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(SECRET_FILE_NAME);
    std::fs::write(&path, secret)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Loads the secret from `{data_dir}/auth_secret.key`.
pub fn load_secret(data_dir: &Path) -> std::io::Result<[u8; SECRET_LEN]> {
    let path = data_dir.join(SECRET_FILE_NAME);
    let data = std::fs::read(&path)?;

    if data.len() != SECRET_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "Invalid secret file: expected {} bytes, got {}",
                SECRET_LEN,
                data.len()
            ),
        ));
    }

    let mut secret = [0u8; SECRET_LEN];
    secret.copy_from_slice(&data);
    Ok(secret)
}

/// Loads an existing token secret or generates a new one.
///
/// Priority:
/// 1. `RELAY_AUTH_SECRET` env var (base64url-encoded 32 bytes)
/// 2. Existing secret file at `{data_dir}/auth_secret.key`
/// 3. Generate a new secret and save it to the file
pub fn load_or_generate_secret(data_dir: &Path) -> [u8; SECRET_LEN] {
    if let Ok(secret_b64) = std::env::var("RELAY_AUTH_SECRET") {
        if let Ok(bytes) = URL_SAFE_NO_PAD.decode(&secret_b64) {
            if bytes.len() == SECRET_LEN {
                let mut secret = [0u8; SECRET_LEN];
                secret.copy_from_slice(&bytes);
                return secret;
            }
        }
    }

    if let Ok(secret) = load_secret(data_dir) {
        return secret;
    }

    let secret = generate_secret();
    let _ = save_secret(&secret, data_dir);
    secret
}
