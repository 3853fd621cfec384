//! VAPID key generation and persistence for Web Push (RFC 8292).
//!
//! The server holds one P-256 ECDSA keypair. The public key is served to
//! browsers as the `applicationServerKey` when they subscribe; the private
//! key signs every push request. Keys are generated on first run and kept
//! in `vapid.json` next to the config file.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// VAPID keypair for web push authentication.
///
/// The private key is stored as the raw 32-byte P-256 scalar (base64url),
/// the exact format `VapidSignatureBuilder::from_base64()` expects. The
/// public key is the uncompressed SEC1 point (65 bytes, base64url).
#[derive(Debug, Serialize, Deserialize)]
pub struct VapidKeys {
    /// Raw 32-byte P-256 private key scalar (base64url).
    private_key_b64: String,
    /// Uncompressed public key bytes (base64url, 65 bytes decoded).
    public_key_b64: String,
}

impl VapidKeys {
    /// Generate a fresh VAPID keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        // SEC1 uncompressed public key (65 bytes: 0x04 || x || y)
        let public_bytes = verifying_key.to_encoded_point(false);

        Self {
            private_key_b64: BASE64URL.encode(signing_key.to_bytes().as_slice()),
            public_key_b64: BASE64URL.encode(public_bytes.as_bytes()),
        }
    }

    /// Load the keypair from `vapid.json` under `dir`, generating and
    /// persisting a new one on first run.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        let path = dir.join("vapid.json");
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let keys: Self = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            keys.validate()?;
            return Ok(keys);
        }

        let keys = Self::generate();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        fs::write(&path, serde_json::to_string_pretty(&keys)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .context("failed to set VAPID key file permissions")?;
        }
        log::info!("[Vapid] Generated new keypair at {}", path.display());
        Ok(keys)
    }

    /// Base64url-encoded uncompressed public key, served to browsers as
    /// the `applicationServerKey`.
    pub fn public_key_base64url(&self) -> &str {
        &self.public_key_b64
    }

    /// Base64url-encoded raw 32-byte private key scalar, consumed by
    /// `VapidSignatureBuilder::from_base64()`.
    pub fn private_key_base64url(&self) -> &str {
        &self.private_key_b64
    }

    /// Reject key files that would fail later at signing time.
    fn validate(&self) -> Result<()> {
        let pub_bytes = BASE64URL
            .decode(&self.public_key_b64)
            .context("invalid base64url for VAPID public key")?;
        anyhow::ensure!(
            pub_bytes.len() == 65 && pub_bytes[0] == 0x04,
            "VAPID public key must be a 65-byte uncompressed P-256 point"
        );

        let priv_bytes = BASE64URL
            .decode(&self.private_key_b64)
            .context("invalid base64url for VAPID private key")?;
        anyhow::ensure!(
            priv_bytes.len() == 32,
            "VAPID private key must be a 32-byte P-256 scalar, got {} bytes",
            priv_bytes.len()
        );
        SigningKey::from_bytes(priv_bytes.as_slice().into())
            .context("VAPID private key is not a valid P-256 scalar")?;
        Ok(())
    }
}
