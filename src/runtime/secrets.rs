//! Cluster secrets - join token and certificate key
//!
//! Both are generated once, cached to a local file, and copied verbatim to
//! every host that later needs to join. Lifecycle is create-if-absent, then
//! read-only for the cluster's life. The existence check before generation
//! is not transactional against two processes racing on the same path; one
//! orchestrator drives one cluster at a time by convention.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A token is regenerated when it expires within this window.
pub const TOKEN_REFRESH_WINDOW_SECS: i64 = 180;

/// Join token document as returned by `bosunctl token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub join_token: String,

    #[serde(default)]
    pub discovery_token_ca_cert_hash: Vec<String>,

    #[serde(default)]
    pub certificate_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl Token {
    /// Whether this token is expired or about to expire.
    pub fn needs_refresh(&self) -> bool {
        match self.expires {
            Some(expires) => {
                expires - Utc::now() <= Duration::seconds(TOKEN_REFRESH_WINDOW_SECS)
            }
            None => false,
        }
    }
}

/// `len` random bytes as lowercase hex.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A fresh 32-byte certificate key in hex.
pub fn create_certificate_key() -> String {
    random_hex(32)
}

/// Read the secret at `path`, generating and persisting it first if absent.
///
/// The second and every later call returns the cached file content
/// byte-identical; `generate` runs at most once per path.
pub fn load_or_create(
    path: &Path,
    generate: impl FnOnce() -> String,
) -> std::io::Result<String> {
    if path.exists() {
        return std::fs::read_to_string(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let secret = generate();
    std::fs::write(path, &secret)?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_key_is_64_hex_chars() {
        let key = create_certificate_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, create_certificate_key());
    }

    #[test]
    fn test_load_or_create_is_create_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("etc/certificate-key");

        let first = load_or_create(&path, create_certificate_key).unwrap();
        let second = load_or_create(&path, || panic!("must not regenerate")).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_token_refresh_window() {
        let mut token = Token {
            join_token: "abcdef.0123456789abcdef".to_string(),
            discovery_token_ca_cert_hash: vec![],
            certificate_key: String::new(),
            expires: Some(Utc::now() + Duration::hours(1)),
        };
        assert!(!token.needs_refresh());

        token.expires = Some(Utc::now() + Duration::seconds(60));
        assert!(token.needs_refresh());

        token.expires = None;
        assert!(!token.needs_refresh());
    }

    #[test]
    fn test_token_json_round_trip() {
        let json = r#"{
            "joinToken": "abcdef.0123456789abcdef",
            "discoveryTokenCaCertHash": ["sha256:aa"],
            "certificateKey": "deadbeef",
            "expires": "2030-01-01T00:00:00Z"
        }"#;
        let token: Token = serde_json::from_str(json).unwrap();
        assert_eq!(token.join_token, "abcdef.0123456789abcdef");
        assert_eq!(token.discovery_token_ca_cert_hash, vec!["sha256:aa"]);
    }
}
