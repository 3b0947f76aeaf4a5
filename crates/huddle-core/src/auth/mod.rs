//! Authentication module for huddle-core.
//!
//! Provides the shared-secret service token used by inbox frontends to call
//! the Huddle backend.

use crate::error::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::SystemTime;

/// Service token for frontend to Huddle backend communication
#[derive(Debug, Clone)]
pub struct ServiceToken {
    /// Random 256-bit token
    pub token: [u8; 32],
    /// Creation timestamp (for rotation)
    pub created_at: SystemTime,
    /// Token ID for logging/revocation
    pub token_id: uuid::Uuid,
}

impl ServiceToken {
    /// Generate a new service token
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        for byte in &mut token {
            *byte = rand::random();
        }

        Self {
            token,
            created_at: SystemTime::now(),
            token_id: uuid::Uuid::new_v4(),
        }
    }

    /// Write token to file with restricted permissions (0600)
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let encoded = STANDARD.encode(self.token);
        fs::write(path, &encoded)?;
        fs::set_permissions(path, Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Read token from file
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let encoded = fs::read_to_string(path)?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| crate::error::Error::Other(format!("Invalid token encoding: {}", e)))?;

        if decoded.len() != 32 {
            return Err(crate::error::Error::InvalidToken);
        }

        let mut token = [0u8; 32];
        token.copy_from_slice(&decoded);

        Ok(Self {
            token,
            created_at: SystemTime::now(),
            token_id: uuid::Uuid::new_v4(),
        })
    }

    /// Verify a token matches
    pub fn verify(&self, candidate: &[u8]) -> bool {
        candidate == self.token
    }
}

/// Authentication context extracted from a request
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Acting user, forwarded by the frontend
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.token");

        let token = ServiceToken::generate();
        token.write_to_file(&path).unwrap();

        let loaded = ServiceToken::read_from_file(&path).unwrap();
        assert!(loaded.verify(&token.token));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_verify_rejects_wrong_token() {
        let token = ServiceToken::generate();
        let other = ServiceToken::generate();
        assert!(!token.verify(&other.token));
    }

    #[test]
    fn test_read_rejects_short_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.token");
        fs::write(&path, STANDARD.encode(b"short")).unwrap();
        assert!(ServiceToken::read_from_file(&path).is_err());
    }
}
