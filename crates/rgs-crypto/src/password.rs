use thiserror::Error;

/// bcrypt cost factor for credential hashing (§3: "salted password hash,
/// bcrypt-class").
const BCRYPT_COST: u32 = 12;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    Hash(String),
}

pub fn hash_password(plaintext: &str) -> Result<String, PasswordError> {
    bcrypt::hash(plaintext, BCRYPT_COST).map_err(|e| PasswordError::Hash(e.to_string()))
}

/// Verify a password against a stored hash. Returns `false` (never an
/// error) on a malformed stored hash so callers uniformly treat any
/// mismatch as a failed credential check.
pub fn verify_password(plaintext: &str, hash: &str) -> bool {
    bcrypt::verify(plaintext, hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_password_verifies() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
    }

    #[test]
    fn wrong_password_fails() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(!verify_password("wrong password", &hash));
    }
}
