//! Per-session secret minting.

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;

/// Length chosen to carry ~256 bits of entropy in alphanumerics.
pub const SECRET_LEN: usize = 43;

/// Mint a fresh session secret from the OS entropy pool.
#[must_use]
pub fn generate_secret() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_have_the_expected_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_LEN);
        assert!(secret.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn secrets_do_not_repeat() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
    }
}
