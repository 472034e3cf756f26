//! Admin password generation and Argon2id hashing.

use super::{PkiError, Result};
use crate::constants::{
    ADMIN_PASSWORD_LENGTH, ADMIN_PASSWORD_MIN_DIGITS, ADMIN_PASSWORD_MIN_SYMBOLS,
};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use zeroize::Zeroizing;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"~!@#$%^&*()_+`-={}|[]\\:\"<>?,./";
const KEY_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SALT_LENGTH: usize = 16;
const SECRET_KEY_LENGTH: usize = 32;
const MAX_ATTEMPTS: usize = 1000;

// Argon2id cost: 19 MiB, 2 passes, 1 lane
const HASH_MEMORY_KIB: u32 = 19 * 1024;
const HASH_ITERATIONS: u32 = 2;
const HASH_LANES: u32 = 1;

fn pick(rng: &mut impl Rng, pool: &[u8], count: usize, out: &mut Vec<u8>) {
    for _ in 0..count {
        out.push(pool[rng.gen_range(0..pool.len())]);
    }
}

/// No identical neighbours and no three-character runs like `abc` or `321`
fn acceptable(candidate: &[u8]) -> bool {
    let repeats = candidate.windows(2).any(|w| w[0] == w[1]);
    let runs = candidate.windows(3).any(|w| {
        let (a, b, c) = (i16::from(w[0]), i16::from(w[1]), i16::from(w[2]));
        (b - a == 1 && c - b == 1) || (a - b == 1 && b - c == 1)
    });
    !repeats && !runs
}

/// Random admin password: 24 characters with at least 4 digits and 4
/// symbols, no repeated neighbours and no sequences.
pub fn generate_password() -> Result<Zeroizing<String>> {
    let mut rng = rand::thread_rng();
    let letters = ADMIN_PASSWORD_LENGTH - ADMIN_PASSWORD_MIN_DIGITS - ADMIN_PASSWORD_MIN_SYMBOLS;

    for _ in 0..MAX_ATTEMPTS {
        let mut buf = Zeroizing::new(Vec::with_capacity(ADMIN_PASSWORD_LENGTH));
        pick(&mut rng, DIGITS, ADMIN_PASSWORD_MIN_DIGITS, &mut buf);
        pick(&mut rng, SYMBOLS, ADMIN_PASSWORD_MIN_SYMBOLS, &mut buf);
        pick(&mut rng, LETTERS, letters, &mut buf);
        buf.shuffle(&mut rng);

        if acceptable(&buf) {
            return Ok(Zeroizing::new(buf.iter().map(|&b| char::from(b)).collect()));
        }
    }
    Err(PkiError::Password(format!(
        "no acceptable password after {MAX_ATTEMPTS} attempts"
    )))
}

/// Signing key for the tenant's API server sessions
pub fn generate_secret_key() -> Zeroizing<String> {
    let mut rng = rand::thread_rng();
    Zeroizing::new(
        (0..SECRET_KEY_LENGTH)
            .map(|_| char::from(KEY_CHARS[rng.gen_range(0..KEY_CHARS.len())]))
            .collect(),
    )
}

fn hasher() -> Result<Argon2<'static>> {
    let params = Params::new(HASH_MEMORY_KIB, HASH_ITERATIONS, HASH_LANES, None)
        .map_err(|e| PkiError::Password(format!("invalid hash parameters: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

fn generate_salt() -> Result<SaltString> {
    let mut bytes = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut bytes);
    SaltString::encode_b64(&bytes).map_err(|e| PkiError::Password(format!("salt encoding: {e}")))
}

/// PHC string (`$argon2id$v=19$...`) of `password` under a fresh salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = generate_salt()?;
    let hash = hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PkiError::Password(format!("hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Whether `hash` is a PHC string produced from `password`. Malformed
/// hashes never verify.
pub fn verify_password_hash(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_policy() {
        for _ in 0..50 {
            let password = generate_password().unwrap();
            assert_eq!(password.len(), ADMIN_PASSWORD_LENGTH);
            let bytes = password.as_bytes();
            assert!(bytes.iter().filter(|b| DIGITS.contains(*b)).count() >= ADMIN_PASSWORD_MIN_DIGITS);
            assert!(
                bytes.iter().filter(|b| SYMBOLS.contains(*b)).count() >= ADMIN_PASSWORD_MIN_SYMBOLS
            );
            assert!(acceptable(bytes), "{} breaks the policy", password.as_str());
        }
    }

    #[test]
    fn test_sequences_and_repeats_are_rejected() {
        assert!(!acceptable(b"xabcx"));
        assert!(!acceptable(b"x321x"));
        assert!(!acceptable(b"xaax"));
        assert!(acceptable(b"xacex"));
    }

    #[test]
    fn test_hash_verifies_only_the_original_password() {
        let hash = hash_password("s3cret!").unwrap();
        assert!(hash.starts_with("$argon2id$v=19$m=19456,t=2,p=1$"));
        assert!(verify_password_hash("s3cret!", &hash));
        assert!(!verify_password_hash("other", &hash));
        assert!(!verify_password_hash("s3cret!", "sha256$somesalt$abc"));
        assert!(!verify_password_hash("s3cret!", ""));
    }

    #[test]
    fn test_each_hash_gets_its_own_salt() {
        let first = hash_password("s3cret!").unwrap();
        let second = hash_password("s3cret!").unwrap();
        assert_ne!(first, second);
        assert!(verify_password_hash("s3cret!", &second));
        assert_eq!(generate_secret_key().len(), SECRET_KEY_LENGTH);
    }
}
