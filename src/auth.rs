//! Credential hashing for operator accounts.
//!
//! PBKDF2-HMAC-SHA256 with a per-account random salt. Stored as a single
//! TEXT column in the form `pbkdf2-sha256$<iterations>$<salt>$<hash>` so the
//! iteration count can be raised later without invalidating old accounts.
//! Plaintext passwords are never stored or logged.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

pub const PBKDF2_ITERATIONS: u32 = 600_000;
pub const HASH_LENGTH: usize = 32;
pub const SALT_LENGTH: usize = 32;

const SCHEME: &str = "pbkdf2-sha256";

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let salt = generate_salt();
    let mut derived = [0u8; HASH_LENGTH];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut derived);

    let encoded = format!(
        "{SCHEME}${PBKDF2_ITERATIONS}${}${}",
        B64.encode(salt),
        B64.encode(derived)
    );
    derived.zeroize();
    encoded
}

/// Verify a password against a stored hash string. Comparison of the derived
/// key is constant-time; a malformed stored value verifies as false rather
/// than erroring, so login failures stay indistinguishable to the caller.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((iterations, salt, expected)) = parse_stored(stored) else {
        return false;
    };

    let mut derived = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut derived);
    let matched = bool::from(derived.ct_eq(&expected));
    derived.zeroize();
    matched
}

fn parse_stored(stored: &str) -> Option<(u32, Vec<u8>, Vec<u8>)> {
    let mut parts = stored.split('$');
    if parts.next()? != SCHEME {
        return None;
    }
    let iterations: u32 = parts.next()?.parse().ok()?;
    let salt = B64.decode(parts.next()?).ok()?;
    let hash = B64.decode(parts.next()?).ok()?;
    if parts.next().is_some() || iterations == 0 || hash.is_empty() {
        return None;
    }
    Some((iterations, salt, hash))
}

/// Generate a cryptographically random salt
fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
