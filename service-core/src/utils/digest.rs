use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hex-encoded SHA-256 of `input`.
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Compare two byte strings without short-circuiting on the first
/// differing byte. Lengths are not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        let digest = sha256_hex(b"ist_secret");
        assert!(constant_time_eq(digest.as_bytes(), digest.as_bytes()));

        let tampered = format!("0{}", &digest[1..]);
        assert!(!constant_time_eq(digest.as_bytes(), tampered.as_bytes()));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
