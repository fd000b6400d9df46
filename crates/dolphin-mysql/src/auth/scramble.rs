//! Password scrambles.
//!
//! mysql_native_password:
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! caching_sha2_password fast path:
//! ```text
//! SHA256(password) XOR SHA256(SHA256(SHA256(password)) + seed)
//! ```
//!
//! Full authentication without TLS encrypts `password + NUL`, XORed with
//! the seed, under the server's RSA key with OAEP padding.

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Servers send a 20-byte seed, sometimes followed by a NUL.
pub fn trim_seed(seed: &[u8]) -> &[u8] {
    match seed {
        [head @ .., 0] if head.len() == 20 => head,
        _ => seed,
    }
}

fn xor<const N: usize>(a: [u8; N], b: [u8; N]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// mysql_native_password response; empty for an empty password.
pub fn native_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = &seed[..seed.len().min(20)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    xor(stage1, stage3)
}

/// caching_sha2_password fast-auth response; empty for an empty password.
pub fn caching_sha2_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = trim_seed(seed);

    let hash1: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash2: [u8; 32] = Sha256::digest(hash1).into();
    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(seed);
    let hash3: [u8; 32] = hasher.finalize().into();

    xor(hash1, hash3)
}

/// `password + NUL`, as sent over a secure channel.
pub fn cleartext(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Encrypt the password for full authentication on an insecure channel.
///
/// `public_key_pem` may be SPKI (`BEGIN PUBLIC KEY`) or PKCS#1.
pub fn rsa_encrypt_password(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
) -> Result<Vec<u8>, String> {
    let seed = trim_seed(seed);
    if seed.is_empty() {
        return Err("authentication seed is empty".to_string());
    }
    let mut plain = cleartext(password);
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| format!("server public key is not PEM text: {e}"))?;
    let key = RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| format!("cannot parse server RSA public key: {e}"))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| format!("RSA encryption failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Vec<u8> {
        (1..=20).collect()
    }

    #[test]
    fn native_password_vector() {
        assert_eq!(
            native_password("secret", &seed()),
            [
                0xb3, 0x2b, 0xb3, 0xa5, 0x83, 0xe1, 0x34, 0x0c, 0x0a, 0x11, 0x08, 0xd5, 0x8b, 0x1b,
                0xe4, 0x97, 0x81, 0xad, 0x8c, 0x2f,
            ]
        );
        assert!(native_password("", &seed()).is_empty());
    }

    #[test]
    fn caching_sha2_vector() {
        assert_eq!(
            caching_sha2_password("secret", &seed()),
            [
                0x74, 0x6e, 0xbe, 0x20, 0x5d, 0x56, 0xa0, 0x70, 0x7a, 0xcb, 0x3e, 0x79, 0x6e, 0x83,
                0x4e, 0x0d, 0xd7, 0xb1, 0xd6, 0x17, 0x43, 0xb2, 0x6b, 0xd5, 0x20, 0x2c, 0x7a, 0x62,
                0x32, 0x30, 0xc7, 0xc9,
            ]
        );
    }

    #[test]
    fn trailing_nul_is_ignored() {
        let mut with_nul = seed();
        with_nul.push(0);
        assert_eq!(
            caching_sha2_password("secret", &with_nul),
            caching_sha2_password("secret", &seed())
        );
        assert_eq!(
            native_password("secret", &with_nul),
            native_password("secret", &seed())
        );
    }

    #[test]
    fn rsa_encrypted_password_decrypts_to_masked_cleartext() {
        use rsa::RsaPrivateKey;
        use rsa::pkcs1::EncodeRsaPublicKey;
        use rsa::pkcs8::{EncodePublicKey, LineEnding};

        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        let spki = public.to_public_key_pem(LineEnding::LF).unwrap();
        let pkcs1 = public.to_pkcs1_pem(LineEnding::LF).unwrap();

        let mut with_nul = seed();
        with_nul.push(0);
        let expected: Vec<u8> = b"secret\0"
            .iter()
            .zip(seed().iter().cycle())
            .map(|(p, s)| p ^ s)
            .collect();

        for pem in [spki.as_bytes(), pkcs1.as_bytes()] {
            let cipher = rsa_encrypt_password("secret", &with_nul, pem).unwrap();
            assert_eq!(cipher.len(), 128);
            let plain = private
                .decrypt(rsa::Oaep::new::<Sha1>(), &cipher)
                .unwrap();
            assert_eq!(plain, expected);
        }
    }

    #[test]
    fn bad_public_key_is_reported() {
        let err = rsa_encrypt_password("pw", &seed(), b"not a key").unwrap_err();
        assert!(err.contains("RSA public key"));
    }
}
