//! EIP-191-over-Keccak-256 signature codec, secp256k1 recovery.
//!
//! This crate knows nothing about session keys or permissions; it only
//! builds the two wire messages the engine signs over, hashes them with
//! the Ethereum `personal_sign` prefix convention, and recovers the
//! signer address from a 65-byte `r || s || v` signature.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1};
use session_error::{Result, SessionError};
use sha3::{Digest, Keccak256};

pub const ADDRESS_LEN: usize = 20;
pub const SIGNATURE_LEN: usize = 65;

/// Builds the byte message signed for a spend request. `amount_str` is
/// the caller-supplied decimal exactly as given — the verifier compares
/// exact bytes, it does not re-normalize the amount before hashing.
pub fn spend_message(to: &str, amount_str: &str, nonce: u64, timestamp: i64) -> Vec<u8> {
    format!(
        "Alancoin|{}|{}|{}|{}",
        to.to_lowercase(),
        amount_str,
        nonce,
        timestamp
    )
    .into_bytes()
}

/// Builds the byte message signed for a delegation request.
pub fn delegation_message(child_pub: &str, max_total: &str, nonce: u64, timestamp: i64) -> Vec<u8> {
    format!(
        "AlancoinDelegate|{}|{}|{}|{}",
        child_pub.to_lowercase(),
        max_total,
        nonce,
        timestamp
    )
    .into_bytes()
}

/// `keccak256("\x19Ethereum Signed Message:\n" + ascii(len(msg)) + msg)`.
pub fn eip191_hash(msg: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", msg.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(msg);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Parses a `0x`-prefixed or bare hex signature into its 65 raw bytes.
pub fn parse_signature_hex(sig_hex: &str) -> Result<[u8; SIGNATURE_LEN]> {
    let stripped = sig_hex.strip_prefix("0x").unwrap_or(sig_hex);
    let bytes = hex::decode(stripped)
        .map_err(|e| SessionError::InvalidSignature(format!("bad hex: {e}")))?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(SessionError::InvalidSignature(format!(
            "expected {SIGNATURE_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Validates and lowercases a `0x`-prefixed 40-hex-char address.
pub fn parse_address(addr: &str) -> Result<String> {
    if !addr.starts_with("0x") && !addr.starts_with("0X") {
        return Err(SessionError::InvalidPublicKey(addr.to_string()));
    }
    let hex_part = &addr[2..];
    if hex_part.len() != ADDRESS_LEN * 2 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SessionError::InvalidPublicKey(addr.to_string()));
    }
    Ok(format!("0x{}", hex_part.to_lowercase()))
}

/// Recovers the signer address from a 65-byte `r || s || v` signature
/// over `hash`. `v` is normalized to `{0, 1}` by subtracting 27 when
/// `v >= 27`, matching the Ethereum convention.
pub fn recover_address(hash: [u8; 32], sig_bytes: &[u8]) -> Result<String> {
    if sig_bytes.len() != SIGNATURE_LEN {
        return Err(SessionError::InvalidSignature(format!(
            "expected {SIGNATURE_LEN} bytes, got {}",
            sig_bytes.len()
        )));
    }
    let mut v = sig_bytes[64];
    if v >= 27 {
        v -= 27;
    }
    let recovery_id = RecoveryId::from_i32(v as i32)
        .map_err(|e| SessionError::InvalidSignature(format!("bad recovery id: {e}")))?;
    let recoverable = RecoverableSignature::from_compact(&sig_bytes[..64], recovery_id)
        .map_err(|e| SessionError::InvalidSignature(format!("bad signature bytes: {e}")))?;
    let message = Message::from_slice(&hash)
        .map_err(|e| SessionError::InvalidSignature(format!("bad message hash: {e}")))?;

    let secp = Secp256k1::new();
    let public_key = secp
        .recover_ecdsa(&message, &recoverable)
        .map_err(|e| SessionError::InvalidSignature(format!("recovery failed: {e}")))?;

    let uncompressed = public_key.serialize_uncompressed();
    debug_assert_eq!(uncompressed[0], 0x04);
    let digest = Keccak256::digest(&uncompressed[1..]);
    Ok(format!("0x{}", hex::encode(&digest[12..])))
}

/// Recovers the signer over `msg` (after EIP-191 hashing) and compares it
/// case-insensitively against `expected_addr`.
pub fn verify(msg: &[u8], sig_hex: &str, expected_addr: &str) -> Result<()> {
    let sig_bytes = parse_signature_hex(sig_hex)?;
    let hash = eip191_hash(msg);
    let recovered = recover_address(hash, &sig_bytes)?;
    if recovered.eq_ignore_ascii_case(expected_addr) {
        Ok(())
    } else {
        Err(SessionError::SignatureMismatch)
    }
}

/// Test/demo helper: sign `msg` (after EIP-191 hashing) with a raw
/// secp256k1 secret key, producing the `r || s || v` 65-byte signature
/// used throughout this crate and the engine above it.
pub fn sign_message(secret_key: &secp256k1::SecretKey, msg: &[u8]) -> Vec<u8> {
    let hash = eip191_hash(msg);
    let message = Message::from_slice(&hash).expect("32-byte hash is a valid message");
    let secp = Secp256k1::new();
    let (recovery_id, sig) = secp
        .sign_ecdsa_recoverable(&message, secret_key)
        .serialize_compact();
    let mut out = Vec::with_capacity(SIGNATURE_LEN);
    out.extend_from_slice(&sig);
    out.push(27 + recovery_id.to_i32() as u8);
    out
}

/// Test/demo helper: derives the lowercase `0x`-address for a public key,
/// the same way [`recover_address`] derives one from a recovered key.
pub fn address_from_public_key(public_key: &secp256k1::PublicKey) -> String {
    let uncompressed = public_key.serialize_uncompressed();
    let digest = Keccak256::digest(&uncompressed[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use secp256k1::Secp256k1;

    fn test_keypair() -> (secp256k1::SecretKey, secp256k1::PublicKey) {
        let secp = Secp256k1::new();
        let mut rng = StdRng::from_seed([7u8; 32]);
        secp.generate_keypair(&mut rng)
    }

    #[test]
    fn spend_message_matches_wire_format() {
        let msg = spend_message("0xRecipient", "0.50", 1, 1000);
        assert_eq!(
            String::from_utf8(msg).unwrap(),
            "Alancoin|0xrecipient|0.50|1|1000"
        );
    }

    #[test]
    fn sign_and_recover_round_trip() {
        let (sk, pk) = test_keypair();
        let addr = address_from_public_key(&pk);
        let msg = spend_message("0xabc0000000000000000000000000000000000a", "1.25", 4, 1234);
        let sig = sign_message(&sk, &msg);
        let hash = eip191_hash(&msg);
        let recovered = recover_address(hash, &sig).unwrap();
        assert_eq!(recovered, addr);
        assert!(verify(&msg, &hex::encode(&sig), &addr).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_signer() {
        let (sk, _pk) = test_keypair();
        let (_sk2, pk2) = test_keypair();
        let other_addr = address_from_public_key(&pk2);
        let msg = spend_message("0xabc0000000000000000000000000000000000a", "1.00", 1, 1);
        let sig = sign_message(&sk, &msg);
        let err = verify(&msg, &hex::encode(&sig), &other_addr).unwrap_err();
        assert_eq!(err.code(), "signature_mismatch");
    }

    #[test]
    fn rejects_malformed_signature_length() {
        let err = parse_signature_hex("0xdead").unwrap_err();
        assert_eq!(err.code(), "invalid_signature");
    }

    #[test]
    fn parse_address_lowercases_and_validates() {
        let addr = parse_address("0xABCDEF0000000000000000000000000000000A").unwrap();
        assert_eq!(addr, "0xabcdef0000000000000000000000000000000a");
        assert!(parse_address("not-an-address").is_err());
        assert!(parse_address("0x1234").is_err());
    }
}
