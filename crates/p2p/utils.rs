use crate::types::NodeId;
use ethereum_types::U256;
use secp256k1::{PublicKey, SECP256K1, SecretKey};
use sha3::{Digest, Keccak256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Computes the node id from a public key: the trailing 160 bits of the
/// Keccak-256 digest of the compressed (33-byte) encoding.
pub fn node_id_from_public_key(public_key: &PublicKey) -> NodeId {
    let digest = Keccak256::digest(public_key.serialize());
    NodeId::from_slice(&digest[12..])
}

pub fn public_key_from_signing_key(signer: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(SECP256K1, signer)
}

pub fn node_id_from_signing_key(signer: &SecretKey) -> NodeId {
    node_id_from_public_key(&public_key_from_signing_key(signer))
}

/// XOR distance between two node ids, as an unsigned big-endian integer.
pub fn distance(a: &NodeId, b: &NodeId) -> U256 {
    U256::from_big_endian((*a ^ *b).as_bytes())
}

/// K-bucket index for `a` relative to `b`: the number of leading zero bits
/// of the XOR distance, in `0..160`. `None` for the zero distance (self).
pub fn bucket_index(a: &NodeId, b: &NodeId) -> Option<usize> {
    let d = distance(a, b);
    if d.is_zero() {
        return None;
    }
    Some(160 - d.bits())
}

pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn current_unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn get_msg_expiration_from_seconds(seconds: u64) -> u64 {
    (SystemTime::now() + Duration::from_secs(seconds))
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn is_msg_expired(expiration: u64) -> bool {
    // this cast to a signed integer is needed as the decoder doesn't take into
    // account the sign; a negative expiration would otherwise wrap around the
    // u64 and pass the check.
    (expiration as i64) < (current_unix_time() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn node_id_is_deterministic() {
        let signer = SecretKey::new(&mut OsRng);
        assert_eq!(node_id_from_signing_key(&signer), node_id_from_signing_key(&signer));
    }

    #[test]
    fn bucket_index_counts_leading_zeros() {
        let a = NodeId::zero();
        // Highest bit set: zero leading zeros.
        let mut far = [0u8; 20];
        far[0] = 0x80;
        assert_eq!(bucket_index(&a, &NodeId::from_slice(&far)), Some(0));

        // Lowest bit set: 159 leading zeros.
        let mut near = [0u8; 20];
        near[19] = 0x01;
        assert_eq!(bucket_index(&a, &NodeId::from_slice(&near)), Some(159));

        assert_eq!(bucket_index(&a, &a), None);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert!(distance(&a, &a).is_zero());
    }

    #[test]
    fn expired_messages_are_detected() {
        assert!(is_msg_expired(0));
        assert!(!is_msg_expired(get_msg_expiration_from_seconds(20)));
    }
}
