//! MSE/PE cryptographic primitives (spec §4.4.4): the Diffie-Hellman key
//! exchange, RC4 keystream derivation, and the padding-resync byte search
//! used because PadA/PadB have no length prefix on the wire.

use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use rc4::consts::U20;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};

use crate::InfoHash;

/// RC4 keyed with a 20-byte SHA-1 digest, the only key size this protocol
/// ever derives.
pub type Rc4Sha1 = Rc4<U20>;

/// The 768-bit MODP group used by MSE/PE (RFC 2409 Group 1), with
/// generator 2.
const PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD",
    "129024E088A67CC74020BBEA63B139B22514A08798E3404",
    "DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C",
    "245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406",
    "B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE",
    "65381FFFFFFFFFFFFFFFF",
);

const GENERATOR: u64 = 2;

/// Length of a DH public key on the wire: 768 bits.
pub const PUBLIC_KEY_LEN: usize = 96;

/// Random padding fields are bounded by this length on both sides (spec
/// §4.4.4 describes PadA/PadB as unknown-length but bounded in practice by
/// the reference implementations this protocol interops with).
pub const MAX_PAD_LEN: usize = 512;

fn prime() -> BigUint {
    BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16).expect("static prime is valid hex")
}

/// A local Diffie-Hellman keypair for one handshake attempt.
pub struct KeyPair {
    private: BigUint,
    pub public: BigUint,
}

impl KeyPair {
    /// Generates a fresh keypair: a private exponent is drawn uniformly
    /// from a secure RNG and raised as `generator^private mod prime`.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        // 160 bits of private exponent is the conventional choice for this
        // group, matching the security level of the RC4/SHA-1 primitives
        // layered on top of it.
        let private = rng.gen_biguint(160);
        let public = BigUint::from(GENERATOR).modpow(&private, &prime());
        Self { private, public }
    }

    /// Computes the shared secret `S = peer_public ^ private mod prime`.
    pub fn shared_secret(&self, peer_public: &BigUint) -> BigUint {
        peer_public.modpow(&self.private, &prime())
    }

    /// Serializes `self.public` as a fixed `PUBLIC_KEY_LEN`-byte big-endian
    /// integer, left-padded with zeroes.
    pub fn public_bytes(&self) -> Vec<u8> {
        to_fixed_be(&self.public, PUBLIC_KEY_LEN)
    }
}

/// Parses a peer's public key from its fixed-width wire representation.
pub fn public_key_from_bytes(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

fn to_fixed_be(n: &BigUint, len: usize) -> Vec<u8> {
    let bytes = n.to_bytes_be();
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

fn shared_secret_bytes(secret: &BigUint) -> Vec<u8> {
    to_fixed_be(secret, PUBLIC_KEY_LEN)
}

/// Which side of the handshake a derived RC4 stream flows towards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Initiator -> responder, keyed with `"keyA"`.
    InitiatorToResponder,
    /// Responder -> initiator, keyed with `"keyB"`.
    ResponderToInitiator,
}

/// Derives the RC4 stream cipher for one direction of traffic, discarding
/// the first 1024 bytes of keystream as required by MSE/PE.
pub fn derive_rc4(direction: Direction, secret: &BigUint, skey: &InfoHash) -> Rc4Sha1 {
    let label: &[u8] = match direction {
        Direction::InitiatorToResponder => b"keyA",
        Direction::ResponderToInitiator => b"keyB",
    };
    let mut hasher = Sha1::new();
    hasher.update(label);
    hasher.update(&shared_secret_bytes(secret));
    hasher.update(skey);
    let key = hasher.finalize();

    let mut cipher = Rc4Sha1::new((&key[..]).into());
    let mut discard = [0u8; 1024];
    cipher.apply_keystream(&mut discard);
    cipher
}

/// `HASH('req1', S)`: the 20-byte sentinel the responder searches for in
/// the initiator's stream to locate the end of PadA (spec §4.4.4).
pub fn req1(secret: &BigUint) -> [u8; 20] {
    digest_with_label(b"req1", &shared_secret_bytes(secret))
}

/// `HASH('req2', SKEY) XOR HASH('req3', S)`: what actually appears on the
/// wire right after `req1`, letting the responder recover `SKEY` without
/// it ever appearing in the clear.
pub fn req2_xor_req3(skey: &InfoHash, secret: &BigUint) -> [u8; 20] {
    let req2 = digest_with_label(b"req2", skey);
    let req3 = digest_with_label(b"req3", &shared_secret_bytes(secret));
    xor20(&req2, &req3)
}

/// Recovers the candidate `HASH('req2', SKEY)` from the wire value by
/// undoing the XOR with our own `HASH('req3', S)`.
pub fn recover_req2(wire_value: &[u8; 20], secret: &BigUint) -> [u8; 20] {
    let req3 = digest_with_label(b"req3", &shared_secret_bytes(secret));
    xor20(wire_value, &req3)
}

/// `HASH('req2', SKEY)`, computed directly, for matching a candidate
/// info hash's SKEY against the value recovered via [`recover_req2`].
pub fn req2(skey: &InfoHash) -> [u8; 20] {
    digest_with_label(b"req2", skey)
}

fn digest_with_label(label: &[u8], data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(label);
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Searches `haystack` for `needle`, the way both padding-resync steps of
/// MSE/PE locate the end of an unknown-length pad field (spec §4.4.4):
/// the responder searches for `req1(S)` right after PadA, and the
/// initiator searches for the first 8 bytes of its own keystream-B (since
/// decrypting an all-zero VC at the true offset yields the keystream
/// itself) right after PadB.
pub fn find_pattern(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_exchange_agrees_on_shared_secret() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let s_alice = alice.shared_secret(&bob.public);
        let s_bob = bob.shared_secret(&alice.public);
        assert_eq!(s_alice, s_bob);
    }

    #[test]
    fn test_public_bytes_are_fixed_width() {
        let pair = KeyPair::generate();
        assert_eq!(pair.public_bytes().len(), PUBLIC_KEY_LEN);
    }

    #[test]
    fn test_derived_rc4_streams_are_directional_and_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let secret = alice.shared_secret(&bob.public);
        let skey: InfoHash = [7u8; 20];

        let mut a_to_b_encrypt =
            derive_rc4(Direction::InitiatorToResponder, &secret, &skey);
        let mut a_to_b_decrypt =
            derive_rc4(Direction::InitiatorToResponder, &secret, &skey);

        let mut data = b"hello peer".to_vec();
        a_to_b_encrypt.apply_keystream(&mut data);
        assert_ne!(data, b"hello peer");
        a_to_b_decrypt.apply_keystream(&mut data);
        assert_eq!(data, b"hello peer");
    }

    #[test]
    fn test_req2_recovery_round_trip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let secret = alice.shared_secret(&bob.public);
        let skey: InfoHash = [9u8; 20];

        let wire_value = req2_xor_req3(&skey, &secret);
        let recovered = recover_req2(&wire_value, &secret);
        assert_eq!(recovered, req2(&skey));
    }

    #[test]
    fn test_find_pattern_locates_needle() {
        let haystack = b"randompadXXXXsentinelmore";
        let pos = find_pattern(haystack, b"sentinel").unwrap();
        assert_eq!(&haystack[pos..pos + 8], b"sentinel");
    }

    #[test]
    fn test_find_pattern_missing_returns_none() {
        assert!(find_pattern(b"no match here", b"sentinel").is_none());
    }
}
