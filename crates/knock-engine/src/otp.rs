//! One-time port sequence derivation.
//!
//! A loose cousin of RFC 4226 HOTP: the moving factor is `unix_seconds / 30`
//! and the dynamic-truncate-then-modulo step is replaced by taking four
//! digest bytes directly, each shifted into the high byte of a port number.
//! The sequences rotate with the clock, so possession of the shared secret
//! plus a roughly-synchronized clock is the whole authentication story.

use anyhow::{anyhow, ensure, Result};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::secrets::Secret;

type HmacSha1 = Hmac<Sha1>;

/// Every knock sequence is four ports long.
pub const SEQUENCE_LEN: usize = 4;

/// An ordered tuple of destination ports constituting one authentication.
pub type PortSequence = [u16; SEQUENCE_LEN];

/// Sequences rotate on 30-second wall-clock boundaries.
pub const SLOT_SECONDS: u64 = 30;

/// Freshly generated secrets are 20 bytes, matching the SHA-1 block math.
pub const GENERATED_SECRET_LEN: usize = 20;

/// Derive the port sequence for one time slot.
///
/// `H = HMAC-SHA1(secret, slot as u64 big-endian)`, `offset = H[19] & 0x0F`,
/// then `port_i = H[offset + i] << 8`. The low byte of every port is zero —
/// 256 effective values, not 65536. Changing the truncation breaks every
/// deployed client, so both ends carry it as-is.
pub fn ports_for_slot(secret: &Secret, slot: u64) -> Result<PortSequence> {
    ensure!(!secret.as_bytes().is_empty(), "secret must not be empty");

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow!("secret rejected as hmac key"))?;
    mac.update(&slot.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let mut ports = [0u16; SEQUENCE_LEN];
    for (i, port) in ports.iter_mut().enumerate() {
        *port = u16::from(digest[offset + i]) << 8;
    }
    Ok(ports)
}

/// Derive the port sequence valid at a unix timestamp.
pub fn ports_at(secret: &Secret, unix_secs: u64) -> Result<PortSequence> {
    ports_for_slot(secret, unix_secs / SLOT_SECONDS)
}

/// Generate a fresh shared secret, base32-encoded without padding, ready to
/// be written to a secret file and distributed to trusted clients.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; GENERATED_SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Secret {
        Secret::from_bytes(vec![0u8; 20]).unwrap()
    }

    #[test]
    fn test_known_vectors() {
        // Precomputed HMAC-SHA1 truncations for a 20-zero-byte secret.
        let k = secret();
        assert_eq!(
            ports_for_slot(&k, 56_666_666).unwrap(),
            [0x6300, 0xED00, 0x6100, 0x4300]
        );
        assert_eq!(
            ports_for_slot(&k, 42).unwrap(),
            [35840, 8960, 21760, 30464]
        );
    }

    #[test]
    fn test_same_slot_same_sequence() {
        let k = secret();
        let a = ports_for_slot(&k, 56_666_667).unwrap();
        let b = ports_for_slot(&k, 56_666_667).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_times_within_slot_agree() {
        let k = secret();
        // 1_700_000_010 is exactly on a slot boundary; the next 29 seconds
        // share its moving factor.
        let base = ports_at(&k, 1_700_000_010).unwrap();
        assert_eq!(ports_at(&k, 1_700_000_011).unwrap(), base);
        assert_eq!(ports_at(&k, 1_700_000_039).unwrap(), base);
        assert_ne!(ports_at(&k, 1_700_000_040).unwrap(), base);
    }

    #[test]
    fn test_adjacent_slots_differ() {
        let k = secret();
        let a = ports_for_slot(&k, 100).unwrap();
        let b = ports_for_slot(&k, 101).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_secrets_differ() {
        let a = Secret::from_bytes(vec![0u8; 20]).unwrap();
        let b = Secret::from_bytes(vec![1u8; 20]).unwrap();
        assert_ne!(
            ports_for_slot(&a, 42).unwrap(),
            ports_for_slot(&b, 42).unwrap()
        );
    }

    #[test]
    fn test_low_byte_always_zero() {
        let k = secret();
        for slot in 0..64 {
            for port in ports_for_slot(&k, slot).unwrap() {
                assert_eq!(port & 0x00ff, 0, "slot {slot} port {port:#06x}");
            }
        }
    }

    #[test]
    fn test_generated_secret_decodes() {
        let encoded = generate_secret();
        let decoded = BASE32_NOPAD.decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.len(), GENERATED_SECRET_LEN);
    }

    #[test]
    fn test_generated_secrets_unique() {
        assert_ne!(generate_secret(), generate_secret());
    }
}
