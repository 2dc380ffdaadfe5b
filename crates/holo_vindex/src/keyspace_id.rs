//! Reversible mapping between 64-bit values and 8-byte keyspace ids.
//!
//! The permutation is a single DES block encryption under an all-zero key.
//! It is a distribution function, not a security boundary: the only
//! properties relied upon are determinism, uniform spread across the
//! keyspace, and exact invertibility.

use std::sync::OnceLock;

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;

use crate::error::{Result, VindexError};

/// Width in bytes of a keyspace id produced by [`vhash`].
pub const KEYSPACE_ID_LEN: usize = 8;

const NULL_KEY: [u8; 8] = [0u8; 8];

fn block_cipher() -> &'static Des {
    static CIPHER: OnceLock<Des> = OnceLock::new();
    CIPHER.get_or_init(|| Des::new(GenericArray::from_slice(&NULL_KEY)))
}

/// Hashes a value into its keyspace id.
pub fn vhash(value: u64) -> [u8; KEYSPACE_ID_LEN] {
    let mut block = GenericArray::clone_from_slice(&value.to_be_bytes());
    block_cipher().encrypt_block(&mut block);
    let mut out = [0u8; KEYSPACE_ID_LEN];
    out.copy_from_slice(&block);
    out
}

/// Recovers the value that [`vhash`] mapped to `ksid`.
pub fn vunhash(ksid: &[u8]) -> Result<u64> {
    if ksid.len() != KEYSPACE_ID_LEN {
        return Err(VindexError::InvalidKeyspaceId(hex::encode(ksid)));
    }
    let mut block = GenericArray::clone_from_slice(ksid);
    block_cipher().decrypt_block(&mut block);
    let mut raw = [0u8; KEYSPACE_ID_LEN];
    raw.copy_from_slice(&block);
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(hex::encode(vhash(0)), "8ca64de9c1b123a7");
        assert_eq!(vhash(1), *b"\x16k@\xb4J\xbaK\xd6");
        assert_eq!(hex::encode(vhash(2)), "06e7ea22ce92708f");
        assert_eq!(hex::encode(vhash(3)), "4eb190c9a2fa169c");
        assert_eq!(hex::encode(vhash(4)), "d2fd8867d50d2dfe");
        assert_eq!(hex::encode(vhash(5)), "70bb023c810ca87a");
        assert_eq!(hex::encode(vhash(6)), "f098480ac4c4be71");
    }

    #[test]
    fn unhash_inverts_hash() {
        for value in [0, 1, 2, 42, 1 << 32, u64::MAX - 1, u64::MAX] {
            assert_eq!(vunhash(&vhash(value)).unwrap(), value);
        }
        let mut seed = 0x9e37_79b9_7f4a_7c15u64;
        for _ in 0..1_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            assert_eq!(vunhash(&vhash(seed)).unwrap(), seed);
        }
    }

    #[test]
    fn unhash_rejects_wrong_lengths() {
        let err = vunhash(b"bogus").unwrap_err();
        assert_eq!(err.to_string(), "invalid keyspace id: 626f677573");

        let doubled = [vhash(1), vhash(1)].concat();
        let err = vunhash(&doubled).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid keyspace id: 166b40b44aba4bd6166b40b44aba4bd6"
        );
        assert!(matches!(vunhash(&[]), Err(VindexError::InvalidKeyspaceId(_))));
    }
}
