use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::Rng;

use crate::CofferError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Bytes derived from scrypt: three AES-256 keys (32 + 32 + 32).
const KEY_MATERIAL_LEN: usize = 96;

/// AES-256 key length.
const KEY_LEN: usize = 32;

/// Per-block nonce length: three independent 96-bit GCM nonces.
pub(crate) const NONCE_SIZE: usize = 36;

/// Length of one GCM sub-nonce.
const SUB_NONCE_SIZE: usize = 12;

// ---------------------------------------------------------------------------
// Scrypt parameters
// ---------------------------------------------------------------------------

/// Scrypt work parameters stored in the file header.
///
/// The named presets target wall-clock derivation times on a modern CPU;
/// anything between `MIN` and `MAX` (componentwise) is accepted when
/// opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptParams {
    pub n: u32,
    pub r: u32,
    pub p: u32,
}

impl ScryptParams {
    /// Minimum accepted parameters; derivation in tens of milliseconds.
    pub const MIN: ScryptParams = ScryptParams { n: 1 << 14, r: 4, p: 1 };

    /// Recommended default.
    pub const RECOMMENDED: ScryptParams = ScryptParams { n: 1 << 16, r: 64, p: 1 };

    /// Hardened preset, multi-second derivation.
    pub const BETTER: ScryptParams = ScryptParams { n: 1 << 18, r: 128, p: 1 };

    /// Upper limit; bounds the work an attacker can make an opener perform.
    pub const MAX: ScryptParams = ScryptParams { n: 1 << 18, r: 256, p: 1 };

    /// True if every component lies within `[MIN, MAX]`.
    pub fn in_accepted_range(&self) -> bool {
        self.n >= Self::MIN.n
            && self.n <= Self::MAX.n
            && self.r >= Self::MIN.r
            && self.r <= Self::MAX.r
            && self.p >= Self::MIN.p
            && self.p <= Self::MAX.p
    }
}

// ---------------------------------------------------------------------------
// Randomness
// ---------------------------------------------------------------------------

/// Fresh cryptographic randomness (rand's default RNG is a CSPRNG
/// reseeded from the OS).
pub(crate) fn rand_bytes(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::rng().fill(&mut buf[..]);
    buf
}

// ---------------------------------------------------------------------------
// Cipher set
// ---------------------------------------------------------------------------

/// Runtime ciphers for sealing/unsealing blocks.
///
/// Holds three AES-256-GCM instances keyed from contiguous 32-byte slices
/// of the scrypt output. The AEAD stores only the key schedule and its
/// encrypt/decrypt methods take `&self`, so this is Send + Sync.
pub(crate) struct CipherSet {
    aeads: [Aes256Gcm; 3],
}

impl std::fmt::Debug for CipherSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSet").finish_non_exhaustive()
    }
}

impl CipherSet {
    /// Derive the three block ciphers from a password and salt.
    ///
    /// Produces 96 bytes of key material via scrypt and splits it into
    /// three AES-256 keys. The scrypt crate takes log2(N), so N must be a
    /// power of two.
    pub(crate) fn derive(
        password: &[u8],
        salt: &[u8],
        params: ScryptParams,
    ) -> Result<CipherSet, CofferError> {
        if !params.n.is_power_of_two() {
            return Err(CofferError::Crypto(format!(
                "scrypt N must be a power of two, got {}",
                params.n
            )));
        }
        let log_n = params.n.trailing_zeros() as u8;
        // `scrypt::Params::new`'s `len` argument only validates metadata used by the
        // (unused, default-features-off) `PasswordHasher` impl; the actual output
        // length is controlled by the buffer passed to `scrypt::scrypt` below, which
        // accepts any non-empty length. `Params::new` restricts `len` to 10..=64, so
        // we pass a value in range rather than `KEY_MATERIAL_LEN` (96).
        let sp = scrypt::Params::new(log_n, params.r, params.p, scrypt::Params::RECOMMENDED_LEN)
            .map_err(|e| CofferError::Crypto(format!("scrypt parameters rejected: {}", e)))?;

        let mut key_material = [0u8; KEY_MATERIAL_LEN];
        scrypt::scrypt(password, salt, &sp, &mut key_material)
            .map_err(|e| CofferError::Crypto(format!("scrypt derivation failed: {}", e)))?;

        let aeads = [
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_material[..KEY_LEN])),
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(
                &key_material[KEY_LEN..2 * KEY_LEN],
            )),
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_material[2 * KEY_LEN..])),
        ];
        Ok(CipherSet { aeads })
    }

    /// Seal a block's plaintext under its block number.
    ///
    /// Generates a fresh 36-byte nonce and nests the three AEADs:
    /// c1 = aead0(p), c2 = aead1(c1), c3 = aead2(c2), each stage using its
    /// own 12-byte slice of the nonce. The block number rides along as
    /// associated data in every stage, so an envelope cannot be relocated
    /// to a different block index without failing authentication.
    pub(crate) fn seal(
        &self,
        plain_text: &[u8],
        block_no: u64,
    ) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CofferError> {
        let ad = block_no.to_le_bytes();
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut nonce[..]);

        let c1 = self.aeads[0]
            .encrypt(
                Nonce::from_slice(&nonce[..SUB_NONCE_SIZE]),
                Payload { msg: plain_text, aad: &ad },
            )
            .map_err(|_| CofferError::Crypto("block seal failed".to_string()))?;
        let c2 = self.aeads[1]
            .encrypt(
                Nonce::from_slice(&nonce[SUB_NONCE_SIZE..2 * SUB_NONCE_SIZE]),
                Payload { msg: &c1, aad: &ad },
            )
            .map_err(|_| CofferError::Crypto("block seal failed".to_string()))?;
        let c3 = self.aeads[2]
            .encrypt(
                Nonce::from_slice(&nonce[2 * SUB_NONCE_SIZE..]),
                Payload { msg: &c2, aad: &ad },
            )
            .map_err(|_| CofferError::Crypto("block seal failed".to_string()))?;
        Ok((c3, nonce))
    }

    /// Reverse of [`CipherSet::seal`]: peel the three AEAD layers in order
    /// 2, 1, 0. Any tag mismatch in any stage surfaces as an
    /// authentication error.
    pub(crate) fn unseal(
        &self,
        cipher_text: &[u8],
        block_no: u64,
        nonce: &[u8],
    ) -> Result<Vec<u8>, CofferError> {
        let ad = block_no.to_le_bytes();
        let auth_failed = || CofferError::Crypto("message authentication failed".to_string());

        let c2 = self.aeads[2]
            .decrypt(
                Nonce::from_slice(&nonce[2 * SUB_NONCE_SIZE..]),
                Payload { msg: cipher_text, aad: &ad },
            )
            .map_err(|_| auth_failed())?;
        let c1 = self.aeads[1]
            .decrypt(
                Nonce::from_slice(&nonce[SUB_NONCE_SIZE..2 * SUB_NONCE_SIZE]),
                Payload { msg: &c2, aad: &ad },
            )
            .map_err(|_| auth_failed())?;
        let plain = self.aeads[0]
            .decrypt(
                Nonce::from_slice(&nonce[..SUB_NONCE_SIZE]),
                Payload { msg: &c1, aad: &ad },
            )
            .map_err(|_| auth_failed())?;
        Ok(plain)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
