use crate::encryption::ScryptParams;
use crate::CofferError;

// Plaintext header layout (all integers little-endian):
// | magic: u64 | salt: [u8;96] | n: u32 | r: u32 | p: u32 | disk_block_size: u32 | zeros: [u8;8] |
const H_MAGIC_OFFSET: usize = 0;
const H_SALT_OFFSET: usize = H_MAGIC_OFFSET + 8;
const H_N_OFFSET: usize = H_SALT_OFFSET + SALT_LENGTH;
const H_R_OFFSET: usize = H_N_OFFSET + 4;
const H_P_OFFSET: usize = H_R_OFFSET + 4;
const H_DISK_BLOCK_SIZE_OFFSET: usize = H_P_OFFSET + 4;
const H_TAIL_OFFSET: usize = H_DISK_BLOCK_SIZE_OFFSET + 4;

/// Magic constant at the start of every coffer file.
pub(crate) const HEADER_MAGIC: u64 = 0x0B0A713C;

/// Total header length; block data starts immediately after.
pub(crate) const HEADER_LENGTH: usize = 128;

/// Scrypt salt length.
pub(crate) const SALT_LENGTH: usize = 96;

/// Accepted range for the on-disk envelope size. The lower bound is the
/// envelope of a minimum (1 KiB) block; the upper bound caps what a
/// corrupt header can make an opener allocate.
pub(crate) const MIN_DISK_BLOCK_SIZE: u32 = 1112;
pub(crate) const MAX_DISK_BLOCK_SIZE: u32 = 196_608;

/// The fixed plaintext header. Written once at creation, never mutated.
///
/// Everything else in the file is sealed; this record carries exactly what
/// is needed to re-derive the ciphers (salt, scrypt work parameters) and
/// to locate block envelopes (disk_block_size).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub magic: u64,
    pub scrypt_salt: [u8; SALT_LENGTH],
    pub scrypt_n: u32,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
    pub disk_block_size: u32,
    pub tail_of_zeros: [u8; 8],
}

impl Header {
    pub(crate) fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[H_MAGIC_OFFSET..H_SALT_OFFSET].copy_from_slice(&self.magic.to_le_bytes());
        buf[H_SALT_OFFSET..H_N_OFFSET].copy_from_slice(&self.scrypt_salt);
        buf[H_N_OFFSET..H_R_OFFSET].copy_from_slice(&self.scrypt_n.to_le_bytes());
        buf[H_R_OFFSET..H_P_OFFSET].copy_from_slice(&self.scrypt_r.to_le_bytes());
        buf[H_P_OFFSET..H_DISK_BLOCK_SIZE_OFFSET].copy_from_slice(&self.scrypt_p.to_le_bytes());
        buf[H_DISK_BLOCK_SIZE_OFFSET..H_TAIL_OFFSET]
            .copy_from_slice(&self.disk_block_size.to_le_bytes());
        buf[H_TAIL_OFFSET..HEADER_LENGTH].copy_from_slice(&self.tail_of_zeros);
        buf
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<Header, CofferError> {
        if data.len() < HEADER_LENGTH {
            return Err(CofferError::BadHeader(format!(
                "header too short: {} < {}",
                data.len(),
                HEADER_LENGTH
            )));
        }
        let mut scrypt_salt = [0u8; SALT_LENGTH];
        scrypt_salt.copy_from_slice(&data[H_SALT_OFFSET..H_N_OFFSET]);
        let mut tail_of_zeros = [0u8; 8];
        tail_of_zeros.copy_from_slice(&data[H_TAIL_OFFSET..HEADER_LENGTH]);
        Ok(Header {
            magic: u64::from_le_bytes(data[H_MAGIC_OFFSET..H_SALT_OFFSET].try_into().unwrap()),
            scrypt_salt,
            scrypt_n: u32::from_le_bytes(data[H_N_OFFSET..H_R_OFFSET].try_into().unwrap()),
            scrypt_r: u32::from_le_bytes(data[H_R_OFFSET..H_P_OFFSET].try_into().unwrap()),
            scrypt_p: u32::from_le_bytes(
                data[H_P_OFFSET..H_DISK_BLOCK_SIZE_OFFSET].try_into().unwrap(),
            ),
            disk_block_size: u32::from_le_bytes(
                data[H_DISK_BLOCK_SIZE_OFFSET..H_TAIL_OFFSET].try_into().unwrap(),
            ),
            tail_of_zeros,
        })
    }

    pub(crate) fn scrypt_params(&self) -> ScryptParams {
        ScryptParams { n: self.scrypt_n, r: self.scrypt_r, p: self.scrypt_p }
    }

    /// Strict structural check, run before any key derivation.
    pub(crate) fn verify(&self) -> Result<(), CofferError> {
        if self.magic != HEADER_MAGIC {
            return Err(CofferError::BadHeader("invalid magic".to_string()));
        }
        if self.disk_block_size < MIN_DISK_BLOCK_SIZE || self.disk_block_size > MAX_DISK_BLOCK_SIZE
        {
            return Err(CofferError::BadHeader("invalid disk block size".to_string()));
        }
        if self.scrypt_salt.iter().all(|&b| b == 0) {
            return Err(CofferError::BadHeader("zero salt".to_string()));
        }
        if !self.scrypt_params().in_accepted_range() {
            return Err(CofferError::BadHeader("scrypt parameters out of range".to_string()));
        }
        if self.tail_of_zeros.iter().any(|&b| b != 0) {
            return Err(CofferError::BadHeader("trailing padding not zero".to_string()));
        }
        Ok(())
    }
}

// BlockZero layout (the plaintext of block 0):
// | block_size: u32 | disk_block_size: u32 | file_size: u64 | blocks_written: u64 |
const Z_BLOCK_SIZE_OFFSET: usize = 0;
const Z_DISK_BLOCK_SIZE_OFFSET: usize = Z_BLOCK_SIZE_OFFSET + 4;
const Z_FILE_SIZE_OFFSET: usize = Z_DISK_BLOCK_SIZE_OFFSET + 4;
const Z_BLOCKS_WRITTEN_OFFSET: usize = Z_FILE_SIZE_OFFSET + 8;

/// Serialized BlockZero length.
pub(crate) const BLOCK_ZERO_LENGTH: usize = Z_BLOCKS_WRITTEN_OFFSET + 8;

/// Mutable file metadata, stored sealed as block 0.
///
/// The engine's copy is authoritative; it is serialised on demand when
/// block 0 is flushed and never enters the block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockZero {
    /// Before-encryption block size: the plaintext capacity of one block.
    pub block_size: u32,
    /// Mirrors the header; lets the metadata block stand alone.
    pub disk_block_size: u32,
    /// Logical size of the byte stream.
    pub file_size: u64,
    /// Count of block-write operations (equals unique nonces generated).
    pub blocks_written: u64,
}

impl BlockZero {
    pub(crate) fn to_bytes(&self) -> [u8; BLOCK_ZERO_LENGTH] {
        let mut buf = [0u8; BLOCK_ZERO_LENGTH];
        buf[Z_BLOCK_SIZE_OFFSET..Z_DISK_BLOCK_SIZE_OFFSET]
            .copy_from_slice(&self.block_size.to_le_bytes());
        buf[Z_DISK_BLOCK_SIZE_OFFSET..Z_FILE_SIZE_OFFSET]
            .copy_from_slice(&self.disk_block_size.to_le_bytes());
        buf[Z_FILE_SIZE_OFFSET..Z_BLOCKS_WRITTEN_OFFSET]
            .copy_from_slice(&self.file_size.to_le_bytes());
        buf[Z_BLOCKS_WRITTEN_OFFSET..BLOCK_ZERO_LENGTH]
            .copy_from_slice(&self.blocks_written.to_le_bytes());
        buf
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<BlockZero, CofferError> {
        if data.len() < BLOCK_ZERO_LENGTH {
            return Err(CofferError::BadHeader(format!(
                "metadata block too short: {} < {}",
                data.len(),
                BLOCK_ZERO_LENGTH
            )));
        }
        Ok(BlockZero {
            block_size: u32::from_le_bytes(
                data[Z_BLOCK_SIZE_OFFSET..Z_DISK_BLOCK_SIZE_OFFSET].try_into().unwrap(),
            ),
            disk_block_size: u32::from_le_bytes(
                data[Z_DISK_BLOCK_SIZE_OFFSET..Z_FILE_SIZE_OFFSET].try_into().unwrap(),
            ),
            file_size: u64::from_le_bytes(
                data[Z_FILE_SIZE_OFFSET..Z_BLOCKS_WRITTEN_OFFSET].try_into().unwrap(),
            ),
            blocks_written: u64::from_le_bytes(
                data[Z_BLOCKS_WRITTEN_OFFSET..BLOCK_ZERO_LENGTH].try_into().unwrap(),
            ),
        })
    }
}
