use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::SystemTime;

use fs2::FileExt;
use lru::LruCache;

use crate::encryption::{self, CipherSet, ScryptParams, NONCE_SIZE};
use crate::header::{
    BlockZero, Header, HEADER_LENGTH, HEADER_MAGIC, SALT_LENGTH,
};

/// Smallest accepted before-encryption block size (1 KiB).
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Largest accepted before-encryption block size (128 KiB).
pub const MAX_BLOCK_SIZE: usize = 128 * 1024;

/// Minimum password length, in bytes.
const MIN_PASSWORD_LEN: usize = 20;

/// Cache capacity bounds: creation keeps the cap low so a fresh file
/// cannot pin unbounded dirty state; opening allows a larger cache.
const CREATE_CACHE_MAX: usize = 128;
const OPEN_CACHE_MAX: usize = 1024;

/// Stand-in envelope size used while deriving ciphers at creation time,
/// before the real size has been measured. Must pass header verification.
const PLACEHOLDER_DISK_BLOCK_SIZE: u32 = 2000;

/// Fixed per-block envelope overhead: nonce, length prefix, one GCM tag
/// per sealing layer.
const ENVELOPE_OVERHEAD: usize = NONCE_SIZE + 4 + 3 * 16;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CofferError {
    /// A rejected argument; engine state is unchanged.
    InvalidArgument(String),
    /// The plaintext header failed verification.
    BadHeader(String),
    /// Key derivation or seal/unseal failure, including any
    /// authentication failure on load.
    Crypto(String),
    /// Underlying file I/O failure.
    IoError(String),
    /// The file has been closed; every further operation returns this.
    Closed,
}

impl fmt::Display for CofferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CofferError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            CofferError::BadHeader(msg) => write!(f, "bad header: {}", msg),
            CofferError::Crypto(msg) => write!(f, "crypto: {}", msg),
            CofferError::IoError(msg) => write!(f, "I/O error: {}", msg),
            CofferError::Closed => write!(f, "file already closed"),
        }
    }
}

impl std::error::Error for CofferError {}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// A decrypted block held in the cache.
///
/// The plaintext may be shorter than the block size: an unfilled tail
/// block or a truncated block. A missing leading region (cursor placed
/// past the current tail) is materialised as zeros on first write.
struct CachedBlock {
    modified: bool,
    plain_text: Vec<u8>,
}

/// Everything mutable, guarded by one mutex.
struct CofferState {
    /// `None` once the file has been closed.
    file: Option<fs::File>,
    /// Sticky error: set by the first flush failure, replayed by every
    /// subsequent operation, replaced only by `Closed` on close.
    pending: Option<CofferError>,
    /// Authoritative metadata; block 0 is serialised from here on demand
    /// and never enters the cache.
    block_zero: BlockZero,
    cache: LruCache<i64, CachedBlock>,
    cursor: i64,
}

/// A seekable byte stream stored as independently sealed ciphertext
/// blocks in a single underlying file.
///
/// The API mirrors an ordinary file: read, write, positioned variants,
/// seek, truncate, sync, stat, close. All user bytes are encrypted under
/// password-derived keys with triple AES-256-GCM; only the fixed 128-byte
/// header is plaintext on disk.
///
/// Every public operation takes `&self` and serialises on an internal
/// mutex, so a `Coffer` can be shared across threads. Key derivation at
/// create/open can take seconds on the hardened presets; call those off
/// any latency-sensitive thread.
pub struct Coffer {
    name: String,
    header: Header,
    ciphers: CipherSet,
    state: Mutex<CofferState>,
}

/// Metadata snapshot returned by [`Coffer::stat`].
#[derive(Debug, Clone)]
pub struct CofferStat {
    pub name: String,
    /// Logical (before-encryption) size of the stream.
    pub size: u64,
    /// Size of the underlying file on disk.
    pub encrypted_size: u64,
    pub permissions: fs::Permissions,
    pub modified: SystemTime,
    /// On-disk envelope size per block.
    pub disk_block_size: u32,
    /// Before-encryption block size.
    pub block_size: u32,
    /// Block-write operations performed over the file's lifetime.
    pub blocks_written: u64,
    pub scrypt_salt: [u8; SALT_LENGTH],
    pub scrypt_params: ScryptParams,
}

/// Block index holding the byte at `offset`. Block 0 is the metadata
/// block, so user data starts at block 1.
fn block_no_for_offset(offset: i64, block_size: u32) -> i64 {
    offset / block_size as i64 + 1
}

/// File offset of block `block_no`'s envelope.
fn block_offset(disk_block_size: u32, block_no: i64) -> u64 {
    HEADER_LENGTH as u64 + disk_block_size as u64 * block_no as u64
}

/// Seal `plain_text` under `block_no` and write its envelope:
/// nonce, ciphertext length (u32 LE), ciphertext.
///
/// Oversized plaintext or ciphertext means a bookkeeping bug upstream,
/// not a recoverable condition.
fn write_envelope(
    file: &mut fs::File,
    block_zero: &mut BlockZero,
    ciphers: &CipherSet,
    block_no: i64,
    plain_text: &[u8],
) -> Result<(), CofferError> {
    if plain_text.len() > block_zero.block_size as usize {
        panic!(
            "block {} plaintext too large: {} > {}",
            block_no,
            plain_text.len(),
            block_zero.block_size
        );
    }
    file.seek(SeekFrom::Start(block_offset(block_zero.disk_block_size, block_no)))
        .map_err(|e| CofferError::IoError(e.to_string()))?;

    let (cipher_text, nonce) = ciphers.seal(plain_text, block_no as u64)?;
    if NONCE_SIZE + 4 + cipher_text.len() > block_zero.disk_block_size as usize {
        panic!(
            "block {} envelope too large: {} > {}",
            block_no,
            NONCE_SIZE + 4 + cipher_text.len(),
            block_zero.disk_block_size
        );
    }
    file.write_all(&nonce)
        .map_err(|e| CofferError::IoError(e.to_string()))?;
    file.write_all(&(cipher_text.len() as u32).to_le_bytes())
        .map_err(|e| CofferError::IoError(e.to_string()))?;
    file.write_all(&cipher_text)
        .map_err(|e| CofferError::IoError(e.to_string()))?;
    block_zero.blocks_written += 1;
    Ok(())
}

/// Read one block's envelope from disk.
///
/// Returns `Ok(None)` when the envelope starts at or past the end of the
/// file — the block does not exist yet, which the write path uses to
/// start fresh tail blocks.
fn read_envelope(
    file: &mut fs::File,
    disk_block_size: u32,
    block_no: i64,
) -> Result<Option<([u8; NONCE_SIZE], Vec<u8>)>, CofferError> {
    file.seek(SeekFrom::Start(block_offset(disk_block_size, block_no)))
        .map_err(|e| CofferError::IoError(e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    let mut filled = 0;
    while filled < NONCE_SIZE {
        let n = file
            .read(&mut nonce[filled..])
            .map_err(|e| CofferError::IoError(e.to_string()))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CofferError::IoError("could not read block nonce".to_string()));
        }
        filled += n;
    }

    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)
        .map_err(|e| CofferError::IoError(format!("could not read ciphertext length: {}", e)))?;
    let cipher_len = u32::from_le_bytes(len_buf) as usize;
    if NONCE_SIZE + 4 + cipher_len > disk_block_size as usize {
        // a valid envelope always fits its slot; anything else cannot
        // have been written by us
        return Err(CofferError::Crypto("invalid ciphertext length".to_string()));
    }

    let mut cipher_text = vec![0u8; cipher_len];
    file.read_exact(&mut cipher_text)
        .map_err(|e| CofferError::IoError(format!("could not read ciphertext: {}", e)))?;
    Ok(Some((nonce, cipher_text)))
}

impl CofferState {
    /// Flush one block to disk. A failure here poisons the engine: the
    /// error is latched into the sticky slot and returned.
    fn flush_block(
        &mut self,
        ciphers: &CipherSet,
        block_no: i64,
        plain_text: &[u8],
    ) -> Result<(), CofferError> {
        let result = match self.file.as_mut() {
            Some(file) => write_envelope(file, &mut self.block_zero, ciphers, block_no, plain_text),
            None => Err(CofferError::Closed),
        };
        if let Err(e) = &result {
            self.pending = Some(e.clone());
        }
        result
    }

    /// Serialise the authoritative metadata and flush it as block 0.
    fn flush_block_zero(&mut self, ciphers: &CipherSet) -> Result<(), CofferError> {
        let bytes = self.block_zero.to_bytes();
        self.flush_block(ciphers, 0, &bytes)
    }

    /// Ensure `block_no` is in the cache, loading and unsealing it from
    /// disk if needed. Returns false when the block does not exist on
    /// disk (end of file).
    fn load_block(&mut self, ciphers: &CipherSet, block_no: i64) -> Result<bool, CofferError> {
        if self.cache.get(&block_no).is_some() {
            return Ok(true);
        }
        let disk_block_size = self.block_zero.disk_block_size;
        let file = self.file.as_mut().ok_or(CofferError::Closed)?;
        let envelope = match read_envelope(file, disk_block_size, block_no)? {
            Some(envelope) => envelope,
            None => return Ok(false),
        };
        let plain_text = ciphers.unseal(&envelope.1, block_no as u64, &envelope.0)?;
        self.insert_block(ciphers, block_no, CachedBlock { modified: false, plain_text })?;
        Ok(true)
    }

    /// Insert a block, flushing whatever dirty block the insertion evicts.
    fn insert_block(
        &mut self,
        ciphers: &CipherSet,
        block_no: i64,
        block: CachedBlock,
    ) -> Result<(), CofferError> {
        if let Some((evicted_no, evicted)) = self.cache.push(block_no, block) {
            if evicted_no != block_no && evicted.modified {
                self.flush_block(ciphers, evicted_no, &evicted.plain_text)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl Coffer {
    /// Create a new encrypted file at `path`, truncating any existing one.
    ///
    /// `block_size` is the before-encryption block size; the on-disk
    /// envelope size is measured by sealing one random full block, since
    /// the AEAD overhead is deterministic. `cache_blocks` bounds how many
    /// decrypted blocks stay in memory.
    pub fn create(
        path: &str,
        password: &[u8],
        scrypt: ScryptParams,
        block_size: usize,
        cache_blocks: usize,
    ) -> Result<Coffer, CofferError> {
        if password.len() < MIN_PASSWORD_LEN {
            return Err(CofferError::InvalidArgument(format!(
                "password must be at least {} bytes",
                MIN_PASSWORD_LEN
            )));
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(CofferError::InvalidArgument(
                "block size must be between 1KB and 128KB".to_string(),
            ));
        }
        if !(1..=CREATE_CACHE_MAX).contains(&cache_blocks) {
            return Err(CofferError::InvalidArgument(format!(
                "cache capacity must be between 1 and {}",
                CREATE_CACHE_MAX
            )));
        }

        let mut header = Header {
            magic: HEADER_MAGIC,
            scrypt_salt: [0u8; SALT_LENGTH],
            scrypt_n: scrypt.n,
            scrypt_r: scrypt.r,
            scrypt_p: scrypt.p,
            disk_block_size: PLACEHOLDER_DISK_BLOCK_SIZE,
            tail_of_zeros: [0u8; 8],
        };
        header
            .scrypt_salt
            .copy_from_slice(&encryption::rand_bytes(SALT_LENGTH));
        header.verify()?;

        let ciphers = CipherSet::derive(password, &header.scrypt_salt, scrypt)?;

        // Measure the real envelope size by sealing one full block.
        let sample = encryption::rand_bytes(block_size);
        let (cipher_text, _) = ciphers.seal(&sample, 1)?;
        header.disk_block_size = (NONCE_SIZE + 4 + cipher_text.len()) as u32;

        let mut block_zero = BlockZero {
            block_size: block_size as u32,
            disk_block_size: header.disk_block_size,
            file_size: 0,
            blocks_written: 1,
        };

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| CofferError::IoError(format!("failed to create file: {}", e)))?;
        file.try_lock_exclusive()
            .map_err(|e| CofferError::IoError(format!("file is locked by another process: {}", e)))?;

        file.write_all(&header.to_bytes())
            .map_err(|e| CofferError::IoError(format!("failed to write header: {}", e)))?;

        let bytes = block_zero.to_bytes();
        write_envelope(&mut file, &mut block_zero, &ciphers, 0, &bytes)?;

        Ok(Coffer {
            name: path.to_string(),
            header,
            ciphers,
            state: Mutex::new(CofferState {
                file: Some(file),
                pending: None,
                block_zero,
                cache: LruCache::new(NonZeroUsize::new(cache_blocks).unwrap()),
                cursor: 0,
            }),
        })
    }

    /// Open an existing encrypted file read/write.
    ///
    /// Verifies the plaintext header, derives the ciphers (a wrong
    /// password shows up as an authentication failure on the metadata
    /// block), then loads block 0 for the authoritative block size and
    /// logical length.
    pub fn open(path: &str, password: &[u8], cache_blocks: usize) -> Result<Coffer, CofferError> {
        if !(1..=OPEN_CACHE_MAX).contains(&cache_blocks) {
            return Err(CofferError::InvalidArgument(format!(
                "cache capacity must be between 1 and {}",
                OPEN_CACHE_MAX
            )));
        }

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CofferError::IoError(format!("failed to open file: {}", e)))?;
        file.try_lock_exclusive()
            .map_err(|e| CofferError::IoError(format!("file is locked by another process: {}", e)))?;

        let mut header_bytes = [0u8; HEADER_LENGTH];
        file.read_exact(&mut header_bytes)
            .map_err(|e| CofferError::IoError(format!("failed to read header: {}", e)))?;
        let header = Header::from_bytes(&header_bytes)?;
        header.verify()?;

        let ciphers = CipherSet::derive(password, &header.scrypt_salt, header.scrypt_params())?;

        // Block 0 is read directly, never through the cache.
        let envelope = read_envelope(&mut file, header.disk_block_size, 0)?
            .ok_or_else(|| CofferError::IoError("missing metadata block".to_string()))?;
        let plain_text = ciphers.unseal(&envelope.1, 0, &envelope.0)?;
        let block_zero = BlockZero::from_bytes(&plain_text)?;
        if block_zero.disk_block_size != header.disk_block_size {
            return Err(CofferError::BadHeader(
                "metadata block disagrees with header".to_string(),
            ));
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&(block_zero.block_size as usize))
            || block_zero.block_size as usize + ENVELOPE_OVERHEAD
                > block_zero.disk_block_size as usize
        {
            return Err(CofferError::BadHeader(
                "invalid block size in metadata block".to_string(),
            ));
        }

        Ok(Coffer {
            name: path.to_string(),
            header,
            ciphers,
            state: Mutex::new(CofferState {
                file: Some(file),
                pending: None,
                block_zero,
                cache: LruCache::new(NonZeroUsize::new(cache_blocks).unwrap()),
                cursor: 0,
            }),
        })
    }

    /// Read from the cursor into `buf`. Returns the bytes read; a short
    /// count means the end of the stream was reached, and an exhausted
    /// stream returns 0.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, CofferError> {
        let mut state = self.state.lock().unwrap();
        self.read_locked(&mut state, buf)
    }

    /// Read starting at `offset`. Moves the cursor there first; it is not
    /// restored afterwards.
    pub fn read_at(&self, buf: &mut [u8], offset: i64) -> Result<usize, CofferError> {
        let mut state = self.state.lock().unwrap();
        if offset < 0 {
            return Err(CofferError::InvalidArgument("negative offset not allowed".to_string()));
        }
        state.cursor = offset;
        self.read_locked(&mut state, buf)
    }

    /// Write `buf` at the cursor, extending the stream as needed.
    pub fn write(&self, buf: &[u8]) -> Result<usize, CofferError> {
        let mut state = self.state.lock().unwrap();
        self.write_locked(&mut state, buf)
    }

    /// Write starting at `offset`. Moves the cursor there first; it is
    /// not restored afterwards. Offsets past the end of the stream are
    /// allowed and leave the gap unmaterialised.
    pub fn write_at(&self, buf: &[u8], offset: i64) -> Result<usize, CofferError> {
        let mut state = self.state.lock().unwrap();
        if offset < 0 {
            return Err(CofferError::InvalidArgument("negative offset not allowed".to_string()));
        }
        state.cursor = offset;
        self.write_locked(&mut state, buf)
    }

    /// Write a string at the cursor.
    pub fn write_str(&self, s: &str) -> Result<usize, CofferError> {
        self.write(s.as_bytes())
    }

    /// Move the cursor. Whence 0 is absolute (offset must be >= 0),
    /// whence 1 is cursor-relative, whence 2 counts `offset` bytes back
    /// from the end of the stream. Results past the end clamp to the
    /// stream size; negative results are an error. Returns the new cursor.
    pub fn seek(&self, offset: i64, whence: i32) -> Result<i64, CofferError> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = &state.pending {
            return Err(e.clone());
        }
        let file_size = state.block_zero.file_size as i64;
        let new_cursor = match whence {
            0 => {
                if offset < 0 {
                    return Err(CofferError::InvalidArgument(
                        "negative offset not allowed".to_string(),
                    ));
                }
                offset
            }
            1 => state.cursor + offset,
            2 => file_size - offset,
            _ => {
                return Err(CofferError::InvalidArgument("invalid whence value".to_string()));
            }
        };
        if new_cursor < 0 {
            return Err(CofferError::InvalidArgument(
                "absolute negative position not allowed".to_string(),
            ));
        }
        state.cursor = new_cursor.min(file_size);
        Ok(state.cursor)
    }

    /// Shrink the stream to `size` bytes. Growing is not supported:
    /// `size` must not exceed the current stream size.
    pub fn truncate(&self, size: i64) -> Result<(), CofferError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        if let Some(e) = &state.pending {
            return Err(e.clone());
        }
        if size < 0 || size as u64 > state.block_zero.file_size {
            return Err(CofferError::InvalidArgument("truncate size out of range".to_string()));
        }

        let block_size = state.block_zero.block_size as i64;
        let mut block_no = block_no_for_offset(size, state.block_zero.block_size);

        // A mid-block cut shortens that block's plaintext in place; the
        // block itself survives the truncation.
        let partial = size % block_size != 0;
        if partial {
            if !state.load_block(&self.ciphers, block_no)? {
                return Err(CofferError::IoError(
                    "could not load the block at the truncation point".to_string(),
                ));
            }
            if let Some(block) = state.cache.get_mut(&block_no) {
                block.plain_text.truncate((size % block_size) as usize);
                block.modified = true;
            }
            block_no += 1;
        }

        // Drop every cached block at or beyond the cut. Eviction rules
        // apply, so dirty ones flush first; the file truncation below
        // discards those writes.
        let stale: Vec<i64> = state
            .cache
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| *k >= block_no)
            .collect();
        for k in stale {
            if let Some(block) = state.cache.pop(&k) {
                if block.modified {
                    state.flush_block(&self.ciphers, k, &block.plain_text)?;
                }
            }
        }

        state.block_zero.file_size = size as u64;
        let new_len = block_offset(state.block_zero.disk_block_size, block_no);
        let file = state.file.as_mut().ok_or(CofferError::Closed)?;
        file.set_len(new_len)
            .map_err(|e| CofferError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Flush every dirty cached block and the metadata block, then fsync
    /// the underlying file.
    pub fn sync(&self) -> Result<(), CofferError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        if let Some(e) = &state.pending {
            return Err(e.clone());
        }
        let keys: Vec<i64> = state.cache.iter().map(|(k, _)| *k).collect();
        for k in keys {
            if let Some(block) = state.cache.pop(&k) {
                if block.modified {
                    state.flush_block(&self.ciphers, k, &block.plain_text)?;
                }
                state.cache.push(k, block);
            }
        }
        state.flush_block_zero(&self.ciphers)?;
        let file = state.file.as_mut().ok_or(CofferError::Closed)?;
        file.sync_all().map_err(|e| CofferError::IoError(e.to_string()))
    }

    /// Metadata snapshot: logical and on-disk sizes, block geometry, the
    /// block-write counter, and the key-derivation parameters.
    pub fn stat(&self) -> Result<CofferStat, CofferError> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = &state.pending {
            return Err(e.clone());
        }
        let file = state.file.as_mut().ok_or(CofferError::Closed)?;
        let meta = file
            .metadata()
            .map_err(|e| CofferError::IoError(e.to_string()))?;
        let modified = meta
            .modified()
            .map_err(|e| CofferError::IoError(e.to_string()))?;
        Ok(CofferStat {
            name: self.name.clone(),
            size: state.block_zero.file_size,
            encrypted_size: meta.len(),
            permissions: meta.permissions(),
            modified,
            disk_block_size: state.block_zero.disk_block_size,
            block_size: state.block_zero.block_size,
            blocks_written: state.block_zero.blocks_written,
            scrypt_salt: self.header.scrypt_salt,
            scrypt_params: self.header.scrypt_params(),
        })
    }

    /// The path this file was created/opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flush remaining dirty state, seal the metadata block, and release
    /// the underlying file.
    ///
    /// A poisoned engine replays its sticky error instead of closing.
    /// Flush failures during the close itself are not reported: the
    /// engine transitions to closed regardless. After a close, every
    /// further call — including another close — returns
    /// [`CofferError::Closed`].
    pub fn close(&self) -> Result<(), CofferError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        match &state.pending {
            Some(CofferError::Closed) => return Err(CofferError::Closed),
            Some(e) => return Err(e.clone()),
            None => {}
        }

        while let Some((block_no, block)) = state.cache.pop_lru() {
            if block.modified {
                let _ = state.flush_block(&self.ciphers, block_no, &block.plain_text);
            }
        }
        let _ = state.flush_block_zero(&self.ciphers);

        state.pending = Some(CofferError::Closed);
        state.file = None; // drops the handle and releases the process lock
        Ok(())
    }

    // -----------------------------------------------------------------
    // Locked internals — recursion targets; the mutex is already held
    // -----------------------------------------------------------------

    fn read_locked(&self, state: &mut CofferState, buf: &mut [u8]) -> Result<usize, CofferError> {
        if let Some(e) = &state.pending {
            return Err(e.clone());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if state.cursor >= state.block_zero.file_size as i64 {
            return Ok(0); // end of stream
        }

        let block_no = block_no_for_offset(state.cursor, state.block_zero.block_size);
        if !state.load_block(&self.ciphers, block_no)? {
            return Ok(0);
        }
        let block_size = state.block_zero.block_size as usize;
        let file_size = state.block_zero.file_size as i64;
        let ofs_start = (state.cursor % block_size as i64) as usize;

        let block = match state.cache.get(&block_no) {
            Some(block) => block,
            None => return Err(CofferError::IoError("block missing from cache".to_string())),
        };

        if block.plain_text.len() != block_size {
            // Short block: this is the tail of the stream, serve what it
            // holds and stop. ofs_start can sit past the plaintext end
            // after a truncation into a sparse tail block.
            let available = block.plain_text.len().saturating_sub(ofs_start);
            let n = available.min(buf.len());
            if n > 0 {
                buf[..n].copy_from_slice(&block.plain_text[ofs_start..ofs_start + n]);
            }
            state.cursor += n as i64;
            return Ok(n);
        }

        if buf.len() < block_size - ofs_start {
            // The whole request is inside this block.
            let n = buf.len();
            buf.copy_from_slice(&block.plain_text[ofs_start..ofs_start + n]);
            state.cursor += n as i64;
            return Ok(n);
        }

        // Fill up to the block boundary, then continue from the next block
        // unless the boundary is exactly the end of the stream.
        let partial = block_size - ofs_start;
        buf[..partial].copy_from_slice(&block.plain_text[ofs_start..]);
        state.cursor += partial as i64;
        if state.cursor == file_size {
            return Ok(partial);
        }
        let n = self.read_locked(state, &mut buf[partial..])?;
        Ok(partial + n)
    }

    fn write_locked(&self, state: &mut CofferState, buf: &[u8]) -> Result<usize, CofferError> {
        if let Some(e) = &state.pending {
            return Err(e.clone());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let block_no = block_no_for_offset(state.cursor, state.block_zero.block_size);
        if !state.load_block(&self.ciphers, block_no)? {
            // Past the current tail of the file: start a fresh block.
            let block = CachedBlock {
                modified: false,
                plain_text: Vec::with_capacity(state.block_zero.block_size as usize),
            };
            state.insert_block(&self.ciphers, block_no, block)?;
        }
        let block_size = state.block_zero.block_size as usize;
        let ofs_start = (state.cursor % block_size as i64) as usize;

        let block = match state.cache.get_mut(&block_no) {
            Some(block) => block,
            None => return Err(CofferError::IoError("block missing from cache".to_string())),
        };
        block.modified = true;

        // Writing past the block's current tail: pad the gap with zeros.
        if block.plain_text.len() < ofs_start {
            block.plain_text.resize(ofs_start, 0);
        }

        let available = block_size - ofs_start;
        if buf.len() < available {
            // The whole buffer lands inside this block.
            if block.plain_text.len() < ofs_start + buf.len() {
                block.plain_text.resize(ofs_start + buf.len(), 0);
            }
            block.plain_text[ofs_start..ofs_start + buf.len()].copy_from_slice(buf);
            state.cursor += buf.len() as i64;
            if state.cursor as u64 > state.block_zero.file_size {
                state.block_zero.file_size = state.cursor as u64;
            }
            Ok(buf.len())
        } else {
            // Fill this block to capacity and spill into the next.
            block.plain_text.truncate(ofs_start);
            block.plain_text.extend_from_slice(&buf[..available]);
            state.cursor += available as i64;
            if state.cursor as u64 > state.block_zero.file_size {
                state.block_zero.file_size = state.cursor as u64;
            }
            let n = self.write_locked(state, &buf[available..])?;
            Ok(available + n)
        }
    }
}

// ---------------------------------------------------------------------------
// std::io interop
// ---------------------------------------------------------------------------

impl io::Read for &Coffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Coffer::read(self, buf).map_err(io::Error::other)
    }
}

impl io::Write for &Coffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Coffer::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Coffer::sync(self).map_err(io::Error::other)
    }
}

impl io::Seek for &Coffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let n = match pos {
            SeekFrom::Start(offset) => Coffer::seek(self, offset as i64, 0),
            SeekFrom::Current(offset) => Coffer::seek(self, offset, 1),
            SeekFrom::End(offset) => Coffer::seek(self, -offset, 2),
        }
        .map_err(io::Error::other)?;
        Ok(n as u64)
    }
}

impl io::Read for Coffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Coffer::read(self, buf).map_err(io::Error::other)
    }
}

impl io::Write for Coffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Coffer::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Coffer::sync(self).map_err(io::Error::other)
    }
}

impl io::Seek for Coffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        io::Seek::seek(&mut &*self, pos)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::rand_bytes;
    use std::path::PathBuf;

    const PASSWORD: &[u8] = b"a very long password don't tell anybody";
    const BLOCK_SIZE: usize = 1024;

    /// Envelope size for 1 KiB blocks: nonce(36) + len(4) + 1024 + 3 tags(48).
    const DISK_BLOCK_SIZE: u64 = 1112;

    fn temp_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn create_at(path: &std::path::Path, cache_blocks: usize) -> Coffer {
        Coffer::create(
            path.to_str().unwrap(),
            PASSWORD,
            ScryptParams::MIN,
            BLOCK_SIZE,
            cache_blocks,
        )
        .unwrap()
    }

    #[test]
    fn sequential_write_read_round_trip() {
        let path = temp_path("coffer_seq_round_trip.coffer");
        let data = rand_bytes(BLOCK_SIZE * 3 + BLOCK_SIZE / 3);

        let f = create_at(&path, 1);
        assert_eq!(f.write(&data).unwrap(), data.len());
        f.close().unwrap();

        let f = Coffer::open(path.to_str().unwrap(), PASSWORD, 1).unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE * 5]; // bigger, purposely
        let n = f.read(&mut buf).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(&buf[..n], &data[..]);
        assert_eq!(f.read(&mut buf).unwrap(), 0);
        f.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn chunked_misaligned_writes() {
        let path = temp_path("coffer_chunked.coffer");
        let chunk = rand_bytes(256);

        let f = create_at(&path, 1);
        for _ in 0..20 {
            assert_eq!(f.write(&chunk).unwrap(), 256);
        }
        f.close().unwrap();

        let f = Coffer::open(path.to_str().unwrap(), PASSWORD, 1).unwrap();
        let mut buf = vec![0u8; 256 * 20];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(n, buf.len());
        for i in 0..20 {
            assert_eq!(&buf[i * 256..(i + 1) * 256], &chunk[..], "chunk {}", i);
        }
        f.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn no_plain_text_reaches_disk() {
        let path = temp_path("coffer_no_plaintext.coffer");
        let data = rand_bytes(128);

        let f = create_at(&path, 1);
        for _ in 0..100 {
            f.write(&data).unwrap();
        }
        f.close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(
            !raw.windows(data.len()).any(|w| w == &data[..]),
            "plaintext leaked to disk"
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncate_shrinks_stream_and_file() {
        let path = temp_path("coffer_truncate.coffer");
        let f = create_at(&path, 10);
        for _ in 0..1024 {
            f.write_str("HELLO").unwrap();
        }

        // out of range
        assert!(matches!(
            f.truncate(1024 * 1024),
            Err(CofferError::InvalidArgument(_))
        ));
        assert!(matches!(f.truncate(-123), Err(CofferError::InvalidArgument(_))));

        // block-aligned cut: blocks 0..4 survive
        f.truncate((BLOCK_SIZE * 4) as i64).unwrap();
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, HEADER_LENGTH as u64 + 5 * DISK_BLOCK_SIZE);

        let mut buf = vec![0u8; BLOCK_SIZE * 10];
        let n = f.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 4 * BLOCK_SIZE);

        // mid-block cut
        let new_len = BLOCK_SIZE + BLOCK_SIZE / 2;
        f.truncate(new_len as i64).unwrap();
        let n = f.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, new_len);

        f.close().unwrap();
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, HEADER_LENGTH as u64 + 3 * DISK_BLOCK_SIZE);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn seek_semantics() {
        let path = temp_path("coffer_seek.coffer");
        let f = create_at(&path, 10);
        for _ in 0..1024 {
            f.write_str("HELLO").unwrap();
        }
        let size = 5 * 1024i64;

        assert_eq!(f.seek(1000, 0).unwrap(), 1000);
        assert_eq!(f.seek(50, 1).unwrap(), 1050);
        assert_eq!(f.seek(50, 2).unwrap(), size - 50);
        assert_eq!(f.seek(-25, 1).unwrap(), size - 75);
        // past the end clamps to the stream size
        assert_eq!(f.seek(1_000_000_000_000, 0).unwrap(), size);

        assert!(f.seek(-25, 0).is_err());
        assert!(f.seek(12, 123).is_err());
        assert!(f.seek(-1_000_000_000_001, 1).is_err());

        f.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sparse_writes_and_unwritten_gaps() {
        let path = temp_path("coffer_sparse.coffer");
        let f = create_at(&path, 10);

        assert_eq!(f.write_at(b"Hello", 1_000_000_000).unwrap(), 5);
        assert_eq!(f.stat().unwrap().size, 1_000_000_005);

        let mut buf = [0u8; 100];
        let n = f.read_at(&mut buf, 1_000_000_000).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"Hello");

        f.sync().unwrap();

        // the gap was never written; its blocks cannot authenticate
        match f.read_at(&mut buf, 500_000_005) {
            Err(CofferError::Crypto(_)) => {}
            other => panic!("expected Crypto error, got {:?}", other),
        }

        f.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn anything_on_closed_file_fails() {
        let path = temp_path("coffer_closed.coffer");
        let f = create_at(&path, 1);
        f.close().unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(f.write_str("hola"), Err(CofferError::Closed));
        assert_eq!(f.write(&[1, 2]), Err(CofferError::Closed));
        assert_eq!(f.write_at(&[1, 2], 123), Err(CofferError::Closed));
        assert_eq!(f.read(&mut buf), Err(CofferError::Closed));
        assert_eq!(f.read_at(&mut buf, 123), Err(CofferError::Closed));
        assert_eq!(f.seek(0, 0), Err(CofferError::Closed));
        assert_eq!(f.truncate(0), Err(CofferError::Closed));
        assert_eq!(f.sync(), Err(CofferError::Closed));
        assert!(matches!(f.stat(), Err(CofferError::Closed)));
        assert_eq!(f.close(), Err(CofferError::Closed));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stat_reports_metadata() {
        let path = temp_path("coffer_stat.coffer");
        let f = create_at(&path, 10);
        for _ in 0..1024 {
            f.write_str("HELLO").unwrap();
        }

        let stat = f.stat().unwrap();
        assert_eq!(stat.size, 1024 * 5);
        assert_eq!(stat.name, f.name());
        // nothing evicted yet: header + metadata-block envelope only
        assert_eq!(stat.encrypted_size, 240);
        assert_eq!(stat.disk_block_size, DISK_BLOCK_SIZE as u32);
        assert_eq!(stat.block_size, BLOCK_SIZE as u32);
        assert_eq!(stat.blocks_written, 2);
        assert!(stat.scrypt_salt.iter().any(|&b| b != 0));
        assert_eq!(stat.scrypt_params, ScryptParams::MIN);

        f.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn flipped_envelope_bytes_fail_authentication() {
        // byte 10 lands in the nonce, byte 60 in the ciphertext
        for corrupt_at in [10u64, 60] {
            let path = temp_path(&format!("coffer_corrupt_{}.coffer", corrupt_at));
            let f = create_at(&path, 1);
            f.write(&rand_bytes(BLOCK_SIZE)).unwrap();
            f.close().unwrap();

            let mut raw = std::fs::read(&path).unwrap();
            let victim = HEADER_LENGTH as u64 + DISK_BLOCK_SIZE + corrupt_at;
            raw[victim as usize] ^= 0x01;
            std::fs::write(&path, &raw).unwrap();

            let f = Coffer::open(path.to_str().unwrap(), PASSWORD, 1).unwrap();
            let mut buf = vec![0u8; BLOCK_SIZE];
            match f.read(&mut buf) {
                Err(CofferError::Crypto(_)) => {}
                other => panic!("expected Crypto error, got {:?}", other),
            }
            let _ = f.close();
            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn corrupted_metadata_block_fails_open() {
        let path = temp_path("coffer_corrupt_block0.coffer");
        let f = create_at(&path, 1);
        f.close().unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[HEADER_LENGTH + 5] ^= 0x80;
        std::fs::write(&path, &raw).unwrap();

        match Coffer::open(path.to_str().unwrap(), PASSWORD, 1) {
            Err(CofferError::Crypto(_)) => {}
            other => panic!("expected Crypto error, got {:?}", other.map(|_| ())),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let path = temp_path("coffer_wrong_password.coffer");
        let f = create_at(&path, 1);
        f.write_str("something secret here").unwrap();
        f.close().unwrap();

        match Coffer::open(
            path.to_str().unwrap(),
            b"a different long password entirely!",
            1,
        ) {
            Err(CofferError::Crypto(_)) => {}
            other => panic!("expected Crypto error, got {:?}", other.map(|_| ())),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn same_data_different_salts_differ_on_disk() {
        let path_a = temp_path("coffer_salt_a.coffer");
        let path_b = temp_path("coffer_salt_b.coffer");
        let data = rand_bytes(BLOCK_SIZE);

        for path in [&path_a, &path_b] {
            let f = create_at(path, 1);
            f.write(&data).unwrap();
            f.close().unwrap();
        }

        let raw_a = std::fs::read(&path_a).unwrap();
        let raw_b = std::fs::read(&path_b).unwrap();
        // salts differ, so every sealed region differs
        assert_ne!(&raw_a[8..104], &raw_b[8..104]);
        let block1 = HEADER_LENGTH + DISK_BLOCK_SIZE as usize;
        assert_ne!(
            &raw_a[block1..block1 + DISK_BLOCK_SIZE as usize],
            &raw_b[block1..block1 + DISK_BLOCK_SIZE as usize]
        );
        let _ = std::fs::remove_file(&path_a);
        let _ = std::fs::remove_file(&path_b);
    }

    #[test]
    fn create_rejects_bad_arguments() {
        let path = temp_path("coffer_bad_args.coffer");
        let p = path.to_str().unwrap();

        assert!(matches!(
            Coffer::create(p, b"short", ScryptParams::MIN, BLOCK_SIZE, 1),
            Err(CofferError::InvalidArgument(_))
        ));
        assert!(matches!(
            Coffer::create(p, PASSWORD, ScryptParams::MIN, 512, 1),
            Err(CofferError::InvalidArgument(_))
        ));
        assert!(matches!(
            Coffer::create(p, PASSWORD, ScryptParams::MIN, 256 * 1024, 1),
            Err(CofferError::InvalidArgument(_))
        ));
        assert!(matches!(
            Coffer::create(p, PASSWORD, ScryptParams::MIN, BLOCK_SIZE, 0),
            Err(CofferError::InvalidArgument(_))
        ));
        assert!(matches!(
            Coffer::create(p, PASSWORD, ScryptParams::MIN, BLOCK_SIZE, 129),
            Err(CofferError::InvalidArgument(_))
        ));
        // out-of-range scrypt parameters are caught by header verification
        let params = ScryptParams { n: 1 << 10, r: 1, p: 1 };
        assert!(matches!(
            Coffer::create(p, PASSWORD, params, BLOCK_SIZE, 1),
            Err(CofferError::BadHeader(_))
        ));
    }

    #[test]
    fn open_rejects_bad_arguments_and_files() {
        let path = temp_path("coffer_bad_open.coffer");
        let p = path.to_str().unwrap();

        std::fs::File::create(&path).unwrap();
        assert!(matches!(
            Coffer::open(p, PASSWORD, 0),
            Err(CofferError::InvalidArgument(_))
        ));
        assert!(matches!(
            Coffer::open(p, PASSWORD, 1025),
            Err(CofferError::InvalidArgument(_))
        ));
        // empty file: no header to read
        assert!(matches!(Coffer::open(p, PASSWORD, 1), Err(CofferError::IoError(_))));

        // valid-looking but zeroed header
        std::fs::write(&path, [0u8; HEADER_LENGTH]).unwrap();
        assert!(matches!(Coffer::open(p, PASSWORD, 1), Err(CofferError::BadHeader(_))));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn positioned_io_rejects_negative_offsets() {
        let path = temp_path("coffer_negative_offsets.coffer");
        let f = create_at(&path, 1);
        let mut buf = [0u8; 4];
        assert!(matches!(
            f.read_at(&mut buf, -1),
            Err(CofferError::InvalidArgument(_))
        ));
        assert!(matches!(
            f.write_at(&buf, -1),
            Err(CofferError::InvalidArgument(_))
        ));
        f.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn overwrite_in_place_round_trips() {
        let path = temp_path("coffer_overwrite.coffer");
        let f = create_at(&path, 2);
        let data = rand_bytes(BLOCK_SIZE * 2);
        f.write(&data).unwrap();

        // overwrite a stripe crossing the block boundary
        let patch = rand_bytes(100);
        f.write_at(&patch, (BLOCK_SIZE - 50) as i64).unwrap();

        let mut expect = data.clone();
        expect[BLOCK_SIZE - 50..BLOCK_SIZE + 50].copy_from_slice(&patch);

        let mut buf = vec![0u8; BLOCK_SIZE * 2];
        let n = f.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, expect.len());
        assert_eq!(buf, expect);

        // still intact after a round trip through disk
        f.close().unwrap();
        let f = Coffer::open(path.to_str().unwrap(), PASSWORD, 2).unwrap();
        let n = f.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, expect.len());
        assert_eq!(buf, expect);
        f.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
