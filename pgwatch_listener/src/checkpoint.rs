//! Persistence of the last dispatched sequence id per channel.
//!
//! A listener loads its checkpoints at start and replays every channel from there, so a process
//! restart gets the same at-least-once treatment as a reconnect.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use pgwatch_id::ChannelSequences;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("invalid checkpoint file identifier")]
    InvalidFile,

    #[error("checkpoint file is truncated")]
    Truncated,

    #[error("crc32 checksum mismatch")]
    Crc32Mismatch,

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

#[async_trait]
pub trait CheckpointStore: Debug + Send + Sync + 'static {
    /// The last saved state, empty if nothing was saved yet
    async fn load(&self) -> Result<ChannelSequences>;

    async fn save(&self, sequences: &ChannelSequences) -> Result<()>;
}

/// Keeps checkpoints for the life of the process only. The default store of a listener.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    sequences: Mutex<ChannelSequences>,
}

impl InMemoryCheckpointStore {
    pub fn new(initial: ChannelSequences) -> Self {
        Self {
            sequences: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> ChannelSequences {
        self.sequences.lock().clone()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self) -> Result<ChannelSequences> {
        Ok(self.get())
    }

    async fn save(&self, sequences: &ChannelSequences) -> Result<()> {
        *self.sequences.lock() = sequences.clone();
        Ok(())
    }
}

/// The first bytes of a checkpoint file, identifying it and its version.
const FILE_TYPE_IDENTIFIER: &[u8] = b"pgwatch.ckpt.001";
const CHECKSUM_LEN: usize = size_of::<u32>();

/// Stores checkpoints in a single local file.
///
/// Each save writes a sibling temporary file and renames it over the target, so a crash leaves
/// either the previous or the new checkpoint in place.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<ChannelSequences> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => deserialize(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ChannelSequences::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, sequences: &ChannelSequences) -> Result<()> {
        let bytes = serialize(sequences)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn serialize(sequences: &ChannelSequences) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(sequences)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data);
    let checksum = hasher.finalize();

    let mut buf = Vec::with_capacity(FILE_TYPE_IDENTIFIER.len() + CHECKSUM_LEN + data.len());
    buf.extend_from_slice(FILE_TYPE_IDENTIFIER);
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&data);
    Ok(buf)
}

fn deserialize(contents: &[u8]) -> Result<ChannelSequences> {
    let Some(rest) = contents.strip_prefix(FILE_TYPE_IDENTIFIER) else {
        return Err(CheckpointError::InvalidFile);
    };
    if rest.len() < CHECKSUM_LEN {
        return Err(CheckpointError::Truncated);
    }
    let (checksum, data) = rest.split_at(CHECKSUM_LEN);
    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(checksum);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    if hasher.finalize() != u32::from_be_bytes(expected) {
        return Err(CheckpointError::Crc32Mismatch);
    }

    Ok(serde_json::from_slice(data)?)
}
