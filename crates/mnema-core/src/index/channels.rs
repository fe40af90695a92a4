//! # Content Channels
//!
//! Append-only byte streams holding raw link contents. Contents append into
//! the current channel until it reaches the configured size, then a new
//! channel file opens, up to the configured channel count; once the count is
//! reached the last channel keeps growing. A manifest records every channel
//! and its size and is verified on load.

use crate::types::MnemaError;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MANIFEST_MAGIC: [u8; 4] = *b"MNMC";
const MANIFEST_VERSION: u8 = 1;
const MANIFEST_FILE: &str = "channels.manifest";

fn io_err(context: &str, e: std::io::Error) -> MnemaError {
    MnemaError::IoError(format!("{context}: {e}"))
}

// =============================================================================
// CONTENT REFERENCES
// =============================================================================

/// Location of one stored string: `(channel, offset, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ContentRef {
    pub channel: u32,
    pub offset: u64,
    pub len: u32,
}

// =============================================================================
// MANIFEST
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Manifest {
    channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ChannelEntry {
    id: u32,
    size: u64,
}

// =============================================================================
// CHANNEL SET
// =============================================================================

struct Channel {
    id: u32,
    size: u64,
    file: File,
}

/// The set of open channel files of one repository directory.
pub(crate) struct ChannelSet {
    dir: PathBuf,
    max_channels: u32,
    max_channel_size: u64,
    channels: Vec<Channel>,
}

impl ChannelSet {
    fn channel_path(dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("strings_{id}.channel"))
    }

    /// Open a fresh, empty channel set.
    pub(crate) fn create(
        dir: &Path,
        max_channels: u32,
        max_channel_size: u64,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_channels: max_channels.max(1),
            max_channel_size: max_channel_size.max(1),
            channels: Vec::new(),
        }
    }

    /// Open the channels recorded in the manifest, verifying each file's
    /// size against it.
    pub(crate) fn load(
        dir: &Path,
        max_channels: u32,
        max_channel_size: u64,
    ) -> Result<Self, MnemaError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(Self::create(dir, max_channels, max_channel_size));
        }
        let bytes = std::fs::read(&manifest_path).map_err(|e| io_err("read manifest", e))?;
        if bytes.len() < 5 || bytes[0..4] != MANIFEST_MAGIC || bytes[4] != MANIFEST_VERSION {
            return Err(MnemaError::SerializationError(
                "channel manifest is malformed".to_string(),
            ));
        }
        let manifest: Manifest = postcard::from_bytes(&bytes[5..])
            .map_err(|e| MnemaError::SerializationError(format!("parse manifest: {e}")))?;

        let mut channels = Vec::with_capacity(manifest.channels.len());
        for entry in &manifest.channels {
            let path = Self::channel_path(dir, entry.id);
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .open(&path)
                .map_err(|e| io_err("open channel", e))?;
            let on_disk = file.metadata().map_err(|e| io_err("stat channel", e))?.len();
            if on_disk != entry.size {
                return Err(MnemaError::SerializationError(format!(
                    "channel {} is {} bytes, manifest records {}",
                    entry.id, on_disk, entry.size
                )));
            }
            channels.push(Channel {
                id: entry.id,
                size: entry.size,
                file,
            });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            max_channels: max_channels.max(1),
            max_channel_size: max_channel_size.max(1),
            channels,
        })
    }

    /// Append one string, rolling to a new channel when the current one is
    /// full and the channel cap allows it.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<ContentRef, MnemaError> {
        let need_new = match self.channels.last() {
            None => true,
            Some(last) => {
                last.size.saturating_add(bytes.len() as u64) > self.max_channel_size
                    && (self.channels.len() as u32) < self.max_channels
            }
        };
        if need_new {
            let id = self.channels.len() as u32;
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(Self::channel_path(&self.dir, id))
                .map_err(|e| io_err("create channel", e))?;
            self.channels.push(Channel { id, size: 0, file });
        }
        // `last_mut` cannot fail here; a channel was just ensured.
        let Some(channel) = self.channels.last_mut() else {
            return Err(MnemaError::InvalidState("no open channel".to_string()));
        };
        channel
            .file
            .write_all(bytes)
            .map_err(|e| io_err("append to channel", e))?;
        let offset = channel.size;
        channel.size += bytes.len() as u64;
        Ok(ContentRef {
            channel: channel.id,
            offset,
            len: bytes.len() as u32,
        })
    }

    /// Read one stored string back.
    pub(crate) fn read(&self, content: ContentRef) -> Result<Vec<u8>, MnemaError> {
        let channel = self
            .channels
            .iter()
            .find(|c| c.id == content.channel)
            .ok_or_else(|| {
                MnemaError::IoError(format!("unknown channel {}", content.channel))
            })?;
        let mut file = &channel.file;
        file.seek(SeekFrom::Start(content.offset))
            .map_err(|e| io_err("seek channel", e))?;
        let mut buffer = vec![0u8; content.len as usize];
        file.read_exact(&mut buffer)
            .map_err(|e| io_err("read channel", e))?;
        Ok(buffer)
    }

    /// Persist the manifest for the current channel layout.
    pub(crate) fn write_manifest(&self) -> Result<(), MnemaError> {
        let manifest = Manifest {
            channels: self
                .channels
                .iter()
                .map(|c| ChannelEntry {
                    id: c.id,
                    size: c.size,
                })
                .collect(),
        };
        let payload = postcard::to_stdvec(&manifest)
            .map_err(|e| MnemaError::SerializationError(format!("serialize manifest: {e}")))?;
        let mut bytes = Vec::with_capacity(5 + payload.len());
        bytes.extend_from_slice(&MANIFEST_MAGIC);
        bytes.push(MANIFEST_VERSION);
        bytes.extend_from_slice(&payload);
        std::fs::write(self.dir.join(MANIFEST_FILE), &bytes)
            .map_err(|e| io_err("write manifest", e))
    }

    /// Flush channel files to disk.
    pub(crate) fn sync(&self) -> Result<(), MnemaError> {
        for channel in &self.channels {
            channel
                .file
                .sync_data()
                .map_err(|e| io_err("sync channel", e))?;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
