//! On-disk form of a conversation index.

use crate::error::{MemoryError, Result};
use crate::memory_db::SegmentId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexArtifact {
    pub format_version: u32,
    pub conversation_id: String,
    pub model_id: String,
    pub dimension: usize,
    pub entries: Vec<(SegmentId, Vec<f32>)>,
    /// blake3 over the bincode-encoded `entries`.
    pub checksum: [u8; 32],
}

fn entries_checksum(entries: &[(SegmentId, Vec<f32>)]) -> Result<[u8; 32]> {
    let encoded = bincode::serialize(entries)?;
    Ok(*blake3::hash(&encoded).as_bytes())
}

impl IndexArtifact {
    pub fn new(
        conversation_id: impl Into<String>,
        model_id: impl Into<String>,
        dimension: usize,
        entries: Vec<(SegmentId, Vec<f32>)>,
    ) -> Result<Self> {
        let checksum = entries_checksum(&entries)?;
        Ok(Self {
            format_version: FORMAT_VERSION,
            conversation_id: conversation_id.into(),
            model_id: model_id.into(),
            dimension,
            entries,
            checksum,
        })
    }

    /// Artifact file of a conversation; the id is hashed so any string is a
    /// safe file name.
    pub fn path_for(index_dir: &Path, conversation_id: &str) -> PathBuf {
        index_dir.join(format!("{}.idx", blake3::hash(conversation_id.as_bytes()).to_hex()))
    }

    /// Writes to a temp file in the same directory, then renames over the
    /// target.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(self)?;
        let tmp = path.with_extension("idx.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// `Ok(None)` when no artifact exists. Undecodable files, checksum
    /// failures, unknown versions and foreign conversation ids are
    /// `CorruptIndexArtifact`.
    pub fn read_from(path: &Path, conversation_id: &str) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| MemoryError::CorruptIndexArtifact {
            conversation_id: conversation_id.to_string(),
            reason,
        };

        let artifact: IndexArtifact =
            bincode::deserialize(&bytes).map_err(|e| corrupt(format!("decode failed: {}", e)))?;
        if artifact.format_version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", artifact.format_version)));
        }
        if artifact.conversation_id != conversation_id {
            return Err(corrupt(format!(
                "artifact belongs to conversation '{}'",
                artifact.conversation_id
            )));
        }
        if entries_checksum(&artifact.entries)? != artifact.checksum {
            return Err(corrupt("checksum mismatch".into()));
        }
        if artifact.entries.iter().any(|(_, v)| v.len() != artifact.dimension) {
            return Err(corrupt("entry dimension mismatch".into()));
        }
        Ok(Some(artifact))
    }
}
