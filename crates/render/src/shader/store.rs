//! Persisted compiled-shader artifacts.
//!
//! Keyed by `(source, entry point, stage, content fingerprint)`. Layout of
//! the on-disk store:
//! ```text
//! <root>/
//!   <key-hash>.spv    - little-endian SPIR-V words
//!   <key-hash>.json   - metadata (key fields, reflected resources)
//! ```

use super::{Fingerprint, ResourceCounts, SPIRV_MAGIC, ShaderArtifact, ShaderStage, SourceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Errors from artifact store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt artifact {stem}: {reason}")]
    Corrupt { stem: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub source: SourceId,
    pub entry_point: String,
    pub stage: ShaderStage,
    pub fingerprint: Fingerprint,
}

impl ArtifactKey {
    pub fn of(artifact: &ShaderArtifact) -> Self {
        Self {
            source: artifact.source.clone(),
            entry_point: artifact.entry_point.clone(),
            stage: artifact.stage,
            fingerprint: artifact.fingerprint,
        }
    }

    /// File stem derived from every key field.
    pub fn file_stem(&self) -> String {
        let joined = format!(
            "{}\0{}\0{}\0{}",
            self.source, self.entry_point, self.stage, self.fingerprint
        );
        format!("{}.{}", Fingerprint::of(joined.as_bytes()), self.stage.suffix())
    }
}

pub trait ArtifactStore {
    fn load(&mut self, key: &ArtifactKey) -> Result<Option<ShaderArtifact>, StoreError>;

    fn save(&mut self, artifact: &ShaderArtifact) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: HashMap<ArtifactKey, ShaderArtifact>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn load(&mut self, key: &ArtifactKey) -> Result<Option<ShaderArtifact>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn save(&mut self, artifact: &ShaderArtifact) -> Result<(), StoreError> {
        self.entries.insert(ArtifactKey::of(artifact), artifact.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactMeta {
    key: ArtifactKey,
    resources: ResourceCounts,
    word_count: usize,
}

/// Directory-backed store.
#[derive(Debug, Clone)]
pub struct DiskArtifactStore {
    root: PathBuf,
}

impl DiskArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactStore for DiskArtifactStore {
    fn load(&mut self, key: &ArtifactKey) -> Result<Option<ShaderArtifact>, StoreError> {
        let stem = key.file_stem();
        let meta_path = self.root.join(format!("{stem}.json"));
        if !meta_path.exists() {
            return Ok(None);
        }
        let meta: ArtifactMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
        if meta.key != *key {
            // Stem collision; treat as a miss.
            return Ok(None);
        }
        let bytes = std::fs::read(self.root.join(format!("{stem}.spv")))?;
        let corrupt = |reason: &str| StoreError::Corrupt {
            stem: stem.clone(),
            reason: reason.to_string(),
        };
        if bytes.len() % 4 != 0 || bytes.len() / 4 != meta.word_count {
            return Err(corrupt("length does not match metadata"));
        }
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(corrupt("missing SPIR-V magic"));
        }
        Ok(Some(ShaderArtifact {
            source: meta.key.source,
            entry_point: meta.key.entry_point,
            stage: meta.key.stage,
            fingerprint: meta.key.fingerprint,
            resources: meta.resources,
            spirv: Arc::from(words),
        }))
    }

    fn save(&mut self, artifact: &ShaderArtifact) -> Result<(), StoreError> {
        let key = ArtifactKey::of(artifact);
        let stem = key.file_stem();
        std::fs::write(
            self.root.join(format!("{stem}.spv")),
            bytemuck::cast_slice::<u32, u8>(&artifact.spirv),
        )?;
        let meta = ArtifactMeta {
            key,
            resources: artifact.resources,
            word_count: artifact.spirv.len(),
        };
        std::fs::write(
            self.root.join(format!("{stem}.json")),
            serde_json::to_string_pretty(&meta)?,
        )?;
        tracing::debug!(stem = %stem, "stored shader artifact");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(fingerprint: u64) -> ShaderArtifact {
        ShaderArtifact {
            source: SourceId::new("shaders/scene.wgsl"),
            entry_point: "vs_main".into(),
            stage: ShaderStage::Vertex,
            fingerprint: Fingerprint(fingerprint),
            resources: ResourceCounts {
                uniform_buffers: 1,
                ..ResourceCounts::default()
            },
            spirv: Arc::from(vec![SPIRV_MAGIC, 0x0001_0000, 7, 9]),
        }
    }

    #[test]
    fn memory_store_keys_by_fingerprint() {
        let mut store = MemoryArtifactStore::new();
        store.save(&artifact(1)).unwrap();
        assert!(store.load(&ArtifactKey::of(&artifact(1))).unwrap().is_some());
        assert!(store.load(&ArtifactKey::of(&artifact(2))).unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let original = artifact(42);
        DiskArtifactStore::open(dir.path()).unwrap().save(&original).unwrap();

        let mut reopened = DiskArtifactStore::open(dir.path()).unwrap();
        let loaded = reopened.load(&ArtifactKey::of(&original)).unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn disk_store_miss_for_other_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskArtifactStore::open(dir.path()).unwrap();
        store.save(&artifact(42)).unwrap();
        let mut key = ArtifactKey::of(&artifact(42));
        key.entry_point = "other".into();
        assert!(store.load(&key).unwrap().is_none());
    }

    #[test]
    fn disk_store_detects_truncated_bytecode() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskArtifactStore::open(dir.path()).unwrap();
        let a = artifact(5);
        store.save(&a).unwrap();
        let stem = ArtifactKey::of(&a).file_stem();
        std::fs::write(dir.path().join(format!("{stem}.spv")), [0u8; 6]).unwrap();
        assert!(matches!(
            store.load(&ArtifactKey::of(&a)),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
