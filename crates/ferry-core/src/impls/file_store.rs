//! JsonFileQueueStore - owner ごとに 1 つの JSON ファイルへ保存
//!
//! # 実装詳細
//! - ファイル名は owner id の hex（任意の文字列をパスに使えるように）
//! - 書き込みは同じディレクトリの一時ファイルに書いて fsync してから persist（rename）
//! - 中身には owner id も保存し、読み込み時に照合する

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{OwnerId, StoreError};
use crate::ports::QueueStore;
use crate::queue::QueueSnapshot;

const FORMAT_VERSION: u32 = 1;
const EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedQueue {
    version: u32,
    owner: OwnerId,
    #[serde(flatten)]
    snapshot: QueueSnapshot,
}

#[derive(Debug, Clone)]
pub struct JsonFileQueueStore {
    dir: PathBuf,
}

impl JsonFileQueueStore {
    /// Creates the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, owner: &OwnerId) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", hex::encode(owner.as_str())))
    }
}

#[async_trait]
impl QueueStore for JsonFileQueueStore {
    async fn load(&self, owner: &OwnerId) -> Result<Option<QueueSnapshot>, StoreError> {
        let bytes = match tokio::fs::read(self.path_for(owner)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let persisted: PersistedQueue = serde_json::from_slice(&bytes)?;
        if persisted.version != FORMAT_VERSION {
            return Err(StoreError::Corrupt {
                owner: owner.clone(),
                reason: format!("unsupported format version {}", persisted.version),
            });
        }
        if &persisted.owner != owner {
            return Err(StoreError::Corrupt {
                owner: owner.clone(),
                reason: format!("file belongs to {}", persisted.owner),
            });
        }
        Ok(Some(persisted.snapshot))
    }

    async fn save(&self, owner: &OwnerId, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
        let persisted = PersistedQueue {
            version: FORMAT_VERSION,
            owner: owner.clone(),
            snapshot: snapshot.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&persisted)?;

        let dir = self.dir.clone();
        let path = self.path_for(owner);
        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &bytes))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError> {
        let mut owners = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(owner) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(owner_from_stem)
            else {
                tracing::warn!(path = %path.display(), "skipping unrecognised queue file");
                continue;
            };
            owners.push(OwnerId::new(owner));
        }
        owners.sort();
        Ok(owners)
    }
}

fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    Ok(())
}

fn owner_from_stem(stem: &str) -> Option<String> {
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}
