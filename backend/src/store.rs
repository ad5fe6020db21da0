use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use santa_core::{apply_command, Group, GroupCommand, GroupEvent, SantaError};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("group not found")]
    GroupNotFound,
    #[error(transparent)]
    Engine(#[from] SantaError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence seam for groups. `apply` is the atomic read-modify-write:
/// the command runs against the stored group under the store's write lock,
/// so a shuffle that lost a race observes `shuffled == true` in there and
/// comes back `AlreadyShuffled`, and a join racing a shuffle lands either
/// before the commit (included) or after (`GroupLocked`) -- never between.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Group>, StoreError>;

    async fn create(&self, group: Group) -> Result<(), StoreError>;

    async fn apply(
        &self,
        id: &str,
        command: GroupCommand,
        seed: Option<u64>,
    ) -> Result<(Group, Vec<GroupEvent>), ApplyError>;

    /// Groups the given participant belongs to, in no particular order;
    /// callers sort for display.
    async fn groups_for(&self, participant_id: &str) -> Result<Vec<Group>, StoreError>;
}

fn run_command(
    group: &mut Group,
    command: GroupCommand,
    seed: Option<u64>,
) -> Result<Vec<GroupEvent>, SantaError> {
    let mut rng = seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(ChaCha8Rng::from_entropy);
    apply_command(group, command, &mut rng)
}

#[derive(Default)]
pub struct MemoryStore {
    groups: RwLock<HashMap<String, Group>>,
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<Group>, StoreError> {
        Ok(self.groups.read().await.get(id).cloned())
    }

    async fn create(&self, group: Group) -> Result<(), StoreError> {
        self.groups.write().await.insert(group.id.clone(), group);
        Ok(())
    }

    async fn apply(
        &self,
        id: &str,
        command: GroupCommand,
        seed: Option<u64>,
    ) -> Result<(Group, Vec<GroupEvent>), ApplyError> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(id).ok_or(ApplyError::GroupNotFound)?;
        let events = run_command(group, command, seed)?;
        Ok((group.clone(), events))
    }

    async fn groups_for(&self, participant_id: &str) -> Result<Vec<Group>, StoreError> {
        Ok(self
            .groups
            .read()
            .await
            .values()
            .filter(|g| g.is_member(participant_id))
            .cloned()
            .collect())
    }
}

/// MemoryStore semantics plus a JSON snapshot of the whole group map after
/// every mutation, reloaded on startup.
pub struct FileStore {
    inner: MemoryStore,
    path: PathBuf,
}

impl FileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let inner = MemoryStore::default();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let saved: HashMap<String, Group> = serde_json::from_slice(&bytes)?;
                debug!(groups = saved.len(), "loaded group snapshot");
                *inner.groups.write().await = saved;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Self { inner, path })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let snapshot = self.inner.groups.read().await.clone();
        let json = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl GroupStore for FileStore {
    async fn load(&self, id: &str) -> Result<Option<Group>, StoreError> {
        self.inner.load(id).await
    }

    async fn create(&self, group: Group) -> Result<(), StoreError> {
        self.inner.create(group).await?;
        self.persist().await
    }

    async fn apply(
        &self,
        id: &str,
        command: GroupCommand,
        seed: Option<u64>,
    ) -> Result<(Group, Vec<GroupEvent>), ApplyError> {
        let out = self.inner.apply(id, command, seed).await?;
        self.persist().await.map_err(ApplyError::Store)?;
        Ok(out)
    }

    async fn groups_for(&self, participant_id: &str) -> Result<Vec<Group>, StoreError> {
        self.inner.groups_for(participant_id).await
    }
}
