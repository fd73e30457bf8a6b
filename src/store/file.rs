//! One JSON file per session.

use std::io;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, instrument};

use crate::game::session::{Session, SessionKey};
use super::{SessionStore, StoreError};

const EXTENSION: &str = "json";

/// Stores sessions as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the session files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &SessionKey) -> Result<PathBuf, StoreError> {
        let valid = !key.as_str().is_empty()
            && key
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unusable session key {:?}", key.as_str()),
            )));
        }
        Ok(self.dir.join(format!("{}.{}", key, EXTENSION)))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn load(&self, key: &SessionKey) -> Result<Session, StoreError> {
        let path = self.path_for(key)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let session = serde_json::from_slice(&data)?;
        debug!("Loaded {} bytes from {}", data.len(), path.display());
        Ok(session)
    }

    #[instrument(skip(self, session), fields(key = %session.key))]
    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.path_for(&session.key)?;
        let data = serde_json::to_vec_pretty(session)?;

        // Write then rename, so a crash never leaves a torn file
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Saved {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<SessionKey>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(SessionKey::from(stem));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn remove(&self, key: &SessionKey) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::core::tile::{Placement, Square};
    use crate::game::engine::{Action, TurnEngine};
    use crate::game::player::{Player, PlayerKey};
    use crate::game::rules::StandardRules;
    use crate::game::session::GameConfig;

    async fn scratch_store() -> FileStore {
        let dir = std::env::temp_dir().join(format!("crossword-store-{}", uuid::Uuid::new_v4()));
        FileStore::open(dir).await.unwrap()
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let store = scratch_store().await;
        let mut session = Session::new(SessionKey::generate(), GameConfig::default());
        session.add_player(Player::new("a", "Ann", 7)).unwrap();
        session.add_player(Player::robot("robot", "Robot", 7)).unwrap();
        session.start().unwrap();

        let rules = StandardRules::default();
        let engine = TurnEngine::new(&rules);
        let tile = session.players[0].rack.tiles()[0].with_letter('E');
        let play = Action::Play {
            placements: vec![Placement::new(tile, Square::new(7, 7))],
            words: vec!["E".into()],
        };
        engine.apply(&mut session, &PlayerKey::new("a"), play, Utc::now()).unwrap();

        store.save(&session).await.unwrap();
        let loaded = store.load(&session.key).await.unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.state_hash(), session.state_hash());

        assert_eq!(store.list_keys().await.unwrap(), vec![session.key.clone()]);
        store.remove(&session.key).await.unwrap();
        assert!(store.list_keys().await.unwrap().is_empty());
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let store = scratch_store().await;
        let err = store.load(&SessionKey::from("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn test_path_like_keys_are_refused() {
        let store = scratch_store().await;
        let err = store.load(&SessionKey::from("../etc/passwd")).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        let _ = std::fs::remove_dir_all(store.dir());
    }
}
