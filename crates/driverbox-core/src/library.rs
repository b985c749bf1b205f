//! Driver, model and mirror template library under `<root>/library`

use crate::error::CoreError;
use crate::model::DeviceModel;
use crate::persistence;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Library content kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    Driver,
    Model,
    MirrorTemplate,
}

impl LibraryKind {
    fn dir(self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::Model => "model",
            Self::MirrorTemplate => "mirror_tpl",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Driver => "lua",
            Self::Model | Self::MirrorTemplate => "json",
        }
    }
}

/// Read-only access to library files, loaded on demand
pub struct LibraryStore {
    root: PathBuf,
}

impl LibraryStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, kind: LibraryKind, key: &str) -> Result<PathBuf, CoreError> {
        let valid = !key.is_empty()
            && key != ".."
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(CoreError::InvalidConfig(format!("invalid library key {key:?}")));
        }
        Ok(self
            .root
            .join(kind.dir())
            .join(format!("{key}.{}", kind.extension())))
    }

    async fn read(&self, kind: LibraryKind, key: &str) -> Result<Option<String>, CoreError> {
        let path = self.path(kind, key)?;
        Ok(persistence::read_optional(&path).await?)
    }

    /// Model definition `library/model/<key>.json`
    pub async fn model(&self, key: &str) -> Result<Option<DeviceModel>, CoreError> {
        match self.read(LibraryKind::Model, key).await? {
            Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            None => Ok(None),
        }
    }

    /// Codec script `library/driver/<key>.lua`
    pub async fn driver(&self, key: &str) -> Result<Option<String>, CoreError> {
        self.read(LibraryKind::Driver, key).await
    }

    /// Store a codec script uploaded alongside a device config
    pub async fn save_driver(&self, key: &str, content: &str) -> Result<(), CoreError> {
        let path = self.path(LibraryKind::Driver, key)?;
        persistence::write_synced(&path, content.as_bytes()).await?;
        tracing::info!("Saved driver library {}", key);
        Ok(())
    }

    /// Mirror template `library/mirror_tpl/<key>.json`
    pub async fn mirror_template(&self, key: &str) -> Result<Option<Value>, CoreError> {
        match self.read(LibraryKind::MirrorTemplate, key).await? {
            Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            None => Ok(None),
        }
    }
}
