use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::task;
use tracing::trace;

/// A filesystem backed document store.
///
/// Documents are JSON files directly under a root directory. Writes go
/// through a temp-file/fsync/rename sequence, so a partially written
/// document is never observable, not even across a power cut. There is no
/// cross-process locking; a store expects to be the only writer for its
/// root.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn document_path(&self, name: &str) -> PathBuf {
        self.root.join(name).with_extension("json")
    }

    /// Create or replace the document stored under `name`.
    ///
    /// `name` is the file name without an extension; documents always get a
    /// `.json` extension.
    pub async fn write<V: Serialize>(&self, name: &str, value: &V) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.document_path(name);
        let buf = serde_json::to_vec_pretty(value)?;
        trace!("writing {}", path.display());

        task::spawn_blocking(move || safe_write_all(&path, &buf))
            .await
            .map_err(io::Error::other)??;

        Ok(())
    }

    /// Read and decode the document stored under `name`.
    ///
    /// A missing document is `None`; a document that exists but does not
    /// decode is an error.
    pub async fn read<V: DeserializeOwned>(&self, name: &str) -> Result<Option<V>, StoreError> {
        let path = self.document_path(name);
        trace!("reading {}", path.display());

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Atomically replace the file at `path` with `buf`.
///
/// The buffer lands in a sibling temp file first, gets synced to disk and
/// is then renamed over the destination.
///
/// Read: [Ensuring data reaches to disk](https://lwn.net/Articles/457667/).
fn safe_write_all(path: &Path, buf: &[u8]) -> io::Result<()> {
    let tmp_ext = format!("tmp-{}", uuid::Uuid::new_v4().simple());
    let tmp_path = path.with_extension(tmp_ext);

    let mut tmp_file = std::fs::File::create(&tmp_path)?;
    tmp_file.write_all(buf)?;
    tmp_file.flush()?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    std::fs::rename(&tmp_path, path)
}
