// src/core/meta/owner.rs

//! Per-node guardians of the replicated revisions.
//!
//! Each owner serializes reads, writes, and persistence of one revision
//! kind. Readers always see the latest successfully persisted value; writers
//! are funneled through a single async mutex so at most one update per kind
//! is in flight.

use super::{Bmd, ClusterConfig, Rev, Rmd, Smap};
use crate::core::OpalError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub struct RevOwner<T: Rev> {
    cur: RwLock<Arc<T>>,
    writer: Mutex<()>,
    /// Snapshot location; `None` disables persistence (tests).
    path: Option<PathBuf>,
}

pub type SmapOwner = RevOwner<Smap>;
pub type BmdOwner = RevOwner<Bmd>;
pub type RmdOwner = RevOwner<Rmd>;
pub type ConfigOwner = RevOwner<ClusterConfig>;

impl<T: Rev + Default> RevOwner<T> {
    pub fn new(initial: T, path: Option<PathBuf>) -> Self {
        RevOwner {
            cur: RwLock::new(Arc::new(initial)),
            writer: Mutex::new(()),
            path,
        }
    }

    /// Loads the persisted snapshot if one exists, otherwise starts from the
    /// default (empty, version 0) revision.
    pub fn load_or_default(path: PathBuf) -> Result<(Self, bool), OpalError> {
        match Self::load_snapshot(&path)? {
            Some(rev) => {
                info!("loaded persisted {}", rev.tag());
                Ok((Self::new(rev, Some(path)), true))
            }
            None => Ok((Self::new(T::default(), Some(path)), false)),
        }
    }

    fn load_snapshot(path: &Path) -> Result<Option<T>, OpalError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let rev: T = serde_json::from_str(&content)?;
                Ok(Some(rev))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the latest successfully persisted revision.
    pub async fn get(&self) -> Arc<T> {
        self.cur.read().await.clone()
    }

    /// Installs an externally produced revision (metasync receive, join
    /// response). Returns `true` when the revision was adopted, `false` for
    /// an equal-version no-op.
    pub async fn put(&self, incoming: T) -> Result<bool, OpalError> {
        let _w = self.writer.lock().await;
        let cur = self.cur.read().await.clone();
        Self::check_incoming(&cur, &incoming)?;
        if incoming.version() == cur.version() && cur.version() > 0 {
            warn!(
                "{}: incoming version equals local, ignoring",
                incoming.tag()
            );
            return Ok(false);
        }
        self.persist(&incoming)?;
        *self.cur.write().await = Arc::new(incoming);
        Ok(true)
    }

    /// Replaces the revision unconditionally. Reserved for bootstrap-time
    /// installs where version ordering is established by other means.
    pub async fn force_put(&self, incoming: T) -> Result<(), OpalError> {
        let _w = self.writer.lock().await;
        self.persist(&incoming)?;
        *self.cur.write().await = Arc::new(incoming);
        Ok(())
    }

    /// Serialized read-modify-write. `pre` runs under the writer lock on a
    /// clone of the current revision and returns whether to persist and
    /// install; `post` observes the newly installed value.
    pub async fn modify<F, P, R>(&self, pre: F, post: P) -> Result<Option<R>, OpalError>
    where
        F: FnOnce(&mut T) -> Result<Option<R>, OpalError>,
        P: FnOnce(&Arc<T>, &R),
    {
        let _w = self.writer.lock().await;
        let mut clone = (**self.cur.read().await).clone();
        match pre(&mut clone)? {
            None => Ok(None),
            Some(ret) => {
                self.persist(&clone)?;
                let installed = Arc::new(clone);
                *self.cur.write().await = installed.clone();
                post(&installed, &ret);
                Ok(Some(ret))
            }
        }
    }

    fn check_incoming(cur: &T, incoming: &T) -> Result<(), OpalError> {
        if !cur.uuid().is_empty() && !incoming.uuid().is_empty() && cur.uuid() != incoming.uuid() {
            return Err(OpalError::ClusterIntegrity(format!(
                "{} UUID split: local {} vs incoming {}",
                T::KIND,
                cur.uuid(),
                incoming.uuid()
            )));
        }
        if incoming.version() < cur.version() {
            return Err(OpalError::Downgrade {
                kind: T::KIND.as_str(),
                incoming: incoming.version(),
                local: cur.version(),
            });
        }
        Ok(())
    }

    /// Writes the snapshot atomically: tmp file in the same directory, then
    /// rename.
    fn persist(&self, rev: &T) -> Result<(), OpalError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(rev)?;
        let tmp = path.with_extension(format!("tmp-{}", rand::random::<u32>()));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Removes the on-disk snapshot (decommission path).
    pub fn remove_snapshot(&self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}
