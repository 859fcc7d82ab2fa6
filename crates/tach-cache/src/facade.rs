//! Cache façade: local + remote composition with single-flight
//!
//! Many tasks in one run can share a cache key (a library's `build`
//! reached through the topological dep of every consumer), so identical
//! concurrent operations collapse onto one per-key flight; the others
//! wait and then observe the local tier already populated. Remote
//! uploads happen off the task's critical path with bounded retries, and
//! an upload failure is a warning, never a task failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tach_path::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf, AnchoredUnixPathBuf};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{CacheError, CacheHitMetadata, CacheReader, CacheSource, FsCache, RemoteClient};

const UPLOAD_RETRIES: u32 = 3;
const UPLOAD_BACKOFF_BASE: Duration = Duration::from_millis(500);
const UPLOAD_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Remote tier participation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteCacheMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl RemoteCacheMode {
    fn reads(self) -> bool {
        matches!(self, RemoteCacheMode::ReadWrite | RemoteCacheMode::ReadOnly)
    }

    fn writes(self) -> bool {
        matches!(self, RemoteCacheMode::ReadWrite | RemoteCacheMode::WriteOnly)
    }
}

/// Run-level cache switches.
#[derive(Debug, Clone, Default)]
pub struct CacheOpts {
    /// `--force`: never read the cache; always execute.
    pub skip_reads: bool,
    /// `--no-cache`: never write the cache.
    pub skip_writes: bool,
    pub remote_mode: RemoteCacheMode,
}

pub struct CacheMultiplexer {
    local: FsCache,
    remote: Option<Arc<dyn RemoteClient>>,
    opts: CacheOpts,
    /// Per-key guards collapsing concurrent identical operations.
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Background uploads still running; awaited at shutdown.
    uploads: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheMultiplexer {
    pub fn new(
        cache_dir: AbsoluteSystemPathBuf,
        remote: Option<Arc<dyn RemoteClient>>,
        opts: CacheOpts,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            local: FsCache::new(cache_dir)?,
            remote,
            opts,
            in_flight: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
        })
    }

    fn key_guard(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.in_flight.lock().expect("in-flight map poisoned");
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_guard(&self, key: &str, guard: Arc<tokio::sync::Mutex<()>>) {
        drop(guard);
        let mut map = self.in_flight.lock().expect("in-flight map poisoned");
        if let Some(entry) = map.get(key) {
            // Only this map still references the guard; no one is waiting.
            if Arc::strong_count(entry) == 1 {
                map.remove(key);
            }
        }
    }

    fn remote_for_reads(&self) -> Option<&Arc<dyn RemoteClient>> {
        self.remote
            .as_ref()
            .filter(|_| self.opts.remote_mode.reads())
    }

    fn remote_for_writes(&self) -> Option<&Arc<dyn RemoteClient>> {
        self.remote
            .as_ref()
            .filter(|_| self.opts.remote_mode.writes())
    }

    /// Presence check across both tiers, without transferring payloads.
    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if self.opts.skip_reads {
            return Ok(None);
        }
        if let Some(hit) = self.local.exists(key) {
            return Ok(Some(hit));
        }
        if let Some(remote) = self.remote_for_reads() {
            if let Some(duration) = remote.exists(key).await? {
                return Ok(Some(CacheHitMetadata {
                    source: CacheSource::Remote,
                    time_saved_ms: duration,
                }));
            }
        }
        Ok(None)
    }

    /// Restore outputs for `key` under `anchor`. Local tier first; a
    /// remote hit is pulled into the local tier before restoring, so the
    /// next run (and concurrent waiters on this key) hit locally. A
    /// corrupt local artifact degrades to a miss.
    pub async fn fetch(
        &self,
        key: &str,
        anchor: &AbsoluteSystemPathBuf,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredUnixPathBuf>)>, CacheError> {
        if self.opts.skip_reads {
            return Ok(None);
        }

        let guard = self.key_guard(key);
        let flight = guard.clone().lock_owned().await;

        let result = self.fetch_inner(key, anchor).await;

        drop(flight);
        self.release_guard(key, guard);
        result
    }

    async fn fetch_inner(
        &self,
        key: &str,
        anchor: &AbsoluteSystemPathBuf,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredUnixPathBuf>)>, CacheError> {
        match self.restore_local(key, anchor).await {
            Ok(Some(hit)) => return Ok(Some(hit)),
            Ok(None) => {}
            Err(e) => {
                // A corrupt or unreadable artifact is a miss, not a task
                // failure.
                warn!(key, error = %e, "local cache artifact unusable; treating as miss");
            }
        }

        let Some(remote) = self.remote_for_reads() else {
            return Ok(None);
        };
        let Some((bytes, duration)) = remote.fetch(key).await? else {
            return Ok(None);
        };

        debug!(key, bytes = bytes.len(), "remote cache hit; populating local tier");
        self.local.write_artifact(key, &bytes, duration)?;

        let anchor = anchor.clone();
        let restored =
            tokio::task::spawn_blocking(move || CacheReader::from_bytes(bytes).restore(&anchor))
                .await
                .map_err(|_| CacheError::Join)??;

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved_ms: duration,
            },
            restored,
        )))
    }

    async fn restore_local(
        &self,
        key: &str,
        anchor: &AbsoluteSystemPathBuf,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredUnixPathBuf>)>, CacheError> {
        let local = &self.local;
        if local.exists(key).is_none() {
            return Ok(None);
        }
        let key = key.to_string();
        let anchor = anchor.clone();
        let artifact = local.artifact_path(&key);
        let duration = local.exists(&key).map(|h| h.time_saved_ms).unwrap_or(0);
        let restored = tokio::task::spawn_blocking(move || {
            CacheReader::open(&artifact)?.restore(&anchor)
        })
        .await
        .map_err(|_| CacheError::Join)??;
        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved_ms: duration,
            },
            restored,
        )))
    }

    /// Archive `outputs` + `metadata` under `key`. The local write is
    /// synchronous with the task; the remote upload is spawned into the
    /// background with retries.
    pub async fn put(
        &self,
        key: &str,
        anchor: &AbsoluteSystemPathBuf,
        outputs: Vec<AnchoredSystemPathBuf>,
        metadata: Vec<AnchoredSystemPathBuf>,
        duration_ms: u64,
    ) -> Result<(), CacheError> {
        if self.opts.skip_writes {
            return Ok(());
        }

        let guard = self.key_guard(key);
        let flight = guard.clone().lock_owned().await;

        let result = self
            .put_inner(key, anchor, outputs, metadata, duration_ms)
            .await;

        drop(flight);
        self.release_guard(key, guard);
        result
    }

    async fn put_inner(
        &self,
        key: &str,
        anchor: &AbsoluteSystemPathBuf,
        outputs: Vec<AnchoredSystemPathBuf>,
        metadata: Vec<AnchoredSystemPathBuf>,
        duration_ms: u64,
    ) -> Result<(), CacheError> {
        {
            let key = key.to_string();
            let anchor = anchor.clone();
            let local = self.local.clone();
            tokio::task::spawn_blocking(move || {
                local.put(&key, &anchor, &outputs, &metadata, duration_ms)
            })
            .await
            .map_err(|_| CacheError::Join)??;
        }

        if let Some(remote) = self.remote_for_writes() {
            let remote = Arc::clone(remote);
            let body = self.local.read_artifact(key)?;
            let key = key.to_string();
            let handle = tokio::spawn(async move {
                upload_with_retries(remote, &key, body, duration_ms).await;
            });
            self.uploads
                .lock()
                .expect("uploads list poisoned")
                .push(handle);
        }

        Ok(())
    }

    /// Await in-flight remote uploads. Call once after the run drains.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut uploads = self.uploads.lock().expect("uploads list poisoned");
            uploads.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn upload_with_retries(
    remote: Arc<dyn RemoteClient>,
    key: &str,
    body: Vec<u8>,
    duration_ms: u64,
) {
    let mut backoff = UPLOAD_BACKOFF_BASE;
    for attempt in 1..=UPLOAD_RETRIES {
        match remote.put(key, body.clone(), duration_ms).await {
            Ok(()) => {
                debug!(key, attempt, "remote cache upload complete");
                return;
            }
            Err(e) if attempt < UPLOAD_RETRIES => {
                debug!(key, attempt, error = %e, "remote cache upload failed; retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(UPLOAD_BACKOFF_CAP);
            }
            Err(e) => {
                warn!(key, error = %e, "remote cache upload failed; artifact remains local-only");
            }
        }
    }
}
