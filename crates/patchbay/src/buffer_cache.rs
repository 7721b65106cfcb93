//! Content-addressed, reference-counted clip buffer cache
//!
//! Requests are keyed by `(path, target sample rate)`. The entry table is
//! mutated synchronously under a short-lived lock; only the decode/upload and
//! the native release are awaited. Entry lifecycle:
//!
//! ```text
//! (absent) --get_buffer--> Loading --ok--> Cached(0) --retain--> Cached(n)
//!                             |                ^  |
//!                             +--err--> Gone   |  +--release to 0--> Releasing --> Gone
//!                                              +--retain/release--+
//! ```
//!
//! A second request for a key that is still `Loading` awaits the same shared
//! future, so each key is decoded and uploaded at most once. A load whose
//! content is still `Releasing` waits for the release before uploading.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{AudioFileLoader, Engine, RawAudio};
use crate::error::BufferError;
use crate::fingerprint::BufferKey;
use crate::resample::resample_channels;

/// An engine-resident clip buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipBufferDescriptor {
    pub buffer_key: BufferKey,
    pub sample_rate: u32,
    pub channels: usize,
    pub frames: usize,
}

/// Observable lifecycle state of a buffer key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Cached { refs: usize },
    Releasing,
    Gone,
}

type LoadFuture = Shared<BoxFuture<'static, Result<ClipBufferDescriptor, BufferError>>>;
type ReleaseFuture = Shared<BoxFuture<'static, ()>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    path: String,
    sample_rate: u32,
}

enum Entry {
    Loading(LoadFuture),
    Cached {
        descriptor: ClipBufferDescriptor,
        refs: usize,
    },
}

#[derive(Default)]
struct Table {
    entries: HashMap<RequestKey, Entry>,
    by_buffer: HashMap<BufferKey, RequestKey>,
    releasing: HashMap<BufferKey, ReleaseFuture>,
}

struct Inner {
    engine: Arc<dyn Engine>,
    loader: Arc<dyn AudioFileLoader>,
    table: Mutex<Table>,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Body of the shared in-flight future: load, upload, then settle the
    /// table entry.
    async fn fill(self: Arc<Self>, request: RequestKey) -> Result<ClipBufferDescriptor, BufferError> {
        let result = self.load_and_upload(&request).await;

        let orphaned = {
            let mut table = self.table();
            let still_loading = matches!(table.entries.get(&request), Some(Entry::Loading(_)));
            match &result {
                Ok(descriptor) if still_loading => {
                    table.entries.insert(
                        request.clone(),
                        Entry::Cached {
                            descriptor: descriptor.clone(),
                            refs: 0,
                        },
                    );
                    table
                        .by_buffer
                        .insert(descriptor.buffer_key.clone(), request.clone());
                    None
                }
                Ok(descriptor) => Some(descriptor.buffer_key.clone()),
                Err(_) => {
                    if still_loading {
                        table.entries.remove(&request);
                    }
                    None
                }
            }
        };

        if let Some(key) = orphaned {
            // Cache was cleared while this upload was in flight
            warn!(buffer.key = %key, path = %request.path, "Releasing upload orphaned by cache clear");
            if let Err(e) = self.engine.release_clip_buffer(&key).await {
                warn!(buffer.key = %key, error = %format!("{e:#}"), "Orphaned buffer release failed");
            }
        }

        result
    }

    async fn load_and_upload(&self, request: &RequestKey) -> Result<ClipBufferDescriptor, BufferError> {
        let raw = self
            .loader
            .load(&request.path)
            .await
            .map_err(|e| BufferError::Load {
                path: request.path.clone(),
                message: format!("{e:#}"),
            })?;

        validate_geometry(&request.path, &raw)?;

        let channels = raw.channels;
        let (data, frames) = if raw.sample_rate != request.sample_rate {
            let data = resample_channels(&raw.data, raw.sample_rate, request.sample_rate);
            let frames = data.first().map(Vec::len).unwrap_or(0);
            debug!(
                path = %request.path,
                from = raw.sample_rate,
                to = request.sample_rate,
                frames,
                "Resampled clip buffer"
            );
            (data, frames)
        } else {
            (raw.data, raw.frames)
        };

        let buffer_key = BufferKey::derive(&request.path, request.sample_rate, frames, channels);

        let pending_release = self.table().releasing.get(&buffer_key).cloned();
        if let Some(release) = pending_release {
            debug!(buffer.key = %buffer_key, "Waiting for in-progress release before re-upload");
            release.await;
        }

        self.engine
            .upload_clip_buffer(&buffer_key, request.sample_rate, channels, frames, &data)
            .await
            .map_err(|e| BufferError::Upload {
                key: buffer_key.to_string(),
                message: format!("{e:#}"),
            })?;

        info!(
            buffer.key = %buffer_key,
            path = %request.path,
            channels,
            frames,
            "Uploaded clip buffer"
        );

        Ok(ClipBufferDescriptor {
            buffer_key,
            sample_rate: request.sample_rate,
            channels,
            frames,
        })
    }

    async fn release_native(self: Arc<Self>, key: BufferKey) {
        if let Err(e) = self.engine.release_clip_buffer(&key).await {
            warn!(buffer.key = %key, error = %format!("{e:#}"), "Native clip buffer release failed");
        } else {
            debug!(buffer.key = %key, "Released clip buffer");
        }
        self.table().releasing.remove(&key);
    }
}

fn validate_geometry(path: &str, raw: &RawAudio) -> Result<(), BufferError> {
    let bad = |reason: String| BufferError::Geometry {
        path: path.to_string(),
        reason,
    };

    if raw.sample_rate == 0 {
        return Err(bad("sample rate is zero".to_string()));
    }
    if raw.channels == 0 {
        return Err(bad("no channels".to_string()));
    }
    if raw.frames == 0 {
        return Err(bad("no frames".to_string()));
    }
    if raw.data.len() != raw.channels {
        return Err(bad(format!(
            "declared {} channels but decoded {}",
            raw.channels,
            raw.data.len()
        )));
    }
    if let Some((index, channel)) = raw
        .data
        .iter()
        .enumerate()
        .find(|(_, channel)| channel.len() != raw.frames)
    {
        return Err(bad(format!(
            "channel {} has {} frames, expected {}",
            index,
            channel.len(),
            raw.frames
        )));
    }
    Ok(())
}

/// Decodes, resamples and uploads clip audio on demand; shares in-flight
/// uploads and reference-counts the results.
///
/// Cheap to clone; clones share one table.
#[derive(Clone)]
pub struct BufferCache {
    inner: Arc<Inner>,
}

impl BufferCache {
    pub fn new(engine: Arc<dyn Engine>, loader: Arc<dyn AudioFileLoader>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                loader,
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Resolve `path` at `sample_rate` to an engine-resident buffer.
    ///
    /// Does not take a reference; callers `retain` what they keep.
    pub async fn get_buffer(
        &self,
        path: &str,
        sample_rate: u32,
    ) -> Result<ClipBufferDescriptor, BufferError> {
        let request = RequestKey {
            path: path.to_string(),
            sample_rate,
        };

        let pending = {
            let mut table = self.inner.table();
            match table.entries.get(&request) {
                Some(Entry::Cached { descriptor, .. }) => return Ok(descriptor.clone()),
                Some(Entry::Loading(pending)) => {
                    debug!(path, sample_rate, "Joining in-flight clip buffer load");
                    pending.clone()
                }
                None => {
                    let pending = Arc::clone(&self.inner)
                        .fill(request.clone())
                        .boxed()
                        .shared();
                    table
                        .entries
                        .insert(request, Entry::Loading(pending.clone()));
                    pending
                }
            }
        };

        pending.await
    }

    /// Take a reference on a cached buffer. Returns false (and warns) for
    /// keys the cache does not hold.
    pub fn retain(&self, key: &BufferKey) -> bool {
        let mut table = self.inner.table();
        let Some(request) = table.by_buffer.get(key).cloned() else {
            warn!(buffer.key = %key, "retain on unknown clip buffer");
            return false;
        };
        match table.entries.get_mut(&request) {
            Some(Entry::Cached { refs, .. }) => {
                *refs += 1;
                true
            }
            _ => {
                warn!(buffer.key = %key, "retain on clip buffer that is not cached");
                false
            }
        }
    }

    /// Drop a reference. At zero the entry is removed and the engine is told
    /// to free the native storage; a release failure is logged, not returned.
    pub async fn release(&self, key: &BufferKey) {
        let release = {
            let mut table = self.inner.table();
            let Some(request) = table.by_buffer.get(key).cloned() else {
                warn!(buffer.key = %key, "release on unknown clip buffer");
                return;
            };
            match table.entries.get_mut(&request) {
                Some(Entry::Cached { refs, .. }) if *refs == 0 => {
                    warn!(buffer.key = %key, "release on clip buffer with no references");
                    return;
                }
                Some(Entry::Cached { refs, .. }) => {
                    *refs -= 1;
                    if *refs > 0 {
                        return;
                    }
                }
                _ => {
                    warn!(buffer.key = %key, "release on clip buffer that is not cached");
                    return;
                }
            }
            Self::begin_release(&self.inner, &mut table, &request, key)
        };

        release.await;
    }

    /// Release every cached buffer nobody has retained.
    pub async fn purge_unreferenced(&self) -> usize {
        let releases: Vec<ReleaseFuture> = {
            let mut table = self.inner.table();
            let idle: Vec<(RequestKey, BufferKey)> = table
                .entries
                .iter()
                .filter_map(|(request, entry)| match entry {
                    Entry::Cached {
                        descriptor,
                        refs: 0,
                    } => Some((request.clone(), descriptor.buffer_key.clone())),
                    _ => None,
                })
                .collect();
            idle.iter()
                .map(|(request, key)| Self::begin_release(&self.inner, &mut table, request, key))
                .collect()
        };

        let count = releases.len();
        futures::future::join_all(releases).await;
        if count > 0 {
            debug!(count, "Purged unreferenced clip buffers");
        }
        count
    }

    /// Teardown: release every buffer regardless of references and abandon
    /// in-flight loads.
    pub async fn clear(&self) {
        let releases: Vec<ReleaseFuture> = {
            let mut table = self.inner.table();
            let cached: Vec<(RequestKey, BufferKey)> = table
                .entries
                .iter()
                .filter_map(|(request, entry)| match entry {
                    Entry::Cached { descriptor, .. } => {
                        Some((request.clone(), descriptor.buffer_key.clone()))
                    }
                    Entry::Loading(_) => None,
                })
                .collect();
            let releases = cached
                .iter()
                .map(|(request, key)| Self::begin_release(&self.inner, &mut table, request, key))
                .collect();
            table.entries.clear();
            table.by_buffer.clear();
            releases
        };

        let count = releases.len();
        futures::future::join_all(releases).await;
        info!(count, "Clip buffer cache cleared");
    }

    /// Lifecycle state of a buffer key
    pub fn entry_state(&self, key: &BufferKey) -> EntryState {
        let table = self.inner.table();
        if let Some(request) = table.by_buffer.get(key) {
            if let Some(Entry::Cached { refs, .. }) = table.entries.get(request) {
                return EntryState::Cached { refs: *refs };
            }
        }
        if table.releasing.contains_key(key) {
            EntryState::Releasing
        } else {
            EntryState::Gone
        }
    }

    /// Number of entries, loading or cached
    pub fn len(&self) -> usize {
        self.inner.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached -> Releasing transition. Must be called with the table locked.
    fn begin_release(
        inner: &Arc<Inner>,
        table: &mut Table,
        request: &RequestKey,
        key: &BufferKey,
    ) -> ReleaseFuture {
        table.entries.remove(request);
        table.by_buffer.remove(key);
        let release = Arc::clone(inner)
            .release_native(key.clone())
            .boxed()
            .shared();
        table.releasing.insert(key.clone(), release.clone());
        release
    }
}
