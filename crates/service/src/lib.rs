//! Extraction orchestrator.
//!
//! [`ThumbnailService`] ties the pipeline together: resolve the source,
//! normalize the requested position into a cache key, consult the cache,
//! coalesce concurrent identical requests, and run decode/compose/encode on
//! the blocking pool. The service is cheap to clone and shared across tasks.
//!
//! Coalescing uses one broadcast channel per in-flight key. The first caller
//! for a key becomes the leader and spawns the pipeline as a detached task;
//! later callers subscribe and wait. Because the work is detached, dropping
//! or cancelling any individual caller (leader included) never aborts work
//! other callers are waiting on. If the leader's attempt fails, each waiter
//! retries the extraction once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use video_thumb_cache::{CacheStats, NormalizedKey, ThumbnailCache};
use video_thumb_common::{
    Result, SourceDescriptor, ThumbError, Thumbnail, ThumbnailRequest, ThumbnailResponse,
};
use video_thumb_decoder::{decode_with_retry, default_backends, locate, FrameDecoder};
use video_thumb_source::VideoSource;

/// Service tuning knobs
#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    /// Maximum number of cached thumbnails
    pub cache_capacity: usize,
    /// Additional decode attempts after a transient failure
    pub max_decode_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 128,
            max_decode_retries: 2,
        }
    }
}

type SharedResult = std::result::Result<Thumbnail, ThumbError>;

struct ServiceInner {
    cache: ThumbnailCache,
    backends: Vec<Arc<dyn FrameDecoder>>,
    inflight: Mutex<HashMap<NormalizedKey, broadcast::Sender<SharedResult>>>,
    max_decode_retries: u32,
}

#[derive(Clone)]
pub struct ThumbnailService {
    inner: Arc<ServiceInner>,
}

impl ThumbnailService {
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_backends(config, default_backends())
    }

    /// Construct with an explicit backend set, in selection order
    #[must_use]
    pub fn with_backends(config: ServiceConfig, backends: Vec<Arc<dyn FrameDecoder>>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                cache: ThumbnailCache::new(config.cache_capacity),
                backends,
                inflight: Mutex::new(HashMap::new()),
                max_decode_retries: config.max_decode_retries,
            }),
        }
    }

    /// Extract a thumbnail for the given request.
    ///
    /// # Errors
    ///
    /// Any variant of [`ThumbError`] depending on which stage failed; the
    /// request itself is validated first.
    pub async fn extract(&self, req: &ThumbnailRequest) -> Result<Thumbnail> {
        self.extract_with_cancellation(req, CancellationToken::new())
            .await
    }

    /// Extract with cooperative cancellation.
    ///
    /// Cancelling returns [`ThumbError::Cancelled`] to this caller only;
    /// in-flight work shared with other callers keeps running and still
    /// populates the cache.
    pub async fn extract_with_cancellation(
        &self,
        req: &ThumbnailRequest,
        cancel: CancellationToken,
    ) -> Result<Thumbnail> {
        req.validate()?;
        let key = self.normalized_key(req).await?;
        debug!("request normalized to {key}");

        if !req.use_cache {
            let work = self.spawn_pipeline(req.source.clone(), &key, None);
            return await_cancellable(work, &cancel).await;
        }

        if let Some(hit) = self.inner.cache.get(&key) {
            debug!("cache hit for {key}");
            return Ok(hit);
        }

        let mut retried = false;
        loop {
            if retried {
                // A waiter gets here after a leader failure; the retry that
                // won the race may already have filled the cache.
                if let Some(hit) = self.inner.cache.get(&key) {
                    return Ok(hit);
                }
            }

            enum Role {
                Leader(broadcast::Sender<SharedResult>),
                Waiter(broadcast::Receiver<SharedResult>),
            }

            let role = {
                let mut inflight = self
                    .inner
                    .inflight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match inflight.get(&key) {
                    Some(tx) => Role::Waiter(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        inflight.insert(key.clone(), tx.clone());
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let work = self.spawn_pipeline(req.source.clone(), &key, Some(tx));
                    return await_cancellable(work, &cancel).await;
                }
                Role::Waiter(mut rx) => {
                    let outcome = tokio::select! {
                        () = cancel.cancelled() => return Err(ThumbError::Cancelled),
                        msg = rx.recv() => msg,
                    };
                    match outcome {
                        Ok(Ok(thumb)) => return Ok(thumb),
                        Ok(Err(e)) if !retried => {
                            warn!("shared extraction of {key} failed ({e}), retrying");
                            retried = true;
                        }
                        Ok(Err(e)) => return Err(e),
                        // Leader dropped its sender without publishing (task
                        // panic); treat like a failed attempt.
                        Err(_) if !retried => retried = true,
                        Err(_) => {
                            return Err(ThumbError::Internal(
                                "shared extraction vanished without a result".to_string(),
                            ))
                        }
                    }
                }
            }
        }
    }

    /// Extract and write the encoded bytes to disk, returning the path.
    ///
    /// With no explicit output the path is derived from the source: the
    /// source file's extension is replaced with the thumbnail format's. An
    /// output that names an existing directory gets the derived file name
    /// inside it.
    ///
    /// # Errors
    ///
    /// Extraction errors propagate unchanged; an output path that cannot be
    /// derived or written surfaces as [`ThumbError::Internal`].
    pub async fn extract_to_file(
        &self,
        req: &ThumbnailRequest,
        output: Option<&Path>,
    ) -> Result<PathBuf> {
        let path = resolve_output_path(req, output)?;
        let thumb = self.extract(req).await?;
        tokio::fs::write(&path, thumb.bytes())
            .await
            .map_err(|e| ThumbError::Internal(format!("failed to write {}: {e}", path.display())))?;
        info!("wrote {} thumbnail to {}", thumb.format, path.display());
        Ok(path)
    }

    /// Extract and wrap the outcome in the wire response shape
    pub async fn respond(&self, req: &ThumbnailRequest) -> ThumbnailResponse {
        ThumbnailResponse::from_result(self.extract(req).await)
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Open the source once to resolve identity and position into the
    /// canonical cache key. The probe handle is dropped immediately; the
    /// pipeline reopens the source only on a cache miss it leads.
    async fn normalized_key(&self, req: &ThumbnailRequest) -> Result<NormalizedKey> {
        let descriptor = req.source.clone();
        let position = req.position;
        let (source_id, time_ms) = tokio::task::spawn_blocking(move || {
            let source = VideoSource::open(&descriptor)?;
            let time_ms = locate(source.metadata(), position)?;
            Ok::<_, ThumbError>((source.identity().to_string(), time_ms))
        })
        .await
        .map_err(join_error)??;

        Ok(NormalizedKey {
            source_id,
            time_ms,
            max_width: req.max_width,
            max_height: req.max_height,
            preserve_aspect: req.preserve_aspect,
            format: req.format,
            // Clamped here so quality 150 and quality 100 share a key as
            // well as an encoder setting.
            quality: req.quality.min(100),
        })
    }

    /// Run the pipeline as a detached task. When a broadcast sender is given
    /// the task also publishes the outcome and fills the cache, so waiters
    /// and the cache are served even if every caller has gone away.
    fn spawn_pipeline(
        &self,
        descriptor: SourceDescriptor,
        key: &NormalizedKey,
        publish: Option<broadcast::Sender<SharedResult>>,
    ) -> tokio::task::JoinHandle<SharedResult> {
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        tokio::spawn(async move {
            let pipeline_key = key.clone();
            let pipeline_inner = Arc::clone(&inner);
            let result = tokio::task::spawn_blocking(move || {
                run_pipeline(&pipeline_inner, &descriptor, &pipeline_key)
            })
            .await
            .unwrap_or_else(|e| Err(join_error(e)));

            if let Err(e) = &result {
                warn!("extraction of {key} failed: {e}");
            }
            if let Some(tx) = publish {
                if let Ok(thumb) = &result {
                    inner.cache.put(key.clone(), thumb.clone());
                }
                // Drop the in-flight entry before publishing so late callers
                // either see the cache entry or start a fresh extraction,
                // never subscribe to a channel that has already fired.
                inner
                    .inflight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&key);
                let _ = tx.send(result.clone());
            }
            result
        })
    }
}

async fn await_cancellable(
    work: tokio::task::JoinHandle<SharedResult>,
    cancel: &CancellationToken,
) -> Result<Thumbnail> {
    tokio::select! {
        () = cancel.cancelled() => Err(ThumbError::Cancelled),
        joined = work => joined.unwrap_or_else(|e| Err(join_error(e))),
    }
}

fn run_pipeline(
    inner: &ServiceInner,
    descriptor: &SourceDescriptor,
    key: &NormalizedKey,
) -> SharedResult {
    let mut source = VideoSource::open(descriptor)?;
    let backend = inner
        .backends
        .iter()
        .find(|b| b.supports(&source))
        .ok_or_else(|| {
            ThumbError::CodecUnsupported(format!("no decode backend for {}", source.identity()))
        })?;
    debug!("decoding {key} with backend {}", backend.id());

    let frame = decode_with_retry(
        backend.as_ref(),
        &mut source,
        key.time_ms,
        inner.max_decode_retries,
    )?;
    let img = video_thumb_imaging::compose(&frame, key.max_width, key.max_height, key.preserve_aspect)?;
    let bytes = video_thumb_imaging::encode(&img, key.format, key.quality)?;

    Ok(Thumbnail {
        bytes: Arc::new(bytes),
        format: key.format,
        width: img.width(),
        height: img.height(),
        actual_time_ms: frame.actual_time_ms,
    })
}

fn resolve_output_path(req: &ThumbnailRequest, output: Option<&Path>) -> Result<PathBuf> {
    let extension = req.format.extension();
    let derived_name = || -> Result<PathBuf> {
        let SourceDescriptor::Path(source_path) = &req.source else {
            return Err(ThumbError::Internal(
                "an output path is required for non-file sources".to_string(),
            ));
        };
        Ok(source_path.with_extension(extension))
    };

    match output {
        None => derived_name(),
        Some(path) if path.is_dir() => {
            let name = derived_name()?;
            let file_name = name.file_name().ok_or_else(|| {
                ThumbError::Internal(format!("cannot derive a file name from {}", name.display()))
            })?;
            Ok(path.join(file_name))
        }
        Some(path) => Ok(path.to_path_buf()),
    }
}

fn join_error(e: tokio::task::JoinError) -> ThumbError {
    ThumbError::Internal(format!("extraction task failed: {e}"))
}
