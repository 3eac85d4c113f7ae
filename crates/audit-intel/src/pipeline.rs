//! Cache-aware embedding pipeline.
//!
//! Sits between callers and an [`EmbeddingProvider`]. For every requested
//! text it first consults the [`EmbeddingCache`] by fingerprint; misses
//! are deduplicated, split into provider batches of `batch_size`, and sent
//! with at most `concurrency` batches in flight. Every provider call runs
//! under the retry policy (timeout + exponential backoff).
//!
//! A call succeeds or fails as a whole. When one batch fails, the call
//! reports [`Error::EmbeddingUnavailable`] (or the batch's rejection /
//! cancellation), gives back the references it pinned, and leaves the
//! vectors of batches that did succeed in the cache unpinned, so that a
//! resubmission only pays for the failed part.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use audit_intel_core::cache::EmbeddingCache;
use audit_intel_core::embedding::EmbeddingProvider;
use audit_intel_core::models::{fingerprint, Chunk};
use audit_intel_core::{Error, Result};

use crate::config::EmbeddingConfig;
use crate::retry::{with_retry, RetryPolicy};
use crate::worker::CancelToken;

type Batch = Vec<(String, String)>;

pub struct EmbeddingPipeline {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
    provider_calls: Arc<AtomicU64>,
}

impl EmbeddingPipeline {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.retry_base_ms),
                timeout: Duration::from_secs(config.timeout_secs),
            },
            provider_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Provider calls made so far, retries included.
    pub fn provider_calls(&self) -> u64 {
        self.provider_calls.load(Ordering::Relaxed)
    }

    /// Embed one text, memoized in the cache.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::EmbeddingUnavailable("provider returned no vector".to_string()))
    }

    /// Embed `texts` in order. Results are cached without taking references.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let fingerprints: Vec<String> = texts.iter().map(|t| fingerprint(t.as_bytes())).collect();
        let items: Vec<(&str, &str)> = fingerprints
            .iter()
            .zip(texts)
            .map(|(fp, text)| (fp.as_str(), text.as_str()))
            .collect();
        self.resolve(&items, false, &CancelToken::never()).await
    }

    /// Embed the contexts of `chunks` for ingestion.
    ///
    /// On success every chunk holds one cache reference on its fingerprint,
    /// to be given back when the document stops being live. On failure no
    /// reference taken by this call remains.
    pub async fn embed_pinned(
        &self,
        chunks: &[Chunk],
        cancel: &CancelToken,
    ) -> Result<Vec<Vec<f32>>> {
        let items: Vec<(&str, &str)> = chunks
            .iter()
            .map(|c| (c.fingerprint.as_str(), c.context.as_str()))
            .collect();
        self.resolve(&items, true, cancel).await
    }

    /// Embed a query. Query vectors are not cached.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let texts = vec![text.to_string()];
        let vectors = call_provider(
            &self.provider,
            &self.provider_calls,
            &self.retry,
            &texts,
        )
        .await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingUnavailable("provider returned no vector".to_string()))
    }

    async fn resolve(
        &self,
        items: &[(&str, &str)],
        pin: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<Vec<f32>>> {
        cancel.check()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.provider.model_name().to_string();

        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(items.len());
        let mut pinned: Vec<&str> = Vec::new();
        let mut misses: Vec<(&str, &str)> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for &(fp, text) in items {
            match self.cache.lookup(fp, &model, pin) {
                Some(vector) => {
                    if pin {
                        pinned.push(fp);
                    }
                    out.push(Some(vector));
                }
                None => {
                    if seen.insert(fp) {
                        misses.push((fp, text));
                    }
                    out.push(None);
                }
            }
        }

        if misses.is_empty() {
            debug!(items = items.len(), "all embeddings served from cache");
        } else {
            debug!(
                items = items.len(),
                misses = misses.len(),
                "embedding cache misses"
            );
            let computed = match self.compute(&misses, &model, cancel).await {
                Ok(computed) => computed,
                Err(err) => {
                    for fp in pinned {
                        self.cache.unpin(fp);
                    }
                    return Err(err);
                }
            };
            for (slot, &(fp, _)) in out.iter_mut().zip(items) {
                if slot.is_none() {
                    let vector = computed.get(fp).cloned();
                    if pin {
                        if let Some(v) = &vector {
                            self.cache.insert(fp, &model, v.clone(), true);
                        }
                    }
                    *slot = vector;
                }
            }
        }

        out.into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::EmbeddingUnavailable("embedding missing from batch result".to_string()))
    }

    /// Embed the deduplicated misses. Successful batches are cached
    /// unpinned as they arrive.
    async fn compute(
        &self,
        misses: &[(&str, &str)],
        model: &str,
        cancel: &CancelToken,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Result<(Batch, Vec<Vec<f32>>)>> = JoinSet::new();
        for batch in misses.chunks(self.batch_size) {
            let batch: Batch = batch
                .iter()
                .map(|(fp, text)| (fp.to_string(), text.to_string()))
                .collect();
            let provider = Arc::clone(&self.provider);
            let calls = Arc::clone(&self.provider_calls);
            let semaphore = Arc::clone(&semaphore);
            let policy = self.retry;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled("embedding pipeline closed".to_string()))?;
                cancel.check()?;
                let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
                let vectors = call_provider(&provider, &calls, &policy, &texts).await?;
                Ok((batch, vectors))
            });
        }

        let mut computed = HashMap::with_capacity(misses.len());
        let mut failure = None;
        loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = cancel.cancelled() => {
                    failure = Some(Error::Cancelled("ingestion cancelled".to_string()));
                    break;
                }
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok(Ok((batch, vectors))) => {
                    for ((fp, _), vector) in batch.into_iter().zip(vectors) {
                        self.cache.insert(&fp, model, vector.clone(), false);
                        computed.insert(fp, vector);
                    }
                }
                Ok(Err(err)) => {
                    failure = Some(err);
                    break;
                }
                Err(join) => {
                    failure = Some(Error::EmbeddingUnavailable(format!(
                        "embedding task failed: {join}"
                    )));
                    break;
                }
            }
        }

        match failure {
            None => Ok(computed),
            Some(err) => {
                tasks.abort_all();
                warn!(error = %err, cached = computed.len(), "embedding call failed");
                Err(match err {
                    Error::Cancelled(_)
                    | Error::EmbeddingRejected(_)
                    | Error::EmbeddingUnavailable(_) => err,
                    other => Error::EmbeddingUnavailable(other.to_string()),
                })
            }
        }
    }
}

/// One provider call under the retry policy, with the result shape checked.
async fn call_provider(
    provider: &Arc<dyn EmbeddingProvider>,
    calls: &AtomicU64,
    policy: &RetryPolicy,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let vectors = with_retry(policy, "embedding batch", Error::EmbeddingUnavailable, || {
        calls.fetch_add(1, Ordering::Relaxed);
        provider.embed_batch(texts)
    })
    .await?;
    if vectors.len() != texts.len() {
        return Err(Error::EmbeddingUnavailable(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            texts.len()
        )));
    }
    if vectors.iter().any(|v| v.is_empty()) {
        return Err(Error::EmbeddingUnavailable(
            "provider returned an empty vector".to_string(),
        ));
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::embedding::HashEmbedder;

    /// Hash embedder that records every batch and fails on marked texts.
    struct Recording {
        inner: HashEmbedder,
        batches: Mutex<Vec<Vec<String>>>,
        fail_on: Option<(&'static str, Error)>,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                inner: HashEmbedder::new("hash-v1", 32),
                batches: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }

        fn failing(marker: &'static str, err: Error) -> Self {
            Self {
                fail_on: Some((marker, err)),
                ..Self::new()
            }
        }

        fn embedded(&self) -> usize {
            self.batches.lock().unwrap().iter().map(Vec::len).sum()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Recording {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batches.lock().unwrap().push(texts.to_vec());
            if let Some((marker, err)) = &self.fail_on {
                if texts.iter().any(|t| t.contains(marker)) {
                    return Err(err.clone());
                }
            }
            self.inner.embed_batch(texts).await
        }
    }

    fn config(batch_size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "hash".to_string(),
            batch_size,
            concurrency: 2,
            max_retries: 1,
            retry_base_ms: 1,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    fn pipeline(
        provider: Arc<Recording>,
        batch_size: usize,
    ) -> (EmbeddingPipeline, Arc<EmbeddingCache>) {
        let cache = Arc::new(EmbeddingCache::new());
        let pipeline = EmbeddingPipeline::new(provider, Arc::clone(&cache), &config(batch_size));
        (pipeline, cache)
    }

    fn chunk(context: &str) -> Chunk {
        Chunk {
            id: format!("id-{context}"),
            document_id: "doc".to_string(),
            index: 0,
            start: 0,
            end: context.len(),
            overlap_start: 0,
            text: context.to_string(),
            context: context.to_string(),
            token_count: 1,
            fingerprint: fingerprint(context.as_bytes()),
            location: None,
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn deduplicates_and_memoizes() {
        let provider = Arc::new(Recording::new());
        let (pipeline, _) = pipeline(Arc::clone(&provider), 8);

        let first = pipeline
            .embed_batch(&texts(&["going concern", "material weakness", "going concern"]))
            .await
            .unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0], first[2]);
        assert_eq!(provider.embedded(), 2);

        pipeline.embed("material weakness").await.unwrap();
        assert_eq!(provider.embedded(), 2);
        assert_eq!(pipeline.provider_calls(), 1);
    }

    #[tokio::test]
    async fn splits_misses_into_batches() {
        let provider = Arc::new(Recording::new());
        let (pipeline, _) = pipeline(Arc::clone(&provider), 2);
        pipeline
            .embed_batch(&texts(&["a", "b", "c", "d", "e"]))
            .await
            .unwrap();
        let mut sizes: Vec<usize> = provider.batches.lock().unwrap().iter().map(Vec::len).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[tokio::test]
    async fn pins_one_reference_per_chunk() {
        let provider = Arc::new(Recording::new());
        let (pipeline, cache) = pipeline(Arc::clone(&provider), 8);
        let chunks = vec![chunk("shared"), chunk("shared"), chunk("unique")];

        pipeline.embed_pinned(&chunks, &CancelToken::never()).await.unwrap();
        assert_eq!(cache.refs(&chunks[0].fingerprint), Some(2));
        assert_eq!(cache.refs(&chunks[2].fingerprint), Some(1));

        pipeline.embed_pinned(&chunks[..1], &CancelToken::never()).await.unwrap();
        assert_eq!(cache.refs(&chunks[0].fingerprint), Some(3));
        assert_eq!(provider.embedded(), 2);
    }

    #[tokio::test]
    async fn failed_call_keeps_successful_batches_unpinned() {
        let provider = Arc::new(Recording::failing(
            "poison",
            Error::EmbeddingUnavailable("503".to_string()),
        ));
        let (pipeline, cache) = pipeline(Arc::clone(&provider), 1);

        let warm = chunk("already cached");
        pipeline
            .embed_pinned(std::slice::from_ref(&warm), &CancelToken::never())
            .await
            .unwrap();

        let chunks = vec![warm.clone(), chunk("fresh"), chunk("poison pill")];
        let err = pipeline
            .embed_pinned(&chunks, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
        assert_eq!(cache.refs(&warm.fingerprint), Some(1));
        assert_eq!(cache.refs(&chunks[1].fingerprint), Some(0));
        assert_eq!(cache.refs(&chunks[2].fingerprint), None);

        let before = provider.embedded();
        let _ = pipeline.embed_pinned(&chunks, &CancelToken::never()).await;
        let resubmitted: Vec<String> = provider.batches.lock().unwrap()[before..]
            .iter()
            .flatten()
            .cloned()
            .collect();
        assert!(resubmitted.iter().all(|t| t == "poison pill"));
    }

    #[tokio::test]
    async fn rejection_is_not_retried_or_masked() {
        let provider = Arc::new(Recording::failing(
            "secret",
            Error::EmbeddingRejected("400 bad input".to_string()),
        ));
        let (pipeline, _) = pipeline(Arc::clone(&provider), 4);
        let err = pipeline.embed("secret text").await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingRejected(_)));
        assert_eq!(pipeline.provider_calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_call() {
        let provider = Arc::new(Recording::new());
        let (pipeline, cache) = pipeline(Arc::clone(&provider), 4);
        let err = pipeline
            .embed_pinned(&[chunk("x")], &CancelToken::already_cancelled())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(cache.is_empty());
        assert_eq!(provider.embedded(), 0);
    }

    #[tokio::test]
    async fn queries_are_not_cached() {
        let provider = Arc::new(Recording::new());
        let (pipeline, cache) = pipeline(Arc::clone(&provider), 4);
        let a = pipeline.embed_query("vendor risk").await.unwrap();
        let b = pipeline.embed_query("vendor risk").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(pipeline.provider_calls(), 2);
        assert!(cache.is_empty());
    }
}
