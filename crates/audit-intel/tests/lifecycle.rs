mod common;

use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use audit_intel::catalog::{Catalog, SqliteCatalog};
use audit_intel::engine::Engine;
use audit_intel::lifecycle::UploadRequest;
use audit_intel::retrieve::Query;
use audit_intel::Error;
use audit_intel_core::index::VectorIndex;
use audit_intel_core::models::{fingerprint, Category, Document, DocumentState, FailureKind};
use tempfile::TempDir;

use common::*;

async fn ingest(h: &Harness, request: UploadRequest) -> String {
    let receipt = h.engine.upload(request).await.unwrap();
    assert_eq!(receipt.state, DocumentState::Pending);
    let state = h.engine.wait(&receipt.document_id).await.unwrap();
    let doc = h.engine.get(&receipt.document_id).await.unwrap();
    assert_eq!(state, DocumentState::Ingested, "failure: {:?}", doc.failure);
    receipt.document_id
}

fn doc_ids(hits: &[audit_intel::RetrievedChunk]) -> HashSet<String> {
    hits.iter().map(|h| h.document_id.clone()).collect()
}

#[tokio::test]
async fn index_records_match_chunks_after_ingestion() {
    let h = harness(config("[chunking]\nmax_tokens = 40\noverlap_tokens = 5")).await;
    let id = ingest(&h, text_upload("fy24-controls.txt", "alice", &report("revenue"))).await;

    let doc = h.engine.get(&id).await.unwrap();
    assert!(doc.chunk_count > 1);
    assert_eq!(doc.embedding_model, MODEL);
    assert!(doc.failure.is_none());

    let records = h.index.document_records(&id).await.unwrap();
    assert_eq!(records.len(), doc.chunk_count);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.sequence, i);
        assert_eq!(record.document_id, id);
        assert_eq!(record.document_fingerprint, doc.fingerprint);
        assert_eq!(record.vector.len(), DIMS);
        assert_eq!(record.access_group, "GLOBAL_AUDIT");
    }
    // Canonical spans tile the text without gaps.
    for pair in records.windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
    }
}

#[tokio::test]
async fn identical_reupload_makes_no_embedding_calls() {
    let h = harness(config("")).await;
    let text = report("treasury");
    let first = ingest(&h, text_upload("treasury.txt", "alice", &text)).await;
    let calls = h.embedder.calls();

    let second = ingest(&h, text_upload("treasury.txt", "alice", &text)).await;
    assert_eq!(h.embedder.calls(), calls);

    assert_eq!(
        h.engine.get(&first).await.unwrap().state,
        DocumentState::Superseded
    );
    assert!(h.index.document_records(&first).await.unwrap().is_empty());
    assert!(!h.index.document_records(&second).await.unwrap().is_empty());
    // The shared entry survives the release of the old version's reference.
    assert_eq!(h.engine.pipeline().cache().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn supersede_never_leaves_a_window_without_results() {
    let h = harness(config("")).await;
    let v1 = ingest(&h, text_upload("fy24.txt", "alice", &report("revenue"))).await;

    let v2_text = format!("{}\n\nUpdated by {GATED}.", report("revenue"));
    let v2 = h
        .engine
        .upload(text_upload("fy24.txt", "alice", &v2_text))
        .await
        .unwrap()
        .document_id;

    let query = Query::new("revenue controls exceptions");
    let hits = h.engine.retrieve(&query).await.unwrap();
    assert_eq!(doc_ids(&hits), HashSet::from([v1.clone()]));

    let observe = async {
        let mut seen = HashSet::new();
        loop {
            let hits = h.engine.retrieve(&query).await.unwrap();
            let ids = doc_ids(&hits);
            assert_eq!(ids.len(), 1, "exactly one version must be visible");
            seen.extend(ids);
            if h.engine.get(&v2).await.unwrap().state != DocumentState::Pending {
                break seen;
            }
            tokio::task::yield_now().await;
        }
    };
    let switch = async {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.embedder.open_gate();
        h.engine.wait(&v2).await.unwrap()
    };
    let (seen, state) = tokio::join!(observe, switch);
    assert_eq!(state, DocumentState::Ingested);
    assert!(seen.contains(&v1));

    let hits = h.engine.retrieve(&query).await.unwrap();
    assert_eq!(doc_ids(&hits), HashSet::from([v2.clone()]));
    assert!(h.index.document_records(&v1).await.unwrap().is_empty());
    assert_eq!(
        h.engine.get(&v1).await.unwrap().state,
        DocumentState::Superseded
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn query_spanning_a_supersede_still_answers_for_the_document() {
    let h = harness(config("")).await;
    let v1 = ingest(&h, text_upload("fy24.txt", "alice", &report("inventory"))).await;

    let gate = h.index.pause_next_search();
    let query = Query::new("inventory controls exceptions");
    let search = h.engine.retrieve(&query);
    let supersede = async {
        // The search holds v1's candidates while v2 replaces it.
        gate.paused.notified().await;
        let v2 = ingest(
            &h,
            text_upload("fy24.txt", "alice", &report("inventory valuation")),
        )
        .await;
        assert_eq!(
            h.engine.get(&v1).await.unwrap().state,
            DocumentState::Superseded
        );
        assert!(h.index.document_records(&v1).await.unwrap().is_empty());
        gate.resume.notify_one();
        v2
    };
    let (hits, v2) = tokio::join!(search, supersede);
    assert_eq!(doc_ids(&hits.unwrap()), HashSet::from([v1]));

    let hits = h.engine.retrieve(&query).await.unwrap();
    assert_eq!(doc_ids(&hits), HashSet::from([v2]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queries_do_not_wait_for_another_documents_switch() {
    let catalog = HeldCatalog::new();
    let h = harness_with_catalog(config(""), catalog.clone()).await;
    let payroll = ingest(&h, text_upload("payroll.txt", "alice", &report("payroll"))).await;

    catalog.hold_switches();
    let treasury = h
        .engine
        .upload(text_upload("treasury.txt", "bob", &report("treasury")))
        .await
        .unwrap()
        .document_id;
    catalog.switch_entered.notified().await;

    let hits = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        h.engine.retrieve(&Query::new("payroll controls").top_k(10)),
    )
    .await
    .expect("query waited for an unrelated catalog write")
    .unwrap();
    let ids = doc_ids(&hits);
    assert!(ids.contains(&payroll));
    assert!(!ids.contains(&treasury));
    assert_eq!(
        h.engine.get(&treasury).await.unwrap().state,
        DocumentState::Pending
    );

    catalog.release_switches();
    assert_eq!(
        h.engine.wait(&treasury).await.unwrap(),
        DocumentState::Ingested
    );
}

#[tokio::test]
async fn keyword_matches_beyond_the_first_window_are_found() {
    let h = harness(config("")).await;
    // With top_k 1 and the default multiplier of 3, these fill the first window.
    for i in 0..5 {
        ingest(
            &h,
            text_upload(&format!("vendors-{i}.txt"), "alice", "vendor onboarding approvals"),
        )
        .await;
    }
    let ledger = ingest(&h, text_upload("ledger.txt", "alice", "vendor ledger zebra")).await;

    let mut query = Query::new("vendor onboarding approvals")
        .top_k(1)
        .threshold(-1.0);
    query.keywords = vec!["zebra".to_string()];
    let hits = h.engine.retrieve(&query).await.unwrap();
    assert_eq!(doc_ids(&hits), HashSet::from([ledger]));
}

#[tokio::test]
async fn delete_removes_every_record_and_releases_the_cache() {
    let h = harness(config("[chunking]\nmax_tokens = 40\noverlap_tokens = 5")).await;
    let id = ingest(&h, text_upload("payroll.txt", "alice", &report("payroll"))).await;
    assert!(!h.engine.pipeline().cache().is_empty());

    h.engine.delete(&id).await.unwrap();
    assert_eq!(h.engine.get(&id).await.unwrap().state, DocumentState::Deleted);
    assert!(h.index.document_records(&id).await.unwrap().is_empty());
    assert!(h.engine.pipeline().cache().is_empty());
    assert!(h
        .engine
        .retrieve(&Query::new("payroll"))
        .await
        .unwrap()
        .is_empty());

    // Deleting twice is fine; unknown ids are not.
    h.engine.delete(&id).await.unwrap();
    assert!(matches!(
        h.engine.delete("no-such-document").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn retrieval_is_repeatable() {
    let h = harness(config("[chunking]\nmax_tokens = 40\noverlap_tokens = 5")).await;
    ingest(&h, text_upload("a.txt", "alice", &report("inventory"))).await;
    ingest(&h, text_upload("b.txt", "bob", &report("inventory valuation"))).await;

    let query = Query::new("inventory reconciliation").top_k(10);
    let first = h.engine.retrieve(&query).await.unwrap();
    let second = h.engine.retrieve(&query).await.unwrap();
    assert!(!first.is_empty());
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test]
async fn embeddings_are_shared_across_identities() {
    let h = harness(config("")).await;
    let text = report("procurement");
    let alice = ingest(&h, text_upload("po.txt", "alice", &text)).await;
    let calls = h.embedder.calls();
    let bob = ingest(&h, text_upload("po-copy.txt", "bob", &text)).await;
    assert_eq!(h.embedder.calls(), calls);

    let cache = h.engine.pipeline().cache();
    assert_eq!(cache.len(), 1);
    h.engine.delete(&alice).await.unwrap();
    assert_eq!(cache.len(), 1, "bob still references the entry");
    h.engine.delete(&bob).await.unwrap();
    assert!(cache.is_empty());
}

#[tokio::test]
async fn fewer_matches_than_top_k_is_not_padded() {
    let h = harness(config("")).await;
    for name in ["r1.txt", "r2.txt", "r3.txt"] {
        ingest(&h, text_upload(name, "alice", "revenue recognition")).await;
    }
    for name in ["o1.txt", "o2.txt"] {
        ingest(&h, text_upload(name, "alice", "parking garage lighting")).await;
    }

    let hits = h
        .engine
        .retrieve(&Query::new("revenue recognition").top_k(5).threshold(0.5))
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| h.text.contains("revenue")));

    assert!(h
        .engine
        .retrieve(&Query::new("   "))
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        h.engine.retrieve(&Query::new("revenue").top_k(0)).await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn query_filters_and_keywords_narrow_results() {
    let h = harness(config("")).await;
    let audit = ingest(&h, text_upload("audit.txt", "alice", &report("cash"))).await;
    let mut policy = text_upload("policy.txt", "alice", &report("cash handling policy"));
    policy.category = Category::Policy;
    policy.access_group = Some("FINANCE".to_string());
    let policy = ingest(&h, policy).await;

    let mut query = Query::new("cash controls").top_k(10);
    assert_eq!(
        doc_ids(&h.engine.retrieve(&query).await.unwrap()),
        HashSet::from([audit.clone(), policy.clone()])
    );

    query.filters.category = Some(Category::Policy);
    assert_eq!(
        doc_ids(&h.engine.retrieve(&query).await.unwrap()),
        HashSet::from([policy.clone()])
    );

    query.filters.category = None;
    query.filters.access_groups = Some(vec!["GLOBAL_AUDIT".to_string()]);
    assert_eq!(
        doc_ids(&h.engine.retrieve(&query).await.unwrap()),
        HashSet::from([audit.clone()])
    );

    query.filters.access_groups = None;
    query.keywords = vec!["HANDLING".to_string()];
    assert_eq!(
        doc_ids(&h.engine.retrieve(&query).await.unwrap()),
        HashSet::from([policy])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_rolls_back_partial_work() {
    let h = harness(config("")).await;
    let text = format!("{}\n\n{GATED}", report("leases"));
    let id = h
        .engine
        .upload(text_upload("leases.txt", "alice", &text))
        .await
        .unwrap()
        .document_id;

    let state = h.engine.cancel(&id).await.unwrap();
    assert_eq!(state, DocumentState::Failed);
    let doc = h.engine.get(&id).await.unwrap();
    assert_eq!(doc.failure.unwrap().kind, FailureKind::Cancelled);
    assert!(h.index.document_records(&id).await.unwrap().is_empty());

    h.embedder.open_gate();
    let cache = h.engine.pipeline().cache();
    cache.sweep();
    assert!(cache.is_empty(), "no reference may outlive a cancelled job");

    // Nothing to cancel any more.
    assert_eq!(h.engine.cancel(&id).await.unwrap(), DocumentState::Failed);
}

#[tokio::test]
async fn failures_are_classified() {
    let h = harness(config("")).await;

    let unsupported = h
        .engine
        .upload(UploadRequest::new("scan.bin", "alice", vec![0, 1, 2, 3]))
        .await
        .unwrap()
        .document_id;
    assert_eq!(h.engine.wait(&unsupported).await.unwrap(), DocumentState::Failed);
    let failure = h.engine.get(&unsupported).await.unwrap().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::BadDocument);

    let before = h.embedder.calls();
    let rejected = h
        .engine
        .upload(text_upload("bad.txt", "alice", &format!("Text with {POISON}.")))
        .await
        .unwrap()
        .document_id;
    assert_eq!(h.engine.wait(&rejected).await.unwrap(), DocumentState::Failed);
    let failure = h.engine.get(&rejected).await.unwrap().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::BadDocument);
    assert_eq!(h.embedder.calls() - before, 1, "rejections are not retried");

    let blank = h
        .engine
        .upload(text_upload("blank.txt", "alice", "  \n\n  "))
        .await
        .unwrap()
        .document_id;
    assert_eq!(h.engine.wait(&blank).await.unwrap(), DocumentState::Failed);
    let failure = h.engine.get(&blank).await.unwrap().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::BadDocument);
}

#[tokio::test]
async fn transient_failure_can_be_reingested() {
    let h = harness(config("")).await;
    h.embedder.set_offline(true);
    let id = h
        .engine
        .upload(text_upload("fx.txt", "alice", &report("foreign exchange")))
        .await
        .unwrap()
        .document_id;
    assert_eq!(h.engine.wait(&id).await.unwrap(), DocumentState::Failed);
    let failure = h.engine.get(&id).await.unwrap().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Transient);
    assert_eq!(h.embedder.calls(), 2, "one retry after the first attempt");

    let health = h.engine.health().await;
    assert_eq!(health.failed_backlog, 1);
    assert!(health.healthy);

    assert!(matches!(
        h.engine.reingest("missing").await,
        Err(Error::NotFound(_))
    ));

    h.embedder.set_offline(false);
    let receipt = h.engine.reingest(&id).await.unwrap();
    assert_eq!(receipt.document_id, id);
    assert_eq!(h.engine.wait(&id).await.unwrap(), DocumentState::Ingested);
    assert!(h.engine.get(&id).await.unwrap().failure.is_none());
    assert_eq!(h.engine.health().await.failed_backlog, 0);

    assert!(matches!(
        h.engine.reingest(&id).await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_queue_rejects_uploads() {
    let h = harness(config("[ingest]\nworkers = 1\nqueue_capacity = 1")).await;
    let gated = format!("{}\n\n{GATED}", report("grants"));
    let first = h
        .engine
        .upload(text_upload("grants.txt", "alice", &gated))
        .await
        .unwrap()
        .document_id;

    let err = h
        .engine
        .upload(text_upload("other.txt", "alice", "Other findings."))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Overloaded(1)));
    assert_eq!(h.engine.stats().await.unwrap().jobs.capacity, 1);

    h.embedder.open_gate();
    assert_eq!(h.engine.wait(&first).await.unwrap(), DocumentState::Ingested);
    ingest(&h, text_upload("other.txt", "alice", "Other findings.")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_identity_uploads_end_with_the_latest_version() {
    let h = harness(config("")).await;
    let older = h
        .engine
        .upload(text_upload(
            "fy23.txt",
            "alice",
            &format!("{}\n\n{GATED}", report("capex")),
        ))
        .await
        .unwrap()
        .document_id;
    let newer = h
        .engine
        .upload(text_upload("fy23.txt", "alice", &report("capex restated")))
        .await
        .unwrap()
        .document_id;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.embedder.open_gate();
    assert_eq!(h.engine.wait(&newer).await.unwrap(), DocumentState::Ingested);
    assert_eq!(h.engine.wait(&older).await.unwrap(), DocumentState::Superseded);

    let live = h.engine.list(Some(DocumentState::Ingested)).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, newer);
    assert!(h.index.document_records(&older).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_index_delete_is_kept_as_orphan_until_purged() {
    let h = harness(config("")).await;
    let id = ingest(&h, text_upload("loans.txt", "alice", &report("loans"))).await;

    h.index.fail_deletes.store(true, Ordering::SeqCst);
    h.engine.delete(&id).await.unwrap();
    assert_eq!(h.engine.manager().orphans(), vec![id.clone()]);
    assert!(!h.index.document_records(&id).await.unwrap().is_empty());
    assert!(h.engine.retrieve(&Query::new("loans")).await.unwrap().is_empty());

    let health = h.engine.health().await;
    assert!(!health.index_reachable);
    assert_eq!(health.orphaned_documents, 1);
    assert!(!health.healthy);
    assert_eq!(h.engine.purge_orphans().await, 0);

    h.index.fail_deletes.store(false, Ordering::SeqCst);
    assert_eq!(h.engine.purge_orphans().await, 1);
    assert!(h.engine.manager().orphans().is_empty());
    assert!(h.index.document_records(&id).await.unwrap().is_empty());
    assert!(h.engine.health().await.healthy);
}

#[tokio::test]
async fn failed_upsert_rolls_back_and_fails_transient() {
    let h = harness(config("")).await;
    h.index.fail_upserts.store(true, Ordering::SeqCst);
    let id = h
        .engine
        .upload(text_upload("tax.txt", "alice", &report("tax")))
        .await
        .unwrap()
        .document_id;
    assert_eq!(h.engine.wait(&id).await.unwrap(), DocumentState::Failed);
    let failure = h.engine.get(&id).await.unwrap().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Transient);

    // The vector stays cached, unpinned, for the retry.
    let cache = h.engine.pipeline().cache();
    assert_eq!(cache.len(), 1);
    let calls = h.embedder.calls();
    h.index.fail_upserts.store(false, Ordering::SeqCst);
    h.engine.reingest(&id).await.unwrap();
    assert_eq!(h.engine.wait(&id).await.unwrap(), DocumentState::Ingested);
    assert_eq!(h.embedder.calls(), calls);
}

#[tokio::test]
async fn uploads_are_validated() {
    let h = harness(config("[uploads]\nmax_upload_mb = 1")).await;
    assert!(matches!(
        h.engine.upload(UploadRequest::new("empty.txt", "alice", Vec::new())).await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        h.engine.upload(text_upload(" ", "alice", "text")).await,
        Err(Error::InvalidInput(_))
    ));
    let big = vec![b'a'; 1024 * 1024 + 1];
    assert!(matches!(
        h.engine.upload(UploadRequest::new("big.txt", "alice", big)).await,
        Err(Error::InvalidInput(_))
    ));
    assert!(h.engine.list(None).await.is_empty());
}

#[tokio::test]
async fn stats_count_documents_by_state_and_type() {
    let h = harness(config("")).await;
    ingest(&h, text_upload("a.txt", "alice", &report("billing"))).await;
    ingest(&h, text_upload("b.md", "alice", "# Notes\n\nBilling review notes.")).await;
    let failed = h
        .engine
        .upload(UploadRequest::new("c.bin", "alice", vec![1, 2, 3]))
        .await
        .unwrap()
        .document_id;
    h.engine.wait(&failed).await.unwrap();

    let stats = h.engine.stats().await.unwrap();
    assert_eq!(stats.documents, 3);
    assert_eq!(stats.by_state.get("ingested"), Some(&2));
    assert_eq!(stats.by_state.get("failed"), Some(&1));
    assert_eq!(stats.by_mime.get("text/plain"), Some(&1));
    assert_eq!(stats.by_mime.get("text/markdown"), Some(&1));
    assert_eq!(stats.by_category.get("audit"), Some(&2));
    assert_eq!(stats.index_records, stats.chunks);
    assert_eq!(stats.jobs.running, 0);
}

#[tokio::test]
async fn office_documents_are_ingested_with_locations() {
    let h = harness(config("")).await;
    let slide = |text: &str| {
        format!(r#"<p:sld xmlns:p="p" xmlns:a="a"><a:p><a:r><a:t>{text}</a:t></a:r></a:p></p:sld>"#)
    };
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("ppt/slides/slide1.xml", options).unwrap();
        zip.write_all(slide("Audit scope and objectives").as_bytes())
            .unwrap();
        zip.start_file("ppt/slides/slide2.xml", options).unwrap();
        zip.write_all(slide("Remediation plan for vendor onboarding").as_bytes())
            .unwrap();
        zip.finish().unwrap();
    }
    let id = ingest(
        &h,
        UploadRequest::new("committee.pptx", "alice", buf.into_inner()),
    )
    .await;
    assert_eq!(
        h.engine.get(&id).await.unwrap().mime,
        "application/vnd.openxmlformats-officedocument.presentationml.presentation"
    );

    let hits = h
        .engine
        .retrieve(&Query::new("vendor onboarding remediation"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].location.as_deref(), Some("slide 1"));
    assert!(hits[0].text.contains("Remediation plan"));
}

fn persistent_config(dir: &TempDir) -> audit_intel::config::Config {
    let root = dir.path().display().to_string();
    config(&format!(
        r#"
[db]
path = '{root}/catalog.sqlite'

[uploads]
dir = '{root}/uploads'

[index]
backend = "sqlite"
path = '{root}/index.sqlite'
retry_base_ms = 1

[chunking]
max_tokens = 40
overlap_tokens = 5
"#
    ))
}

async fn open(config: &audit_intel::config::Config, embedder: Arc<TestEmbedder>) -> Engine {
    Engine::builder(config.clone())
        .provider(embedder)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn restart_keeps_documents_and_warms_the_cache() {
    let tmp = TempDir::new().unwrap();
    let cfg = persistent_config(&tmp);
    let text = report("depreciation");

    let (id, chunk_count) = {
        let engine = open(&cfg, TestEmbedder::new()).await;
        let id = engine
            .upload(text_upload("fa.txt", "alice", &text))
            .await
            .unwrap()
            .document_id;
        assert_eq!(engine.wait(&id).await.unwrap(), DocumentState::Ingested);
        (id.clone(), engine.get(&id).await.unwrap().chunk_count)
    };

    let embedder = TestEmbedder::new();
    let engine = open(&cfg, embedder.clone()).await;
    assert_eq!(engine.recovery().documents, 1);
    assert_eq!(engine.recovery().warmed, chunk_count);
    assert_eq!(engine.get(&id).await.unwrap().state, DocumentState::Ingested);

    let hits = engine
        .retrieve(&Query::new("depreciation schedule"))
        .await
        .unwrap();
    assert_eq!(doc_ids(&hits), HashSet::from([id.clone()]));
    let after_query = embedder.calls();

    let again = engine
        .upload(text_upload("fa.txt", "alice", &text))
        .await
        .unwrap()
        .document_id;
    assert_eq!(engine.wait(&again).await.unwrap(), DocumentState::Ingested);
    assert_eq!(embedder.calls(), after_query, "warm cache served every chunk");
    assert_eq!(engine.get(&id).await.unwrap().state, DocumentState::Superseded);
}

#[tokio::test]
async fn restart_fails_interrupted_ingestions() {
    let tmp = TempDir::new().unwrap();
    let cfg = persistent_config(&tmp);

    let pool = audit_intel::db::connect(cfg.db.path.as_ref().unwrap())
        .await
        .unwrap();
    let catalog = SqliteCatalog::new(pool);
    let interrupted = Document {
        id: "interrupted-1".to_string(),
        filename: "half.txt".to_string(),
        owner: "alice".to_string(),
        mime: "text/plain".to_string(),
        category: Category::Audit,
        access_group: "GLOBAL_AUDIT".to_string(),
        uploaded_at: 1_700_000_000_000,
        fingerprint: fingerprint(b"half"),
        size_bytes: 4,
        state: DocumentState::Pending,
        chunk_count: 0,
        embedding_model: MODEL.to_string(),
        failure: None,
    };
    catalog.save_document(&interrupted).await.unwrap();

    let engine = open(&cfg, TestEmbedder::new()).await;
    assert_eq!(engine.recovery().interrupted, 1);
    let doc = engine.get("interrupted-1").await.unwrap();
    assert_eq!(doc.state, DocumentState::Failed);
    assert_eq!(doc.failure.unwrap().kind, FailureKind::Transient);
    assert_eq!(engine.health().await.failed_backlog, 1);
}
