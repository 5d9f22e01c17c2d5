//! Integration tests for computation sharing in scheduled sources.
//!
//! Concurrent requests that reduce to the same cache key must share one
//! computation, yet every request gets its own completion and its own claim
//! on the result.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use wxflow_pipeline::{Completion, CompletionStream, DataSource};
use wxflow_storage::MemoryManager;
use wxflow_test_utils::assertions::assert_missing_keys;
use wxflow_test_utils::fixtures::{test_context, worker_context};
use wxflow_test_utils::{CountingProducer, GatedProducer, RequestBuilder, RequestKey};

const WAIT: Duration = Duration::from_secs(5);

fn member_request(member: &str, label: &str) -> RequestKey {
    RequestBuilder::new()
        .with("MEMBER", member)
        .with("LABEL", label)
        .build()
}

async fn next_completion(stream: &mut CompletionStream) -> Completion {
    timeout(WAIT, stream.next())
        .await
        .expect("completion within timeout")
        .expect("bus alive")
}

// ============================================================================
// SHARED COMPUTATIONS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_share_one_computation() {
    let ctx = worker_context();
    let producer = GatedProducer::new("Gated", "MEMBER", &["MEMBER"]);
    let gates = producer.gates();
    let started = producer.started();
    let source = ctx.create_source(producer).unwrap();
    let mut stream = ctx.bus().subscribe_to([source.id()]);

    let requests: Vec<RequestKey> = ["a", "b", "c"]
        .iter()
        .map(|label| member_request("0", label))
        .collect();
    for request in &requests {
        source.request_data(request.clone());
    }
    assert_eq!(source.computations_in_flight(), 1);

    gates.open("0");
    let mut completed = Vec::new();
    for _ in 0..requests.len() {
        completed.push(next_completion(&mut stream).await.request);
    }
    completed.sort();
    let mut expected = requests.clone();
    expected.sort();
    assert_eq!(completed, expected);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(source.computations_in_flight(), 0);

    let handles: Vec<_> = requests
        .iter()
        .map(|r| source.get_data(r).expect("one claim per request"))
        .collect();
    assert!(handles.iter().all(|h| Arc::ptr_eq(h.item(), handles[0].item())));
    assert_eq!(ctx.system_cache().stats().active_entries, 1);

    for handle in handles {
        source.release_data(handle);
    }
    let stats = ctx.system_cache().stats();
    assert_eq!(stats.active_entries, 0);
    assert_eq!(stats.released_entries, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_different_keys_compute_independently() {
    let ctx = worker_context();
    let producer = GatedProducer::new("Gated", "MEMBER", &["MEMBER"]);
    let gates = producer.gates();
    let started = producer.started();
    let source = ctx.create_source(producer).unwrap();
    let mut stream = ctx.bus().subscribe_to([source.id()]);

    source.request_data(member_request("0", "x"));
    source.request_data(member_request("1", "x"));
    assert_eq!(source.computations_in_flight(), 2);

    gates.open("1");
    let first = next_completion(&mut stream).await;
    assert_eq!(first.request, member_request("1", "x"));
    assert!(stream.try_next().is_none());

    gates.open("0");
    let second = next_completion(&mut stream).await;
    assert_eq!(second.request, member_request("0", "x"));
    assert_eq!(started.load(Ordering::SeqCst), 2);

    for request in [first.request, second.request] {
        let handle = source.get_data(&request).unwrap();
        source.release_data(handle);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_during_computation_joins_it() {
    let ctx = worker_context();
    let producer = GatedProducer::new("Gated", "MEMBER", &["MEMBER"]);
    let gates = producer.gates();
    let started = producer.started();
    let source = ctx.create_source(producer).unwrap();
    let mut stream = ctx.bus().subscribe_to([source.id()]);

    source.request_data(member_request("3", "early"));
    tokio::task::yield_now().await;
    source.request_data(member_request("3", "late"));

    gates.open("3");
    next_completion(&mut stream).await;
    next_completion(&mut stream).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    // Both claims are held until picked up or cancelled.
    source.release_claim(&member_request("3", "early"));
    assert_eq!(ctx.system_cache().stats().active_entries, 1);
    let handle = source.get_data(&member_request("3", "late")).unwrap();
    source.release_data(handle);
    assert_eq!(ctx.system_cache().stats().released_entries, 1);
}

// ============================================================================
// CACHE REUSE
// ============================================================================

#[test]
fn test_cached_result_served_without_recomputation() {
    let ctx = test_context();
    let producer = CountingProducer::new("Counting", &["MEMBER"]);
    let calls = producer.calls();
    let source = ctx.create_source(producer).unwrap();
    let mut stream = ctx.bus().subscribe();

    let request = member_request("0", "first");
    source.request_data(request.clone());
    assert_eq!(stream.drain_ready().len(), 1);
    let handle = source.get_data(&request).unwrap();
    source.release_data(handle);

    // Released but not evicted: a new request is a cache hit.
    let again = member_request("0", "second");
    source.request_data(again.clone());
    assert_eq!(stream.drain_ready().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(source.get_data(&again).is_some());
    assert!(ctx.system_cache().stats().hits >= 1);
}

#[test]
fn test_completed_result_held_until_claim_dropped() {
    let ctx = test_context();
    let source = ctx
        .create_source(CountingProducer::new("Counting", &["MEMBER"]))
        .unwrap();
    let mut stream = ctx.bus().subscribe();

    let request = member_request("0", "unwanted");
    source.request_data(request.clone());
    stream.drain_ready();
    let stats = ctx.system_cache().stats();
    assert_eq!(stats.active_entries, 1);
    assert_eq!(stats.released_entries, 0);

    source.release_claim(&request);
    assert_eq!(ctx.system_cache().stats().released_entries, 1);
}

#[test]
fn test_request_missing_keys_completes_without_data() {
    let ctx = test_context();
    let producer = CountingProducer::new("Counting", &["MEMBER"]);
    let calls = producer.calls();
    let source = ctx.create_source(producer).unwrap();
    let mut stream = ctx.bus().subscribe();

    let request = RequestBuilder::new().with("LABEL", "no member").build();
    assert_missing_keys(&source.cache_key(&request), "MEMBER");

    source.request_data(request.clone());
    let completions = stream.drain_ready();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].request, request);
    assert!(source.get_data(&request).is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
