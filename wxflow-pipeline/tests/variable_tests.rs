//! Integration tests for actor variables.
//!
//! Results are taken over in submission order whatever order the source
//! finishes them in, superseded results never become current, and every
//! synchronization request is answered exactly once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::timeout;
use wxflow_core::fields::{INIT_TIME, LEVELTYPE, MEMBER, VALID_TIME, VARIABLE};
use wxflow_core::LevelType;
use wxflow_pipeline::{
    ActorVariable, DataSource, EnsembleMode, PipelineContext, VariableEvent, VariableSettings,
};
use wxflow_storage::MemoryManager;
use wxflow_test_utils::fixtures::{test_context, worker_context};
use wxflow_test_utils::{CountingProducer, GatedProducer, MockGridProducer, RequestKey};

const WAIT: Duration = Duration::from_secs(5);

const VARIABLE_KEYS: [&str; 5] = [LEVELTYPE, VARIABLE, INIT_TIME, VALID_TIME, MEMBER];

fn init_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn valid_time(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
}

fn temperature() -> VariableSettings {
    VariableSettings::new(LevelType::PressureLevels3D, "T")
}

fn grid_variable(ctx: &PipelineContext) -> (Arc<dyn DataSource>, ActorVariable) {
    let source: Arc<dyn DataSource> = ctx
        .create_source(MockGridProducer::new(&VARIABLE_KEYS, 8, 4, 2))
        .unwrap();
    let variable = ActorVariable::new(Arc::clone(&source), ctx.bus(), temperature());
    (source, variable)
}

fn changed(events: &[VariableEvent]) -> Vec<RequestKey> {
    events
        .iter()
        .filter_map(|e| match e {
            VariableEvent::DataChanged { request } => Some(request.clone()),
            _ => None,
        })
        .collect()
}

async fn next_events(variable: &mut ActorVariable) -> Vec<VariableEvent> {
    timeout(WAIT, variable.next_events())
        .await
        .expect("completion within timeout")
        .expect("bus alive")
}

// ============================================================================
// ORDERING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_results_taken_over_in_submission_order() {
    let ctx = worker_context();
    let producer = GatedProducer::new("Gated", VALID_TIME, &VARIABLE_KEYS);
    let gates = producer.gates();
    let source: Arc<dyn DataSource> = ctx.create_source(producer).unwrap();
    let mut variable = ActorVariable::new(source, ctx.bus(), temperature());

    let requests: Vec<RequestKey> = (1..=3)
        .map(|h| variable.build_request(init_time(), valid_time(h)))
        .collect();
    for h in 1..=3 {
        variable.request_data(init_time(), valid_time(h), None);
    }
    assert_eq!(variable.pending_requests(), 3);

    // Finish last-to-first. Nothing may be taken over before the first.
    for request in requests.iter().skip(1).rev() {
        gates.open(request.value(VALID_TIME).unwrap());
        assert!(next_events(&mut variable).await.is_empty());
        assert!(variable.current().is_none());
    }

    gates.open(requests[0].value(VALID_TIME).unwrap());
    let events = next_events(&mut variable).await;
    assert_eq!(changed(&events), requests);
    assert_eq!(variable.pending_requests(), 0);

    // Only the last result is still held.
    variable.release_data_items();
    let stats = ctx.system_cache().stats();
    assert_eq!(stats.active_entries, 0);
    assert_eq!(stats.released_entries, 3);
}

#[test]
fn test_each_takeover_releases_previous() {
    let ctx = test_context();
    let (_source, mut variable) = grid_variable(&ctx);

    variable.request_data(init_time(), valid_time(1), None);
    assert_eq!(changed(&variable.process_completions()).len(), 1);
    variable.request_data(init_time(), valid_time(2), None);
    assert_eq!(changed(&variable.process_completions()).len(), 1);

    let stats = ctx.system_cache().stats();
    assert_eq!(stats.active_entries, 1);
    assert_eq!(stats.released_entries, 1);
    assert_eq!(
        variable.current().unwrap().request().value(VALID_TIME).unwrap(),
        variable
            .build_request(init_time(), valid_time(2))
            .value(VALID_TIME)
            .unwrap()
    );
}

// ============================================================================
// SUPERSEDE AND SYNCHRONIZATION
// ============================================================================

#[test]
fn test_superseded_result_consumed_but_not_shown() {
    let ctx = test_context();
    let (_source, mut variable) = grid_variable(&ctx);

    let stale = variable.build_request(init_time(), valid_time(6));
    variable.request_data(init_time(), valid_time(6), None);
    assert_eq!(variable.supersede_pending(), 1);
    let fresh = variable.build_request(init_time(), valid_time(7));
    variable.request_data(init_time(), valid_time(7), Some(42));

    let events = variable.process_completions();
    assert_eq!(
        events,
        vec![
            VariableEvent::DataChanged { request: fresh },
            VariableEvent::SyncCompleted { sync_id: 42 },
        ]
    );
    assert!(!changed(&events).contains(&stale));

    // The superseded result's claim was consumed and released.
    let stats = ctx.system_cache().stats();
    assert_eq!(stats.active_entries, 1);
    assert_eq!(stats.released_entries, 1);
}

#[test]
fn test_sync_answered_without_data() {
    let ctx = test_context();
    let mut keys = VARIABLE_KEYS.to_vec();
    keys.push("NEVER_SET");
    let source: Arc<dyn DataSource> = ctx
        .create_source(CountingProducer::new("Incomplete", &keys))
        .unwrap();
    let mut variable = ActorVariable::new(source, ctx.bus(), temperature());

    let request = variable.build_request(init_time(), valid_time(0));
    variable.request_data(init_time(), valid_time(0), Some(9));
    assert_eq!(
        variable.process_completions(),
        vec![
            VariableEvent::DataUnavailable { request },
            VariableEvent::SyncCompleted { sync_id: 9 },
        ]
    );
    assert!(variable.current().is_none());
}

#[test]
fn test_settings_change_releases_and_supersedes() {
    let ctx = test_context();
    let (_source, mut variable) = grid_variable(&ctx);

    variable.request_data(init_time(), valid_time(1), None);
    variable.process_completions();
    assert!(variable.current().is_some());

    variable.request_data(init_time(), valid_time(2), Some(1));
    variable.set_settings(temperature().with_ensemble(EnsembleMode::Operation {
        op: "MEAN".to_string(),
        num_members: 10,
    }));
    assert!(variable.current().is_none());

    let events = variable.process_completions();
    assert_eq!(events, vec![VariableEvent::SyncCompleted { sync_id: 1 }]);
    let stats = ctx.system_cache().stats();
    assert_eq!(stats.active_entries, 0);
    assert_eq!(stats.released_entries, 2);

    let request = variable.build_request(init_time(), valid_time(2));
    assert_eq!(request.value("ENS_OPERATION").unwrap(), "MEAN");
    assert_eq!(request.value("MEMBER_RANGE").unwrap(), "0/9");
    assert!(!request.contains(MEMBER));
}

// ============================================================================
// TEXTURES
// ============================================================================

#[test]
fn test_texture_shared_between_variables() {
    let ctx = test_context();
    let source: Arc<dyn DataSource> = ctx
        .create_source(MockGridProducer::new(&VARIABLE_KEYS, 8, 4, 2))
        .unwrap();
    let mut first = ActorVariable::new(Arc::clone(&source), ctx.bus(), temperature())
        .with_texture_uploader(ctx.texture_uploader(source.id()));
    let mut second = ActorVariable::new(Arc::clone(&source), ctx.bus(), temperature())
        .with_texture_uploader(ctx.texture_uploader(source.id()));

    first.request_data(init_time(), valid_time(3), None);
    second.request_data(init_time(), valid_time(3), None);
    assert_eq!(changed(&first.process_completions()).len(), 1);
    assert_eq!(changed(&second.process_completions()).len(), 1);

    let a = first.texture().unwrap();
    let b = second.texture().unwrap();
    assert!(Arc::ptr_eq(a.item(), b.item()));
    assert_eq!((a.width, a.height, a.depth), (8, 4, 2));
    assert_eq!(ctx.video_cache().stats().active_entries, 1);

    first.release_data_items();
    second.release_data_items();
    assert_eq!(ctx.video_cache().stats().released_entries, 1);
}
