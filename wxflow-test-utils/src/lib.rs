//! wxflow Test Utilities
//!
//! Shared test infrastructure for the wxflow workspace:
//! - Mock producers with controllable timing
//! - Proptest generators for request keys
//! - Fixtures for common scenarios
//! - Assertions on wxflow error variants

pub use wxflow_core::{
    CacheError, DataItem, IntersectionLines, LineSelection, LineValues, RequestBuilder,
    RequestKey, SourceError, WxflowConfig, WxflowError, WxflowResult,
};
pub use wxflow_pipeline::{DataProducer, ProduceContext};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use wxflow_core::fields::LINES_PREFIX;

// ============================================================================
// MOCK PRODUCERS
// ============================================================================

/// Emits a single value (the number of request fields) and counts calls.
#[derive(Debug, Clone)]
pub struct CountingProducer {
    name: String,
    keys: Vec<String>,
    calls: Arc<AtomicUsize>,
}

impl CountingProducer {
    pub fn new(name: impl Into<String>, keys: &[&str]) -> Self {
        Self {
            name: name.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared call counter; stays valid after the producer moved into a source.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl DataProducer for CountingProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn locally_required_keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    async fn produce(
        &self,
        request: &RequestKey,
        _ctx: &ProduceContext,
    ) -> WxflowResult<Arc<dyn DataItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LineValues {
            values: vec![request.len() as f32],
            thickness: None,
        }))
    }
}

/// Gates shared between a [`GatedProducer`] and the test driving it.
#[derive(Debug, Clone, Default)]
pub struct Gates {
    gates: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl Gates {
    fn gate(&self, value: &str) -> Arc<Semaphore> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            gates
                .entry(value.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        )
    }

    /// Let computations whose gate field equals `value` finish, one at a
    /// time; each passes the permit on when done.
    pub fn open(&self, value: &str) {
        self.gate(value).add_permits(1);
    }
}

/// Blocks each computation until the test opens the gate for the value of
/// its gate field. Produces `LineValues` holding the gate value's length.
#[derive(Debug, Clone)]
pub struct GatedProducer {
    name: String,
    gate_key: String,
    keys: Vec<String>,
    gates: Gates,
    started: Arc<AtomicUsize>,
}

impl GatedProducer {
    /// `gate_key` must be one of `keys`.
    pub fn new(name: impl Into<String>, gate_key: &str, keys: &[&str]) -> Self {
        Self {
            name: name.into(),
            gate_key: gate_key.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            gates: Gates::default(),
            started: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn gates(&self) -> Gates {
        self.gates.clone()
    }

    /// Number of computations started so far.
    pub fn started(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.started)
    }
}

#[async_trait]
impl DataProducer for GatedProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn locally_required_keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    async fn produce(
        &self,
        request: &RequestKey,
        _ctx: &ProduceContext,
    ) -> WxflowResult<Arc<dyn DataItem>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let value = request.value(&self.gate_key)?.to_string();
        let gate = self.gates.gate(&value);
        let _permit = gate.acquire().await.map_err(|e| SourceError::ProductionFailed {
            source_name: self.name.clone(),
            request: request.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Arc::new(LineValues {
            values: vec![value.len() as f32],
            thickness: None,
        }))
    }
}

/// Serves an `nlon` x `nlat` x `nlev` grid of the requested `VARIABLE`.
#[derive(Debug, Clone)]
pub struct MockGridProducer {
    keys: Vec<String>,
    shape: (usize, usize, usize),
}

impl MockGridProducer {
    /// `keys` must include `VARIABLE`.
    pub fn new(keys: &[&str], nlon: usize, nlat: usize, nlev: usize) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            shape: (nlon, nlat, nlev),
        }
    }
}

#[async_trait]
impl DataProducer for MockGridProducer {
    fn name(&self) -> &str {
        "MockGrid"
    }

    fn locally_required_keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    async fn produce(
        &self,
        request: &RequestKey,
        _ctx: &ProduceContext,
    ) -> WxflowResult<Arc<dyn DataItem>> {
        let variable = request.value(wxflow_core::fields::VARIABLE)?;
        let (nlon, nlat, nlev) = self.shape;
        Ok(Arc::new(fixtures::sample_grid(variable, nlon, nlat, nlev, 1.0)))
    }
}

/// Serves [`fixtures::sample_lines`] for any request carrying its keys.
#[derive(Debug, Clone)]
pub struct MockLinesProducer {
    keys: Vec<String>,
    calls: Arc<AtomicUsize>,
}

impl MockLinesProducer {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Default for MockLinesProducer {
    fn default() -> Self {
        Self::new(&["VARIABLE", "ISOVALUE"])
    }
}

#[async_trait]
impl DataProducer for MockLinesProducer {
    fn name(&self) -> &str {
        "MockLines"
    }

    fn locally_required_keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    async fn produce(
        &self,
        _request: &RequestKey,
        _ctx: &ProduceContext,
    ) -> WxflowResult<Arc<dyn DataItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(fixtures::sample_lines()))
    }
}

/// "Samples" a variable along the lines of its `LINES_` input: the value at
/// each vertex is the vertex latitude.
#[derive(Debug, Clone)]
pub struct MockValueSampler {
    name: String,
    variable_key: String,
    members_key: String,
    thickness_key: Option<String>,
}

impl MockValueSampler {
    pub fn new(name: impl Into<String>, variable_key: &str, members_key: &str) -> Self {
        Self {
            name: name.into(),
            variable_key: variable_key.to_string(),
            members_key: members_key.to_string(),
            thickness_key: None,
        }
    }

    /// Also require `key` and emit a thickness value (the vertex pressure).
    pub fn with_thickness_key(mut self, key: &str) -> Self {
        self.thickness_key = Some(key.to_string());
        self
    }
}

#[async_trait]
impl DataProducer for MockValueSampler {
    fn name(&self) -> &str {
        &self.name
    }

    fn locally_required_keys(&self) -> Vec<String> {
        let mut keys = vec![self.variable_key.clone(), self.members_key.clone()];
        keys.extend(self.thickness_key.clone());
        keys
    }

    async fn produce(
        &self,
        request: &RequestKey,
        ctx: &ProduceContext,
    ) -> WxflowResult<Arc<dyn DataItem>> {
        let input = ctx.fetch_input(LINES_PREFIX, request).await?;
        let Some(lines) = input.as_lines() else {
            return Err(SourceError::ProductionFailed {
                source_name: self.name.clone(),
                request: request.to_string(),
                reason: "LINES_ input is not line geometry".to_string(),
            }
            .into());
        };
        let thickness = self
            .thickness_key
            .as_ref()
            .map(|_| lines.vertices.iter().map(|v| v[2]).collect());
        Ok(Arc::new(LineValues {
            values: lines.vertices.iter().map(|v| v[1]).collect(),
            thickness,
        }))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for request keys.

    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use wxflow_pipeline::SelectionOp;

    /// Field names as used in requests, including prefixed ones.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[A-Z][A-Z0-9_]{0,11}"
    }

    /// Field values, including the characters that need escaping.
    pub fn arb_field_value() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 ./:=;\\\\-]{0,12}"
    }

    pub fn arb_field_map() -> impl Strategy<Value = BTreeMap<String, String>> {
        prop::collection::btree_map(arb_field_name(), arb_field_value(), 0..8)
    }

    pub fn arb_request_key() -> impl Strategy<Value = RequestKey> {
        arb_field_map().prop_map(|fields| {
            let mut rb = RequestBuilder::new();
            for (k, v) in fields {
                rb.insert(k, v);
            }
            rb.build()
        })
    }

    pub fn arb_selection_op() -> impl Strategy<Value = SelectionOp> {
        prop_oneof![
            Just(SelectionOp::Less),
            Just(SelectionOp::LessOrEqual),
            Just(SelectionOp::Greater),
            Just(SelectionOp::GreaterOrEqual),
            Just(SelectionOp::Equal),
        ]
    }

    /// A permutation of `0..n` for some `n` in `1..max`.
    pub fn arb_completion_order(max: usize) -> impl Strategy<Value = Vec<usize>> {
        (1..max).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use wxflow_core::{GridTopology, LevelType, MemoryConfig, StructuredGrid};
    use wxflow_pipeline::{ImmediateScheduler, PipelineContext, WorkerScheduler};

    /// Two members. Member 0: a ~111 km line reaching 1°N and a ~556 km line
    /// reaching 5°N. Member 1: a ~1112 km line along the equator.
    pub fn sample_lines() -> IntersectionLines {
        IntersectionLines {
            vertices: vec![
                [0.0, 0.0, 500.0],
                [0.0, 1.0, 500.0],
                [10.0, 0.0, 500.0],
                [10.0, 5.0, 500.0],
                [20.0, 0.0, 500.0],
                [25.0, 0.0, 500.0],
                [30.0, 0.0, 500.0],
            ],
            selection: LineSelection {
                start_indices: vec![0, 2, 4],
                index_counts: vec![2, 2, 3],
                ensemble_start: vec![0, 2],
                ensemble_count: vec![2, 1],
            },
        }
    }

    /// `nlon` x `nlat` x `nlev` pressure level grid filled with `value`.
    pub fn sample_grid(variable: &str, nlon: usize, nlat: usize, nlev: usize, value: f32) -> StructuredGrid {
        StructuredGrid {
            variable: variable.to_string(),
            level_type: LevelType::PressureLevels3D,
            lons: (0..nlon).map(|i| i as f32).collect(),
            lats: (0..nlat).map(|i| i as f32).collect(),
            levels: (0..nlev).map(|i| 1000.0 - 100.0 * i as f32).collect(),
            data: vec![value; nlon * nlat * nlev],
            topology: GridTopology::Regular,
        }
    }

    /// Request matching [`MockLinesProducer::default`].
    pub fn lines_request(isovalue: &str) -> RequestKey {
        RequestBuilder::new()
            .with("VARIABLE", "PV")
            .with("ISOVALUE", isovalue)
            .build()
    }

    pub fn small_memory_config(system_kb: u64) -> WxflowConfig {
        WxflowConfig {
            memory: MemoryConfig::default().with_system_memory_limit_kb(system_kb),
            ..Default::default()
        }
    }

    /// Context running every computation inline.
    pub fn test_context() -> PipelineContext {
        context_with(WxflowConfig::default())
    }

    pub fn context_with(config: WxflowConfig) -> PipelineContext {
        PipelineContext::with_scheduler(config, Arc::new(ImmediateScheduler::default()))
            .unwrap_or_else(|e| panic!("test context: {}", e))
    }

    /// Context on the calling tokio runtime. Must be called from within one.
    pub fn worker_context() -> PipelineContext {
        let scheduler = WorkerScheduler::current("MultiThread")
            .unwrap_or_else(|e| panic!("worker context needs a runtime: {}", e));
        PipelineContext::with_scheduler(WxflowConfig::default(), Arc::new(scheduler))
            .unwrap_or_else(|e| panic!("worker context: {}", e))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on wxflow error variants.

    use super::*;

    #[track_caller]
    pub fn assert_source_error<T: std::fmt::Debug>(result: &WxflowResult<T>) {
        match result {
            Err(WxflowError::Source(_)) => {}
            other => panic!("Expected Source error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_missing_keys<T: std::fmt::Debug>(result: &WxflowResult<T>, key: &str) {
        match result {
            Err(WxflowError::Source(SourceError::MissingKeys { missing, .. })) => {
                assert!(
                    missing.iter().any(|m| m == key),
                    "{} not among missing keys {:?}",
                    key,
                    missing
                );
            }
            other => panic!("Expected MissingKeys error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cache_error<T: std::fmt::Debug>(result: &WxflowResult<T>) {
        match result {
            Err(WxflowError::Cache(_)) => {}
            other => panic!("Expected Cache error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_eviction_failure<T: std::fmt::Debug>(result: &Result<T, CacheError>) {
        match result {
            Err(CacheError::EvictionFailure { .. }) => {}
            other => panic!("Expected EvictionFailure, got: {:?}", other),
        }
    }
}
