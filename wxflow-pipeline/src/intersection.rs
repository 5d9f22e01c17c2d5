//! Intersection line pipeline.
//!
//! Requests intersection lines, runs them through the configured line filters
//! and finally asks for the values sampled along the selected lines:
//!
//! ```text
//! lines ──► [value threshold filter] ──► [length filter] ──► values request
//! ```
//!
//! Every request is keyed on the lines request `R`. Inputs that need the line
//! geometry themselves see it under a prefix, so the root request carries `R`
//! a second time as `LINES_*` (for the value source) and, with the variable
//! filter enabled, as `VARFILTER_LINES_*` (for the filter's value input).

use std::sync::Arc;

use wxflow_core::fields::{
    GEOLENFILTER_OP, GEOLENFILTER_VALUE, LINES_PREFIX, TRAJECTORYVALUES_MEMBERS,
    TRAJECTORYVALUES_THICKNESSVAR, TRAJECTORYVALUES_VARIABLE, VARFILTER_MEMBERS, VARFILTER_OP,
    VARFILTER_PREFIX, VARFILTER_VALUE, VARFILTER_VARIABLE,
};
use wxflow_core::{LineSelection, RequestKey, SourceId};

use crate::bus::{Completion, CompletionBus, CompletionStream};
use crate::filter_chain::{ChainStep, FilterChain, FilterChainBuilder, FilterStage};
use crate::filters::SelectionOp;
use crate::source::{Claim, DataHandle, DataSource};
use crate::tracker::PendingRequestTracker;

// ============================================================================
// SETTINGS
// ============================================================================

/// Keep lines where some vertex value of `variable` passes `op` against `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableFilterSettings {
    pub variable: String,
    /// Members in `a/b/c` form.
    pub members: String,
    pub op: SelectionOp,
    pub value: f64,
}

/// Keep lines whose length in km passes `op` against `value_km`.
#[derive(Debug, Clone, PartialEq)]
pub struct LengthFilterSettings {
    pub op: SelectionOp,
    pub value_km: f64,
}

/// What to sample along the selected lines.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRequestSettings {
    pub variable: String,
    pub members: String,
    pub thickness_variable: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineFilterSettings {
    pub variable_filter: Option<VariableFilterSettings>,
    pub length_filter: Option<LengthFilterSettings>,
    pub values: Option<ValueRequestSettings>,
}

/// The sources a pipeline draws from. Only `lines` is mandatory for
/// anything to happen.
#[derive(Clone, Default)]
pub struct IntersectionSources {
    pub lines: Option<Arc<dyn DataSource>>,
    /// Value threshold filter; reads `lines` and `variable_values`.
    pub variable_filter: Option<Arc<dyn DataSource>>,
    /// Values the variable filter thresholds, sampled along `lines`.
    pub variable_values: Option<Arc<dyn DataSource>>,
    pub length_filter: Option<Arc<dyn DataSource>>,
    /// Values sampled along `lines` once the chain has finished.
    pub values: Option<Arc<dyn DataSource>>,
}

impl IntersectionSources {
    fn ids(&self) -> Vec<SourceId> {
        [
            &self.lines,
            &self.variable_filter,
            &self.variable_values,
            &self.length_filter,
            &self.values,
        ]
        .into_iter()
        .flatten()
        .map(|s| s.id())
        .collect()
    }

    /// Register the prefixed inputs: value sources sample `lines` under
    /// `LINES_`, the variable filter reads its values under `VARFILTER_`.
    fn wire(&self) {
        let Some(lines) = &self.lines else {
            return;
        };
        for sampler in [&self.variable_values, &self.values].into_iter().flatten() {
            sampler.register_input(LINES_PREFIX, Arc::clone(lines));
        }
        if let (Some(filter), Some(values)) = (&self.variable_filter, &self.variable_values) {
            filter.register_input(VARFILTER_PREFIX, Arc::clone(values));
        }
    }
}

/// Root request of the filter chain for lines request `lines_request`.
pub fn chain_root_request(lines_request: &RequestKey, settings: &LineFilterSettings) -> RequestKey {
    let mut rb = lines_request.to_builder();
    let mut prefixed = lines_request.to_builder();
    prefixed.add_key_prefix(LINES_PREFIX);
    rb.unite(&prefixed.build());
    if settings.variable_filter.is_some() {
        let mut prefixed = lines_request.to_builder();
        prefixed.add_key_prefix(&format!("{}{}", VARFILTER_PREFIX, LINES_PREFIX));
        rb.unite(&prefixed.build());
    }
    rb.build()
}

/// Fields added to the finished chain's request to ask for values.
pub fn value_request(chain_request: &RequestKey, settings: &ValueRequestSettings) -> RequestKey {
    let mut rb = chain_request.to_builder();
    rb.insert(TRAJECTORYVALUES_VARIABLE, settings.variable.as_str())
        .insert(TRAJECTORYVALUES_MEMBERS, settings.members.as_str());
    if let Some(thickness) = &settings.thickness_variable {
        rb.insert(TRAJECTORYVALUES_THICKNESSVAR, thickness.as_str());
    }
    rb.build()
}

// ============================================================================
// PIPELINE
// ============================================================================

/// What the owner of a pipeline has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntersectionEvent {
    LinesAvailable { request: RequestKey },
    LinesUnavailable { request: RequestKey },
    /// A filter stage finished; the selection is now its result.
    SelectionChanged { stage: SourceId },
    /// All filters have run. `request` is the accumulated chain request.
    ChainFinished { request: RequestKey },
    ValuesAvailable { request: RequestKey },
    ValuesUnavailable { request: RequestKey },
}

/// Lines consumer running a filter chain on every delivered set of lines.
pub struct IntersectionPipeline {
    sources: IntersectionSources,
    settings: LineFilterSettings,
    stream: CompletionStream,
    tracker: PendingRequestTracker<()>,
    lines: Option<DataHandle>,
    lines_request: Option<RequestKey>,
    chain: Option<FilterChain>,
    chain_stages: usize,
    values: Option<DataHandle>,
    pending_values: Option<Claim>,
    /// Claims whose completions will still arrive but whose results are no
    /// longer wanted.
    orphans: Vec<Claim>,
}

impl IntersectionPipeline {
    pub fn new(sources: IntersectionSources, bus: &CompletionBus, settings: LineFilterSettings) -> Self {
        sources.wire();
        let stream = bus.subscribe_to(sources.ids());
        Self {
            sources,
            settings,
            stream,
            tracker: PendingRequestTracker::new(),
            lines: None,
            lines_request: None,
            chain: None,
            chain_stages: 0,
            values: None,
            pending_values: None,
            orphans: Vec::new(),
        }
    }

    /// Ask for new lines. `None` if no lines source is configured.
    pub fn request_lines(&mut self, request: RequestKey) -> Option<u64> {
        let Some(lines) = self.sources.lines.clone() else {
            tracing::warn!(request = %request, "No lines source, request dropped");
            return None;
        };
        let generation = self.tracker.submit(request.clone(), ());
        lines.request_data(request);
        Some(generation)
    }

    /// Change the filter configuration and rerun the chain on the current
    /// lines.
    pub fn set_filter_settings(&mut self, settings: LineFilterSettings) -> Vec<IntersectionEvent> {
        self.settings = settings;
        let mut events = Vec::new();
        self.rebuild_chain(&mut events);
        events
    }

    /// Process one completion.
    pub fn handle_completion(&mut self, completion: &Completion) -> Vec<IntersectionEvent> {
        let mut events = Vec::new();

        if self.adopt_orphan(completion) {
            return events;
        }

        let from_lines = self
            .sources
            .lines
            .as_ref()
            .is_some_and(|l| l.id() == completion.source);
        if from_lines && self.tracker.on_completed(&completion.request) {
            self.take_over_lines(&mut events);
            return events;
        }

        if self
            .pending_values
            .as_ref()
            .is_some_and(|p| p.is_answered_by(completion.source, &completion.request))
        {
            self.take_over_values(&mut events);
            return events;
        }

        if let Some(chain) = self.chain.as_mut() {
            let step = chain.on_completed(completion.source, &completion.request);
            if step != ChainStep::Idle {
                events.push(IntersectionEvent::SelectionChanged {
                    stage: completion.source,
                });
            }
            self.follow_chain(step, &mut events);
        }
        events
    }

    fn adopt_orphan(&mut self, completion: &Completion) -> bool {
        let Some(pos) = self
            .orphans
            .iter()
            .position(|o| o.is_answered_by(completion.source, &completion.request))
        else {
            return false;
        };
        self.orphans.swap_remove(pos).discard();
        tracing::trace!(source = %completion.source, "Orphaned result consumed");
        true
    }

    /// Move the running stage and the values request, if any, to the
    /// orphans.
    fn orphan_running_work(&mut self) {
        if let Some(claim) = self.chain.as_mut().and_then(FilterChain::abandon) {
            self.orphans.push(claim);
        }
        self.orphans.extend(self.pending_values.take());
    }

    fn take_over_lines(&mut self, events: &mut Vec<IntersectionEvent>) {
        let Some(lines) = self.sources.lines.clone() else {
            return;
        };
        let mut delivered = false;
        for entry in self.tracker.drain() {
            match lines.get_data(&entry.request) {
                Some(handle) => {
                    if let Some(previous) = self.lines.replace(handle) {
                        lines.release_data(previous);
                    }
                    self.lines_request = Some(entry.request.clone());
                    delivered = true;
                    events.push(IntersectionEvent::LinesAvailable {
                        request: entry.request,
                    });
                }
                None => events.push(IntersectionEvent::LinesUnavailable {
                    request: entry.request,
                }),
            }
        }
        if delivered {
            self.rebuild_chain(events);
        }
    }

    /// Abandon whatever is running and start a fresh chain on the current
    /// lines.
    fn rebuild_chain(&mut self, events: &mut Vec<IntersectionEvent>) {
        self.orphan_running_work();
        self.chain = None;
        self.values = None;
        self.chain_stages = 0;

        let Some(lines_request) = self.lines_request.clone() else {
            return;
        };
        if self.lines.is_none() {
            return;
        }

        let root = chain_root_request(&lines_request, &self.settings);
        let mut builder = FilterChainBuilder::new(self.sources.lines.clone(), root);
        if let (Some(settings), Some(filter)) =
            (&self.settings.variable_filter, &self.sources.variable_filter)
        {
            builder = builder.stage(
                FilterStage::new(Arc::clone(filter))
                    .param(VARFILTER_VARIABLE, settings.variable.as_str())
                    .param(VARFILTER_MEMBERS, settings.members.as_str())
                    .param(VARFILTER_OP, settings.op.as_str())
                    .param(VARFILTER_VALUE, settings.value.to_string()),
            );
        }
        if let (Some(settings), Some(filter)) =
            (&self.settings.length_filter, &self.sources.length_filter)
        {
            builder = builder.stage(
                FilterStage::new(Arc::clone(filter))
                    .param(GEOLENFILTER_OP, settings.op.as_str())
                    .param(GEOLENFILTER_VALUE, settings.value_km.to_string()),
            );
        }
        tracing::debug!(stages = builder.len(), request = %lines_request, "Starting filter chain");

        self.chain_stages = builder.len();
        let mut chain = builder.build();
        let step = chain.advance();
        self.chain = Some(chain);
        self.follow_chain(step, events);
    }

    fn follow_chain(&mut self, step: ChainStep, events: &mut Vec<IntersectionEvent>) {
        if step != ChainStep::Finished {
            return;
        }
        let Some(chain) = self.chain.as_ref() else {
            return;
        };
        let request = chain.accumulated_request();
        events.push(IntersectionEvent::ChainFinished {
            request: request.clone(),
        });

        if let (Some(values), Some(settings)) = (&self.sources.values, &self.settings.values) {
            let values_request = value_request(&request, settings);
            tracing::debug!(request = %values_request, "Requesting line values");
            self.pending_values = Some(Claim::submit(values, values_request));
        }
    }

    fn take_over_values(&mut self, events: &mut Vec<IntersectionEvent>) {
        let Some(claim) = self.pending_values.take() else {
            return;
        };
        let request = claim.request().clone();
        match claim.redeem() {
            Some(handle) => {
                self.values = Some(handle);
                events.push(IntersectionEvent::ValuesAvailable { request });
            }
            None => {
                tracing::debug!(request = %request, "Line values request produced no data");
                events.push(IntersectionEvent::ValuesUnavailable { request });
            }
        }
    }

    /// Process every completion already queued.
    pub fn process_completions(&mut self) -> Vec<IntersectionEvent> {
        let mut events = Vec::new();
        for completion in self.stream.drain_ready() {
            events.extend(self.handle_completion(&completion));
        }
        events
    }

    /// Wait for the next completion and process it. `None` once the bus is
    /// gone.
    pub async fn next_events(&mut self) -> Option<Vec<IntersectionEvent>> {
        let completion = self.stream.next().await?;
        Some(self.handle_completion(&completion))
    }

    /// Line selection to render: the chain result once the chain has
    /// finished, or the unfiltered lines if no filter is active. `None`
    /// while filtering or if the last filter produced nothing.
    pub fn selection(&self) -> Option<&LineSelection> {
        let chain = self.chain.as_ref()?;
        if !chain.is_finished() {
            return None;
        }
        if self.chain_stages == 0 {
            return self.lines.as_ref().and_then(|l| l.as_selection());
        }
        chain.result().and_then(|filtered| filtered.as_selection())
    }

    pub fn lines(&self) -> Option<&DataHandle> {
        self.lines.as_ref()
    }

    pub fn values(&self) -> Option<&DataHandle> {
        self.values.as_ref()
    }

    pub fn settings(&self) -> &LineFilterSettings {
        &self.settings
    }

    pub fn is_filtering(&self) -> bool {
        self.chain.as_ref().is_some_and(FilterChain::is_running)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Release lines, filter results and values. Requests in flight are
    /// consumed when they complete.
    pub fn release_data_items(&mut self) {
        self.orphan_running_work();
        self.chain = None;
        self.values = None;
        self.lines = None;
        self.lines_request = None;
    }
}

impl std::fmt::Debug for IntersectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntersectionPipeline")
            .field("settings", &self.settings)
            .field("pending_lines", &self.tracker.len())
            .field("lines", &self.lines_request.as_ref().map(|r| r.to_string()))
            .field("chain", &self.chain)
            .field("orphans", &self.orphans.len())
            .finish()
    }
}
