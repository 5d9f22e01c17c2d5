//! Linear filter chains.
//!
//! A chain runs a list of [`FilterStage`]s one after the other. Each stage is
//! a data source whose input is the previous stage (or the root source for the
//! first one); its request is the root request plus the parameters of every
//! stage so far. The chain never waits: [`FilterChain::advance`] submits the
//! next stage and returns, and the owner feeds completions back through
//! [`FilterChain::on_completed`], which picks up the stage result and submits
//! the next stage.

use std::collections::VecDeque;
use std::sync::Arc;

use wxflow_core::{RequestBuilder, RequestKey, SourceId};

use crate::source::{Claim, DataHandle, DataSource};

/// Hook that adjusts the accumulated request right before its stage runs.
pub type LateParams = Box<dyn FnOnce(&mut RequestBuilder) + Send>;

/// One filter in a chain.
pub struct FilterStage {
    source: Arc<dyn DataSource>,
    input: Option<Arc<dyn DataSource>>,
    params: RequestBuilder,
    late_params: Option<LateParams>,
}

impl FilterStage {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            input: None,
            params: RequestBuilder::new(),
            late_params: None,
        }
    }

    /// Add a stage parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Add every field of `params`.
    pub fn params(mut self, params: &RequestKey) -> Self {
        self.params.unite(params);
        self
    }

    /// Input registered on the stage source under the empty prefix. Defaults
    /// to the previous stage when built through [`FilterChainBuilder`].
    pub fn with_input(mut self, input: Arc<dyn DataSource>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn late_params<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&mut RequestBuilder) + Send + 'static,
    {
        self.late_params = Some(Box::new(hook));
        self
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }
}

impl std::fmt::Debug for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStage")
            .field("source", &self.source.name())
            .field("input", &self.input.as_ref().map(|i| i.name().to_string()))
            .field("params", &self.params.serialize())
            .field("late_params", &self.late_params.is_some())
            .finish()
    }
}

/// Outcome of driving a chain one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStep {
    /// A stage was submitted; its completion is awaited.
    Requested { source: SourceId, request: RequestKey },
    /// Every stage has run. Reported once per chain.
    Finished,
    /// Nothing to do.
    Idle,
}

struct StageResult {
    source: Arc<dyn DataSource>,
    handle: DataHandle,
}

/// A chain of filter stages driven by completions.
pub struct FilterChain {
    root: Option<Arc<dyn DataSource>>,
    accumulated: RequestBuilder,
    stages: VecDeque<FilterStage>,
    running: Option<Claim>,
    result: Option<StageResult>,
    finished: bool,
}

impl FilterChain {
    /// A chain with no stages. `root` is the source the first stage reads from.
    pub fn new(root: Option<Arc<dyn DataSource>>, root_request: &RequestKey) -> Self {
        Self {
            root,
            accumulated: root_request.to_builder(),
            stages: VecDeque::new(),
            running: None,
            result: None,
            finished: false,
        }
    }

    /// Replace the stage list. Nothing is submitted until [`advance`](Self::advance).
    pub fn build(&mut self, stages: Vec<FilterStage>) {
        self.stages = stages.into();
        self.finished = false;
    }

    /// Submit the next stage, or report that the chain is done.
    pub fn advance(&mut self) -> ChainStep {
        if self.root.is_none() {
            tracing::trace!("Filter chain has no root source");
            return ChainStep::Idle;
        }
        if self.running.is_some() {
            return ChainStep::Idle;
        }

        let Some(mut stage) = self.stages.pop_front() else {
            if self.finished {
                return ChainStep::Idle;
            }
            self.finished = true;
            tracing::debug!(request = %self.accumulated.serialize(), "Filter chain finished");
            return ChainStep::Finished;
        };

        self.accumulated.unite(&stage.params.build());
        if let Some(hook) = stage.late_params.take() {
            hook(&mut self.accumulated);
        }
        if let Some(input) = &stage.input {
            stage.source.register_input("", Arc::clone(input));
        }

        let request = self.accumulated.build();
        tracing::debug!(
            stage = %stage.source.name(),
            request = %request,
            remaining = self.stages.len(),
            "Submitting filter stage"
        );
        let source = stage.source.id();
        self.running = Some(Claim::submit(&stage.source, request.clone()));
        ChainStep::Requested { source, request }
    }

    /// Feed a completion. Completions of anything but the running stage are
    /// ignored.
    pub fn on_completed(&mut self, source: SourceId, request: &RequestKey) -> ChainStep {
        let is_running = self
            .running
            .as_ref()
            .is_some_and(|r| r.is_answered_by(source, request));
        if !is_running {
            tracing::trace!(source = %source, request = %request.digest(), "Not a running stage");
            return ChainStep::Idle;
        }
        let Some(stage) = self.running.take() else {
            return ChainStep::Idle;
        };

        let stage_source = Arc::clone(stage.source());
        let next = stage.redeem().map(|handle| StageResult {
            source: Arc::clone(&stage_source),
            handle,
        });
        if next.is_none() {
            tracing::debug!(stage = %stage_source.name(), "Filter stage produced no data");
        }
        if let Some(previous) = std::mem::replace(&mut self.result, next) {
            previous.source.release_data(previous.handle);
        }
        self.advance()
    }

    /// Result of the last completed stage.
    pub fn result(&self) -> Option<&DataHandle> {
        self.result.as_ref().map(|r| &r.handle)
    }

    pub fn take_result(&mut self) -> Option<DataHandle> {
        self.result.take().map(|r| r.handle)
    }

    /// The root request plus the parameters of every stage submitted so far.
    pub fn accumulated_request(&self) -> RequestKey {
        self.accumulated.build()
    }

    pub fn root(&self) -> Option<&Arc<dyn DataSource>> {
        self.root.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn remaining_stages(&self) -> usize {
        self.stages.len()
    }

    /// Stop the chain. Returns the claim of the stage still running, if any;
    /// its completion is still going to arrive and the claim must be
    /// discarded then.
    pub fn abandon(&mut self) -> Option<Claim> {
        self.stages.clear();
        self.finished = true;
        self.running.take()
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("root", &self.root.as_ref().map(|r| r.name().to_string()))
            .field("request", &self.accumulated.serialize())
            .field("remaining", &self.stages.len())
            .field("running", &self.running.as_ref().map(|r| r.source().name().to_string()))
            .field("finished", &self.finished)
            .finish()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles a [`FilterChain`], wiring every stage to the one before it.
pub struct FilterChainBuilder {
    root: Option<Arc<dyn DataSource>>,
    root_request: RequestKey,
    stages: Vec<FilterStage>,
}

impl FilterChainBuilder {
    pub fn new(root: Option<Arc<dyn DataSource>>, root_request: RequestKey) -> Self {
        Self {
            root,
            root_request,
            stages: Vec::new(),
        }
    }

    /// Append a stage. Without an explicit input it reads from the previous
    /// stage, or from the root for the first one.
    pub fn stage(mut self, mut stage: FilterStage) -> Self {
        if stage.input.is_none() {
            stage.input = self
                .stages
                .last()
                .map(|s| Arc::clone(&s.source))
                .or_else(|| self.root.clone());
        }
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn build(self) -> FilterChain {
        let mut chain = FilterChain::new(self.root, &self.root_request);
        chain.build(self.stages);
        chain
    }
}

// ============================================================================
// TESTS
// ============================================================================



#[cfg(test)]
mod tests_support {
    use super::*;
    use crate::bus::CompletionBus;
    use crate::scheduler::{ImmediateScheduler, Scheduler};
    use crate::source::{DataProducer, ProduceContext, ScheduledSource};
    use async_trait::async_trait;
    use wxflow_core::{DataItem, LineValues, WxflowResult};
    use wxflow_storage::ResourceCache;

    /// Emits one value per field of its (reduced) request plus one per
    /// value of its "" input.
    struct FieldCount {
        name: String,
        keys: Vec<String>,
    }

    #[async_trait]
    impl DataProducer for FieldCount {
        fn name(&self) -> &str {
            &self.name
        }

        fn locally_required_keys(&self) -> Vec<String> {
            self.keys.clone()
        }

        async fn produce(
            &self,
            request: &RequestKey,
            ctx: &ProduceContext,
        ) -> WxflowResult<Arc<dyn DataItem>> {
            let upstream = if ctx.has_input("") {
                let input = ctx.fetch_input("", request).await?;
                input.as_line_values().map_or(0, |v| v.values.len())
            } else {
                0
            };
            Ok(Arc::new(LineValues {
                values: vec![0.0; upstream + request.len()],
                thickness: None,
            }))
        }
    }

    pub(super) struct Graph {
        pub(super) cache: Arc<ResourceCache<dyn DataItem>>,
        scheduler: Arc<dyn Scheduler>,
        pub(super) bus: CompletionBus,
    }

    impl Graph {
        pub(super) fn new() -> Self {
            Self {
                cache: Arc::new(ResourceCache::new("NWP", 1 << 20)),
                scheduler: Arc::new(ImmediateScheduler::default()),
                bus: CompletionBus::new(),
            }
        }

        pub(super) fn source(&self, name: &str, keys: &[&str]) -> Arc<dyn DataSource> {
            Arc::new(ScheduledSource::new(
                FieldCount {
                    name: name.to_string(),
                    keys: keys.iter().map(|k| k.to_string()).collect(),
                },
                self.cache.clone(),
                Arc::clone(&self.scheduler),
                self.bus.clone(),
            ))
        }
    }
}
