//! Actor variables: the consumer side of a single NWP variable.
//!
//! An [`ActorVariable`] asks its source for one field per (init time, valid
//! time) and takes the results over in the order it asked for them, even when
//! the source finishes them in a different order. Each taken-over result
//! replaces the previous one, which is released.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use wxflow_core::fields::{ENS_OPERATION, INIT_TIME, LEVELTYPE, MEMBER, MEMBER_RANGE, VALID_TIME, VARIABLE};
use wxflow_core::{LevelType, RequestBuilder, RequestKey, SourceId};

use crate::bus::{Completion, CompletionBus, CompletionStream};
use crate::gpu::{TextureHandle, TextureUploader};
use crate::source::{DataHandle, DataSource};
use crate::tracker::{PendingEntry, PendingRequestTracker};

/// Which ensemble data a variable shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsembleMode {
    /// A single member.
    Member(u32),
    /// An operation (e.g. `"MEAN"`, `"STDDEV"`) over members `0..num_members`.
    Operation { op: String, num_members: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSettings {
    pub level_type: LevelType,
    pub variable: String,
    pub ensemble: EnsembleMode,
}

impl VariableSettings {
    pub fn new(level_type: LevelType, variable: impl Into<String>) -> Self {
        Self {
            level_type,
            variable: variable.into(),
            ensemble: EnsembleMode::Member(0),
        }
    }

    pub fn with_ensemble(mut self, ensemble: EnsembleMode) -> Self {
        self.ensemble = ensemble;
        self
    }
}

/// Metadata attached to every submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOrigin {
    /// Set when the request belongs to a synchronization step.
    pub synchronization: Option<u64>,
}

/// What the owner of a variable has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableEvent {
    /// New data is current.
    DataChanged { request: RequestKey },
    /// The source had nothing for this request; the previous data stays.
    DataUnavailable { request: RequestKey },
    /// A synchronization request has been processed, with or without data.
    SyncCompleted { sync_id: u64 },
}

/// Requests a variable's data and keeps the latest delivered result.
pub struct ActorVariable {
    settings: VariableSettings,
    source: Arc<dyn DataSource>,
    stream: CompletionStream,
    tracker: PendingRequestTracker<RequestOrigin>,
    current: Option<DataHandle>,
    texture: Option<TextureHandle>,
    uploader: Option<TextureUploader>,
    /// Submissions with a lower generation are consumed but not shown.
    superseded_below: u64,
}

impl ActorVariable {
    pub fn new(source: Arc<dyn DataSource>, bus: &CompletionBus, settings: VariableSettings) -> Self {
        let stream = bus.subscribe_to([source.id()]);
        Self {
            settings,
            source,
            stream,
            tracker: PendingRequestTracker::new(),
            current: None,
            texture: None,
            uploader: None,
            superseded_below: 0,
        }
    }

    /// Also keep a texture of every delivered grid.
    pub fn with_texture_uploader(mut self, uploader: TextureUploader) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn settings(&self) -> &VariableSettings {
        &self.settings
    }

    pub fn source_id(&self) -> SourceId {
        self.source.id()
    }

    /// Request for the field valid at `valid` of the forecast started at `init`.
    pub fn build_request(&self, init: DateTime<Utc>, valid: DateTime<Utc>) -> RequestKey {
        let mut rb = RequestBuilder::new();
        rb.insert(LEVELTYPE, self.settings.level_type.as_str())
            .insert(VARIABLE, self.settings.variable.as_str())
            .insert_time(INIT_TIME, init)
            .insert_time(VALID_TIME, valid);
        match &self.settings.ensemble {
            EnsembleMode::Member(member) => {
                rb.insert_int(MEMBER, i64::from(*member));
            }
            EnsembleMode::Operation { op, num_members } => {
                rb.insert(ENS_OPERATION, op.as_str()).insert(
                    MEMBER_RANGE,
                    format!("0/{}", num_members.saturating_sub(1)),
                );
            }
        }
        rb.build()
    }

    /// Ask the source for new data. Returns the submission's generation.
    pub fn request_data(
        &mut self,
        init: DateTime<Utc>,
        valid: DateTime<Utc>,
        synchronization: Option<u64>,
    ) -> u64 {
        let request = self.build_request(init, valid);
        let generation = self.tracker.submit(request.clone(), RequestOrigin { synchronization });
        tracing::debug!(
            variable = %self.settings.variable,
            request = %request,
            generation,
            sync_id = ?synchronization,
            "Requesting variable data"
        );
        self.source.request_data(request);
        generation
    }

    /// Process one completion. Completions of other sources and of requests
    /// not pending here produce no events.
    pub fn handle_completion(&mut self, completion: &Completion) -> Vec<VariableEvent> {
        if completion.source != self.source.id() {
            return Vec::new();
        }
        if !self.tracker.on_completed(&completion.request) {
            return Vec::new();
        }
        let drained = self.tracker.drain();
        let mut events = Vec::with_capacity(drained.len());
        for entry in drained {
            self.take_over(entry, &mut events);
        }
        events
    }

    fn take_over(&mut self, entry: PendingEntry<RequestOrigin>, events: &mut Vec<VariableEvent>) {
        let data = self.source.get_data(&entry.request);

        if entry.generation < self.superseded_below {
            tracing::debug!(
                variable = %self.settings.variable,
                generation = entry.generation,
                "Dropping superseded result"
            );
            if let Some(handle) = data {
                self.source.release_data(handle);
            }
        } else {
            match data {
                Some(handle) => {
                    self.texture = self.uploader.as_ref().and_then(|u| u.upload(&handle));
                    if let Some(previous) = self.current.replace(handle) {
                        self.source.release_data(previous);
                    }
                    events.push(VariableEvent::DataChanged {
                        request: entry.request,
                    });
                }
                None => {
                    tracing::warn!(
                        variable = %self.settings.variable,
                        request = %entry.request,
                        "No data delivered"
                    );
                    events.push(VariableEvent::DataUnavailable {
                        request: entry.request,
                    });
                }
            }
        }

        if let Some(sync_id) = entry.origin.synchronization {
            events.push(VariableEvent::SyncCompleted { sync_id });
        }
    }

    /// Process every completion already queued.
    pub fn process_completions(&mut self) -> Vec<VariableEvent> {
        let mut events = Vec::new();
        for completion in self.stream.drain_ready() {
            events.extend(self.handle_completion(&completion));
        }
        events
    }

    /// Wait for the next completion and process it. `None` once the
    /// completion bus is gone.
    pub async fn next_events(&mut self) -> Option<Vec<VariableEvent>> {
        let completion = self.stream.next().await?;
        Some(self.handle_completion(&completion))
    }

    /// Results of everything submitted so far will be consumed without
    /// becoming current. Returns how many submissions that affects.
    pub fn supersede_pending(&mut self) -> usize {
        self.superseded_below = self.tracker.next_generation();
        self.tracker.len()
    }

    /// Change what the variable shows. Pending requests are superseded and
    /// the current data is released.
    pub fn set_settings(&mut self, settings: VariableSettings) {
        if settings == self.settings {
            return;
        }
        self.supersede_pending();
        self.release_data_items();
        self.settings = settings;
    }

    pub fn current(&self) -> Option<&DataHandle> {
        self.current.as_ref()
    }

    pub fn texture(&self) -> Option<&TextureHandle> {
        self.texture.as_ref()
    }

    /// Release the current data and its texture.
    pub fn release_data_items(&mut self) {
        self.texture = None;
        if let Some(handle) = self.current.take() {
            self.source.release_data(handle);
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.tracker.len()
    }
}

impl std::fmt::Debug for ActorVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorVariable")
            .field("settings", &self.settings)
            .field("source", &self.source.name())
            .field("pending", &self.tracker.len())
            .field("current", &self.current.as_ref().map(|h| h.request().to_string()))
            .finish()
    }
}
