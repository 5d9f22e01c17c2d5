//! wxflow Pipeline - Sources, Completions and Filter Chains
//!
//! The behaviour layer on top of `wxflow-core` and `wxflow-storage`:
//!
//! - [`source`]: the [`DataSource`] protocol and [`ScheduledSource`], which
//!   deduplicates computations per cache key and emits one completion per
//!   request
//! - [`bus`]: completion delivery to consumers
//! - [`scheduler`]: where computations run
//! - [`tracker`]: FIFO delivery of out-of-order completions
//! - [`filter_chain`] and [`filters`]: linear chains of line filters
//! - [`variable`] and [`intersection`]: the consumers
//! - [`context`]: the explicit context holding caches, schedulers and sources
//!
//! Nothing in here blocks waiting for a result. Consumers submit requests,
//! then process completions on their own loop.

pub mod bus;
pub mod context;
pub mod filter_chain;
pub mod filters;
pub mod gpu;
pub mod intersection;
pub mod scheduler;
pub mod source;
pub mod telemetry;
pub mod tracker;
pub mod variable;

pub use bus::{Completion, CompletionBus, CompletionStream};
pub use context::PipelineContext;
pub use filter_chain::{ChainStep, FilterChain, FilterChainBuilder, FilterStage};
pub use filters::{GeometricLengthFilter, SelectionOp, ValueThresholdFilter};
pub use gpu::{TextureHandle, TextureUploader};
pub use intersection::{
    IntersectionEvent, IntersectionPipeline, IntersectionSources, LineFilterSettings,
};
pub use scheduler::{ImmediateScheduler, Scheduler, WorkerScheduler};
pub use source::{Claim, DataHandle, DataProducer, DataSource, ProduceContext, ScheduledSource};
pub use tracker::{PendingEntry, PendingRequestTracker};
pub use variable::{ActorVariable, EnsembleMode, VariableEvent, VariableSettings};
