//! Pipeline context: the memory managers, schedulers, completion bus and
//! source registry one application instance works with.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use wxflow_core::{
    ConfigError, DataItem, GpuTexture, SourceError, SourceId, WxflowConfig, WxflowResult,
};
use wxflow_storage::ResourceCache;

use crate::bus::CompletionBus;
use crate::gpu::TextureUploader;
use crate::scheduler::{ImmediateScheduler, Scheduler, WorkerScheduler, MULTI_THREAD, SINGLE_THREAD};
use crate::source::{DataProducer, DataSource, ItemManager, ScheduledSource};

/// Identifier of the CPU-side memory manager.
pub const SYSTEM_MEMORY: &str = "NWP";

/// Identifier of the GPU-side memory manager.
pub const VIDEO_MEMORY: &str = "GPU";

/// Everything sources and consumers share.
pub struct PipelineContext {
    config: WxflowConfig,
    system_cache: Arc<ResourceCache<dyn DataItem>>,
    video_cache: Arc<ResourceCache<GpuTexture>>,
    schedulers: HashMap<String, Arc<dyn Scheduler>>,
    default_scheduler: String,
    bus: CompletionBus,
    sources: RwLock<HashMap<String, Arc<dyn DataSource>>>,
}

impl PipelineContext {
    /// Context with a worker runtime of its own as default scheduler, plus an
    /// inline scheduler.
    pub fn new(config: WxflowConfig) -> WxflowResult<Self> {
        config.validate()?;
        let workers: Arc<dyn Scheduler> =
            Arc::new(WorkerScheduler::new(MULTI_THREAD, &config.scheduler)?);
        Ok(Self::assemble(config, workers))
    }

    /// Context whose default scheduler is `scheduler`. The inline scheduler
    /// is always registered too.
    pub fn with_scheduler(config: WxflowConfig, scheduler: Arc<dyn Scheduler>) -> WxflowResult<Self> {
        config.validate()?;
        Ok(Self::assemble(config, scheduler))
    }

    fn assemble(config: WxflowConfig, default: Arc<dyn Scheduler>) -> Self {
        let system_cache = Arc::new(ResourceCache::new(
            SYSTEM_MEMORY,
            config.memory.system_memory_limit_kb,
        ));
        let video_cache = Arc::new(ResourceCache::new(
            VIDEO_MEMORY,
            config.memory.video_memory_limit_kb,
        ));

        let default_scheduler = default.name().to_string();
        let mut schedulers: HashMap<String, Arc<dyn Scheduler>> = HashMap::new();
        schedulers.insert(
            SINGLE_THREAD.to_string(),
            Arc::new(ImmediateScheduler::new(SINGLE_THREAD)),
        );
        schedulers.insert(default_scheduler.clone(), default);

        tracing::info!(
            system_memory_limit_kb = config.memory.system_memory_limit_kb,
            video_memory_limit_kb = config.memory.video_memory_limit_kb,
            default_scheduler = %default_scheduler,
            "Pipeline context created"
        );

        Self {
            config,
            system_cache,
            video_cache,
            schedulers,
            default_scheduler,
            bus: CompletionBus::new(),
            sources: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WxflowConfig {
        &self.config
    }

    /// CPU-side memory manager.
    pub fn system_cache(&self) -> &Arc<ResourceCache<dyn DataItem>> {
        &self.system_cache
    }

    /// The CPU-side memory manager as sources see it.
    pub fn memory_manager(&self) -> Arc<ItemManager> {
        self.system_cache.clone()
    }

    pub fn video_cache(&self) -> &Arc<ResourceCache<GpuTexture>> {
        &self.video_cache
    }

    pub fn bus(&self) -> &CompletionBus {
        &self.bus
    }

    pub fn scheduler(&self, name: &str) -> Option<Arc<dyn Scheduler>> {
        self.schedulers.get(name).cloned()
    }

    pub fn default_scheduler(&self) -> WxflowResult<Arc<dyn Scheduler>> {
        self.scheduler(&self.default_scheduler).ok_or_else(|| {
            SourceError::SchedulerUnavailable {
                scheduler: self.default_scheduler.clone(),
                reason: "not registered".to_string(),
            }
            .into()
        })
    }

    /// Whether any registered scheduler is running a task.
    pub fn is_busy(&self) -> bool {
        self.schedulers.values().any(|s| s.is_busy())
    }

    /// Wrap `producer` in a source on the default scheduler and register it
    /// under its name.
    pub fn create_source<P: DataProducer>(&self, producer: P) -> WxflowResult<Arc<ScheduledSource<P>>> {
        let scheduler = self.default_scheduler()?;
        self.create_source_on(producer, scheduler)
    }

    /// Like [`create_source`](Self::create_source) on a specific scheduler.
    pub fn create_source_on<P: DataProducer>(
        &self,
        producer: P,
        scheduler: Arc<dyn Scheduler>,
    ) -> WxflowResult<Arc<ScheduledSource<P>>> {
        let source = Arc::new(ScheduledSource::new(
            producer,
            self.memory_manager(),
            scheduler,
            self.bus.clone(),
        ));
        self.register_source(source.clone())?;
        Ok(source)
    }

    /// Register `source` under its name. Names are unique.
    pub fn register_source(&self, source: Arc<dyn DataSource>) -> WxflowResult<()> {
        let mut sources = self
            .sources
            .write()
            .map_err(|_| SourceError::RegistryPoisoned)?;
        let name = source.name().to_string();
        if sources.contains_key(&name) {
            return Err(ConfigError::InvalidValue {
                field: "source".to_string(),
                value: name,
                reason: "a source with this name is already registered".to_string(),
            }
            .into());
        }
        tracing::debug!(source = %name, id = %source.id(), "Source registered");
        sources.insert(name, source);
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.read().ok()?.get(name).cloned()
    }

    /// Registered source names, sorted.
    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Texture uploader writing to the video memory manager on behalf of
    /// `owner`.
    pub fn texture_uploader(&self, owner: SourceId) -> TextureUploader {
        TextureUploader::new(owner, Arc::clone(&self.video_cache))
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("system", &self.system_cache.memory_status())
            .field("video", &self.video_cache.memory_status())
            .field("default_scheduler", &self.default_scheduler)
            .field("sources", &self.source_names())
            .finish()
    }
}
