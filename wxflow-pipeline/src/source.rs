//! Data sources.
//!
//! A [`DataSource`] turns a [`RequestKey`] into a cached data item. Requests
//! are accepted unconditionally and answered later by exactly one
//! [`Completion`] on the bus; the result is then fetched with
//! [`DataSource::get_data`], which acquires it from the cache.
//!
//! [`ScheduledSource`] implements the protocol around a [`DataProducer`], the
//! part that actually computes something. Per cache key it guarantees at most
//! one computation at a time: concurrent requests join the computation in
//! flight, later ones are served from the cache.
//!
//! # Claims
//!
//! Every accepted request holds a *claim* on its result until the consumer
//! calls `get_data` (which turns the claim into a reference) or
//! `release_claim`. Claims keep a freshly computed item from being evicted
//! before the consumer had a chance to pick it up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use wxflow_core::{CacheError, DataItem, RequestKey, SourceError, SourceId, WxflowResult};
use wxflow_storage::{MemoryManager, OwnerScopedKey, ResourceHandle};

use crate::bus::{Completion, CompletionBus};
use crate::scheduler::Scheduler;

/// Acquired reference on a cached data item.
pub type DataHandle = ResourceHandle<dyn DataItem>;

/// Memory manager holding data items.
pub type ItemManager = dyn MemoryManager<dyn DataItem>;

// ============================================================================
// TRAITS
// ============================================================================

/// A pull-based asynchronous source of data items.
pub trait DataSource: Send + Sync {
    fn id(&self) -> SourceId;

    fn name(&self) -> &str;

    /// Keys this source reads: its own plus those of every registered input,
    /// prefixed by the input's registration prefix. Sorted.
    fn required_keys(&self) -> Vec<String>;

    /// Start producing `request`. Returns immediately; exactly one
    /// [`Completion`] carrying `request` is emitted per call, also on failure.
    fn request_data(&self, request: RequestKey);

    /// Make the result of `request` available and hold a claim on it.
    ///
    /// The claim is registered before this returns; the future resolves once
    /// the item is in the cache. Used by downstream sources to consume their
    /// inputs.
    fn prepare(&self, request: &RequestKey) -> BoxFuture<'static, WxflowResult<()>>;

    /// Acquire the result of a completed request, consuming one claim.
    fn get_data(&self, request: &RequestKey) -> Option<DataHandle>;

    /// Give back a result obtained from [`get_data`](Self::get_data).
    fn release_data(&self, handle: DataHandle) {
        drop(handle);
    }

    /// Drop the claim of a completed request whose result is not wanted.
    fn release_claim(&self, request: &RequestKey);

    /// Cache key a request submitted now would be claimed under. `None` if
    /// the request lacks required keys.
    ///
    /// The key depends on the inputs registered at the time of the call, so
    /// consumers that may re-wire a source between submission and completion
    /// keep the key of the submission (see [`Claim`]).
    fn claim_key(&self, request: &RequestKey) -> Option<OwnerScopedKey>;

    /// Like [`get_data`](Self::get_data) for a claim made under `key`.
    fn get_claimed(&self, key: &OwnerScopedKey) -> Option<DataHandle>;

    /// Register `source` as input under `prefix`, replacing any source
    /// previously registered under the same prefix.
    fn register_input(&self, prefix: &str, source: Arc<dyn DataSource>);

    /// Remove every input registered under a non-empty prefix.
    fn deregister_prefixed_inputs(&self);

    fn input(&self, prefix: &str) -> Option<Arc<dyn DataSource>>;
}

/// A submitted request together with the cache key its claim was made under.
///
/// Holding on to the key keeps the claim redeemable after the source's inputs
/// change, which would otherwise reduce the same request to a different key.
pub struct Claim {
    source: Arc<dyn DataSource>,
    request: RequestKey,
    key: Option<OwnerScopedKey>,
}

impl Claim {
    /// Submit `request` to `source` and remember the key it is claimed under.
    pub fn submit(source: &Arc<dyn DataSource>, request: RequestKey) -> Self {
        let key = source.claim_key(&request);
        source.request_data(request.clone());
        Self {
            source: Arc::clone(source),
            request,
            key,
        }
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    pub fn request(&self) -> &RequestKey {
        &self.request
    }

    pub fn key(&self) -> Option<&OwnerScopedKey> {
        self.key.as_ref()
    }

    /// Whether `completion` answers this claim.
    pub fn is_answered_by(&self, source: SourceId, request: &RequestKey) -> bool {
        self.source.id() == source && &self.request == request
    }

    /// Redeem the claim. `None` if the request produced nothing.
    pub fn redeem(self) -> Option<DataHandle> {
        let key = self.key?;
        self.source.get_claimed(&key)
    }

    /// Redeem the claim and drop the result at once.
    pub fn discard(self) {
        let source = Arc::clone(&self.source);
        if let Some(handle) = self.redeem() {
            source.release_data(handle);
        }
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("source", &self.source.name())
            .field("request", &self.request.to_string())
            .field("key", &self.key.as_ref().map(|k| k.to_string()))
            .finish()
    }
}

/// The computation behind a [`ScheduledSource`].
#[async_trait]
pub trait DataProducer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Request keys this producer reads itself.
    fn locally_required_keys(&self) -> Vec<String>;

    /// Compute the item for `request`, which has already been reduced to the
    /// source's required keys.
    async fn produce(
        &self,
        request: &RequestKey,
        ctx: &ProduceContext,
    ) -> WxflowResult<Arc<dyn DataItem>>;
}

/// Inputs visible to a producer while it computes one request.
pub struct ProduceContext {
    source_name: String,
    inputs: BTreeMap<String, Arc<dyn DataSource>>,
}

impl ProduceContext {
    pub fn new(source_name: impl Into<String>, inputs: BTreeMap<String, Arc<dyn DataSource>>) -> Self {
        Self {
            source_name: source_name.into(),
            inputs,
        }
    }

    pub fn input(&self, prefix: &str) -> WxflowResult<Arc<dyn DataSource>> {
        self.inputs.get(prefix).cloned().ok_or_else(|| {
            SourceError::NoInput {
                source_name: self.source_name.clone(),
                prefix: prefix.to_string(),
            }
            .into()
        })
    }

    pub fn has_input(&self, prefix: &str) -> bool {
        self.inputs.contains_key(prefix)
    }

    /// Fetch the input registered under `prefix`.
    ///
    /// The input is asked for the fields of `request` carrying `prefix`, with
    /// the prefix stripped; an empty prefix forwards the whole request.
    pub async fn fetch_input(&self, prefix: &str, request: &RequestKey) -> WxflowResult<DataHandle> {
        let input = self.input(prefix)?;
        let sub_request = if prefix.is_empty() {
            request.clone()
        } else {
            request.sub_request(prefix)
        };
        input.prepare(&sub_request).await?;
        input.get_data(&sub_request).ok_or_else(|| {
            SourceError::NotAvailable {
                source_name: input.name().to_string(),
                request: sub_request.to_string(),
            }
            .into()
        })
    }
}

// ============================================================================
// SCHEDULED SOURCE
// ============================================================================

type Computation = Shared<BoxFuture<'static, WxflowResult<()>>>;

struct InFlight {
    /// Claimants waiting for this computation, including its initiator.
    claims: u32,
    done: Computation,
}

struct SourceInner<P> {
    id: SourceId,
    name: String,
    producer: P,
    cache: Arc<ItemManager>,
    scheduler: Arc<dyn Scheduler>,
    bus: CompletionBus,
    inputs: RwLock<BTreeMap<String, Arc<dyn DataSource>>>,
    in_flight: Mutex<HashMap<OwnerScopedKey, InFlight>>,
}

/// A [`DataSource`] that runs a [`DataProducer`] on a scheduler and caches its
/// results in a shared memory manager.
pub struct ScheduledSource<P> {
    inner: Arc<SourceInner<P>>,
}

impl<P> Clone for ScheduledSource<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: DataProducer> ScheduledSource<P> {
    pub fn new(
        producer: P,
        cache: Arc<ItemManager>,
        scheduler: Arc<dyn Scheduler>,
        bus: CompletionBus,
    ) -> Self {
        let name = producer.name().to_string();
        Self {
            inner: Arc::new(SourceInner {
                id: SourceId::new(),
                name,
                producer,
                cache,
                scheduler,
                bus,
                inputs: RwLock::new(BTreeMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn producer(&self) -> &P {
        &self.inner.producer
    }

    /// Owner-scoped cache key for `request`.
    ///
    /// Fails with `MissingKeys` if a locally required key is absent; otherwise
    /// the request is reduced to [`DataSource::required_keys`].
    pub fn cache_key(&self, request: &RequestKey) -> WxflowResult<OwnerScopedKey> {
        self.inner.cache_key(request)
    }

    /// Number of computations currently running.
    pub fn computations_in_flight(&self) -> usize {
        self.inner.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

impl<P: DataProducer> SourceInner<P> {
    fn inputs_snapshot(&self) -> BTreeMap<String, Arc<dyn DataSource>> {
        self.inputs.read().map(|i| i.clone()).unwrap_or_default()
    }

    fn required_keys(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = self.producer.locally_required_keys().into_iter().collect();
        for (prefix, input) in self.inputs_snapshot() {
            for key in input.required_keys() {
                keys.insert(format!("{}{}", prefix, key));
            }
        }
        keys.into_iter().collect()
    }

    fn cache_key(&self, request: &RequestKey) -> WxflowResult<OwnerScopedKey> {
        let missing = request.missing(self.producer.locally_required_keys());
        if !missing.is_empty() {
            return Err(SourceError::MissingKeys {
                source_name: self.name.clone(),
                request: request.to_string(),
                missing,
            }
            .into());
        }
        Ok(OwnerScopedKey::new(
            self.id,
            request.reduced_to(self.required_keys()),
        ))
    }

    fn lock_in_flight(
        &self,
    ) -> WxflowResult<std::sync::MutexGuard<'_, HashMap<OwnerScopedKey, InFlight>>> {
        self.in_flight.lock().map_err(|_| {
            CacheError::LockPoisoned {
                cache: format!("{} in-flight map", self.name),
            }
            .into()
        })
    }

    /// Runs the producer and stores its result with one reservation per
    /// claimant that joined in the meantime.
    async fn compute(self: Arc<Self>, key: OwnerScopedKey) -> WxflowResult<()> {
        let ctx = ProduceContext::new(self.name.clone(), self.inputs_snapshot());
        tracing::debug!(source = %self.name, request = %key.request(), "Computing");
        let produced = self.producer.produce(key.request(), &ctx).await;

        let mut in_flight = self.lock_in_flight()?;
        let claims = in_flight.remove(&key).map_or(1, |entry| entry.claims);

        let item = match produced {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(
                    source = %self.name,
                    request = %key.request(),
                    error = %e,
                    "Production failed"
                );
                return Err(e);
            }
        };

        match self.cache.store(key.clone(), item, claims) {
            Ok(()) => Ok(()),
            Err(CacheError::KeyCollision { .. }) => {
                // The existing entry is authoritative; move our claims onto it.
                for _ in 0..claims {
                    self.cache.reserve(&key);
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<P: DataProducer> DataSource for ScheduledSource<P> {
    fn id(&self) -> SourceId {
        self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn required_keys(&self) -> Vec<String> {
        self.inner.required_keys()
    }

    fn request_data(&self, request: RequestKey) {
        let prepared = self.prepare(&request);
        let bus = self.inner.bus.clone();
        let source = self.inner.id;
        let name = self.inner.name.clone();
        tracing::debug!(source = %name, request = %request, "Request accepted");

        self.inner.scheduler.schedule(
            async move {
                if let Err(e) = prepared.await {
                    tracing::debug!(
                        source = %name,
                        request = %request,
                        error = %e,
                        "Request finished without data"
                    );
                }
                bus.emit(Completion { source, request });
            }
            .boxed(),
        );
    }

    fn prepare(&self, request: &RequestKey) -> BoxFuture<'static, WxflowResult<()>> {
        let key = match self.inner.cache_key(request) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(source = %self.inner.name, error = %e, "Invalid request");
                return future::ready(Err(e)).boxed();
            }
        };

        let mut in_flight = match self.inner.lock_in_flight() {
            Ok(guard) => guard,
            Err(e) => return future::ready(Err(e)).boxed(),
        };

        if let Some(entry) = in_flight.get_mut(&key) {
            entry.claims += 1;
            tracing::debug!(
                source = %self.inner.name,
                request = %key.request(),
                claims = entry.claims,
                "Joining computation in flight"
            );
            return entry.done.clone().boxed();
        }

        if self.inner.cache.reserve(&key) {
            tracing::debug!(source = %self.inner.name, request = %key.request(), "Cache hit");
            return future::ready(Ok(())).boxed();
        }

        let done = Arc::clone(&self.inner).compute(key.clone()).boxed().shared();
        in_flight.insert(
            key,
            InFlight {
                claims: 1,
                done: done.clone(),
            },
        );
        done.boxed()
    }

    fn get_data(&self, request: &RequestKey) -> Option<DataHandle> {
        let key = match self.inner.cache_key(request) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(source = %self.inner.name, error = %e, "Invalid request");
                return None;
            }
        };
        self.get_claimed(&key)
    }

    fn get_claimed(&self, key: &OwnerScopedKey) -> Option<DataHandle> {
        let handle = ResourceHandle::checkout(&self.inner.cache, key);
        if handle.is_none() {
            let err = SourceError::NotAvailable {
                source_name: self.inner.name.clone(),
                request: key.request().to_string(),
            };
            tracing::debug!(error = %err, "No data for request");
        }
        handle
    }

    fn claim_key(&self, request: &RequestKey) -> Option<OwnerScopedKey> {
        self.inner.cache_key(request).ok()
    }

    fn release_claim(&self, request: &RequestKey) {
        if let Ok(key) = self.inner.cache_key(request) {
            self.inner.cache.cancel_reservation(&key);
        }
    }

    fn register_input(&self, prefix: &str, source: Arc<dyn DataSource>) {
        tracing::debug!(
            source = %self.inner.name,
            prefix,
            input = %source.name(),
            "Registering input"
        );
        match self.inner.inputs.write() {
            Ok(mut inputs) => {
                inputs.insert(prefix.to_string(), source);
            }
            Err(_) => tracing::error!(source = %self.inner.name, "Input registry poisoned"),
        }
    }

    fn deregister_prefixed_inputs(&self) {
        if let Ok(mut inputs) = self.inner.inputs.write() {
            inputs.retain(|prefix, _| prefix.is_empty());
        }
    }

    fn input(&self, prefix: &str) -> Option<Arc<dyn DataSource>> {
        self.inner
            .inputs
            .read()
            .ok()
            .and_then(|inputs| inputs.get(prefix).cloned())
    }
}

impl<P> std::fmt::Debug for ScheduledSource<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledSource")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
