//! Completion bus.
//!
//! Sources announce finished requests by emitting a [`Completion`]; consumers
//! hold a [`CompletionStream`] and process completions one at a time on their
//! own dispatch loop. Delivery goes through unbounded tokio channels, so
//! emitting never blocks a worker.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use wxflow_core::{RequestKey, SourceId};

/// "Request finished" notification: exactly one per accepted `request_data`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Completion {
    pub source: SourceId,
    /// The request exactly as it was passed to `request_data`.
    pub request: RequestKey,
}

type SourceFilter = Arc<RwLock<HashSet<SourceId>>>;

struct Subscriber {
    filter: Option<SourceFilter>,
    tx: mpsc::UnboundedSender<Completion>,
}

impl Subscriber {
    fn wants(&self, source: SourceId) -> bool {
        match &self.filter {
            None => true,
            Some(filter) => filter
                .read()
                .map(|sources| sources.contains(&source))
                .unwrap_or(true),
        }
    }
}

/// Fan-out of completions to subscribed consumers.
#[derive(Clone, Default)]
pub struct CompletionBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl CompletionBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, filter: Option<SourceFilter>) -> CompletionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(Subscriber {
                filter: filter.clone(),
                tx,
            }),
            Err(_) => tracing::error!("Completion bus subscriber list poisoned"),
        }
        CompletionStream { rx, filter }
    }

    /// Receive completions of every source.
    pub fn subscribe(&self) -> CompletionStream {
        self.add(None)
    }

    /// Receive completions of the listed sources only. More sources can be
    /// added later with [`CompletionStream::follow`].
    pub fn subscribe_to<I>(&self, sources: I) -> CompletionStream
    where
        I: IntoIterator<Item = SourceId>,
    {
        let filter = Arc::new(RwLock::new(sources.into_iter().collect()));
        self.add(Some(filter))
    }

    /// Deliver `completion` to every interested subscriber. Subscribers whose
    /// stream has been dropped are removed.
    pub fn emit(&self, completion: Completion) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            tracing::error!(
                source = %completion.source,
                request = %completion.request,
                "Completion bus subscriber list poisoned, completion lost"
            );
            return;
        };
        tracing::trace!(
            source = %completion.source,
            request = %completion.request.digest(),
            "Emitting completion"
        );
        subscribers.retain(|subscriber| {
            if subscriber.tx.is_closed() {
                return false;
            }
            if subscriber.wants(completion.source) {
                subscriber.tx.send(completion.clone()).is_ok()
            } else {
                true
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for CompletionBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Consumer end of a bus subscription.
#[derive(Debug)]
pub struct CompletionStream {
    rx: mpsc::UnboundedReceiver<Completion>,
    filter: Option<SourceFilter>,
}

impl CompletionStream {
    /// Start receiving completions of `source`. No-op on unfiltered streams.
    pub fn follow(&self, source: SourceId) {
        if let Some(filter) = &self.filter {
            if let Ok(mut sources) = filter.write() {
                sources.insert(source);
            }
        }
    }

    /// Stop receiving completions of `source`. No-op on unfiltered streams.
    pub fn unfollow(&self, source: SourceId) {
        if let Some(filter) = &self.filter {
            if let Ok(mut sources) = filter.write() {
                sources.remove(&source);
            }
        }
    }

    /// Next completion if one is queued.
    pub fn try_next(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next completion. `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Every completion queued right now, in arrival order.
    pub fn drain_ready(&mut self) -> Vec<Completion> {
        let mut out = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            out.push(completion);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wxflow_core::RequestBuilder;

    fn completion(source: SourceId, member: &str) -> Completion {
        Completion {
            source,
            request: RequestBuilder::new().with("MEMBER", member).build(),
        }
    }

    #[test]
    fn test_unfiltered_stream_receives_everything() {
        let bus = CompletionBus::new();
        let mut stream = bus.subscribe();
        let (a, b) = (SourceId::new(), SourceId::new());
        bus.emit(completion(a, "0"));
        bus.emit(completion(b, "1"));
        let got = stream.drain_ready();
        assert_eq!(got, vec![completion(a, "0"), completion(b, "1")]);
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_filtered_stream_and_follow() {
        let bus = CompletionBus::new();
        let (a, b) = (SourceId::new(), SourceId::new());
        let mut stream = bus.subscribe_to([a]);
        bus.emit(completion(b, "0"));
        assert!(stream.try_next().is_none());

        stream.follow(b);
        bus.emit(completion(b, "1"));
        assert_eq!(stream.try_next(), Some(completion(b, "1")));

        stream.unfollow(a);
        bus.emit(completion(a, "2"));
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_dropped_streams_are_pruned() {
        let bus = CompletionBus::new();
        let stream = bus.subscribe();
        let _kept = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(stream);
        bus.emit(completion(SourceId::new(), "0"));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_next_awaits_emit_from_other_task() {
        let bus = CompletionBus::new();
        let mut stream = bus.subscribe();
        let source = SourceId::new();
        let emitter = bus.clone();
        tokio::spawn(async move {
            emitter.emit(completion(source, "7"));
        });
        assert_eq!(stream.next().await, Some(completion(source, "7")));
    }
}
