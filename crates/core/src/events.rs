use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use drumseq_transport::SyncGroupId;
use serde::Serialize;

/// What part of a track an update touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackChange {
    Grid,
    Instruments,
    Tempo,
    TimeSignature,
    History,
    Pattern,
    /// Replaced from a saved snapshot.
    Restored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TrackEvent {
    TrackCreated {
        track_id: String,
    },
    TrackUpdated {
        track_id: String,
        change: TrackChange,
    },
    TrackDeleted {
        track_id: String,
    },
    SyncGroupUpdated {
        track_id: String,
        group: SyncGroupId,
    },
    SyncGroupReset {
        track_id: String,
        group: SyncGroupId,
    },
    SyncGroupCopied {
        track_id: String,
        from: SyncGroupId,
        to: SyncGroupId,
    },
    BarSyncGroupChanged {
        track_id: String,
        bar: usize,
        group: SyncGroupId,
    },
    CombinedDataUpdated {
        track_id: String,
        revision: u64,
    },
    TrackActiveChanged {
        track_id: String,
        active: bool,
    },
    DataImported {
        tracks: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TrackCreated,
    TrackUpdated,
    TrackDeleted,
    SyncGroupUpdated,
    SyncGroupReset,
    SyncGroupCopied,
    BarSyncGroupChanged,
    CombinedDataUpdated,
    TrackActiveChanged,
    DataImported,
}

impl TrackEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TrackEvent::TrackCreated { .. } => EventKind::TrackCreated,
            TrackEvent::TrackUpdated { .. } => EventKind::TrackUpdated,
            TrackEvent::TrackDeleted { .. } => EventKind::TrackDeleted,
            TrackEvent::SyncGroupUpdated { .. } => EventKind::SyncGroupUpdated,
            TrackEvent::SyncGroupReset { .. } => EventKind::SyncGroupReset,
            TrackEvent::SyncGroupCopied { .. } => EventKind::SyncGroupCopied,
            TrackEvent::BarSyncGroupChanged { .. } => EventKind::BarSyncGroupChanged,
            TrackEvent::CombinedDataUpdated { .. } => EventKind::CombinedDataUpdated,
            TrackEvent::TrackActiveChanged { .. } => EventKind::TrackActiveChanged,
            TrackEvent::DataImported { .. } => EventKind::DataImported,
        }
    }

    /// Track the event concerns, if it concerns a single one.
    pub fn track_id(&self) -> Option<&str> {
        match self {
            TrackEvent::TrackCreated { track_id }
            | TrackEvent::TrackUpdated { track_id, .. }
            | TrackEvent::TrackDeleted { track_id }
            | TrackEvent::SyncGroupUpdated { track_id, .. }
            | TrackEvent::SyncGroupReset { track_id, .. }
            | TrackEvent::SyncGroupCopied { track_id, .. }
            | TrackEvent::BarSyncGroupChanged { track_id, .. }
            | TrackEvent::CombinedDataUpdated { track_id, .. }
            | TrackEvent::TrackActiveChanged { track_id, .. } => Some(track_id),
            TrackEvent::DataImported { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type Listener = Arc<dyn Fn(&TrackEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    filter: Option<EventKind>,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

/// Synchronous publish/subscribe for [`TrackEvent`]s.
///
/// Listeners run on the emitting thread, in subscription order. A listener
/// may subscribe or unsubscribe from inside its callback; the change applies
/// from the next event.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&TrackEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.add(None, Arc::new(listener))
    }

    /// Listen to one kind of event only.
    pub fn subscribe_to(
        &self,
        kind: EventKind,
        listener: impl Fn(&TrackEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add(Some(kind), Arc::new(listener))
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|sub| sub.id != id);
        registry.subscriptions.len() != before
    }

    pub fn emit(&self, event: &TrackEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry
                .subscriptions
                .iter()
                .filter(|sub| sub.filter.is_none_or(|filter| filter == kind))
                .map(|sub| sub.listener.clone())
                .collect()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::error!("event listener panicked on {kind:?}");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .len()
    }

    fn add(&self, filter: Option<EventKind>, listener: Listener) -> SubscriptionId {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.subscriptions.push(Subscription {
            id,
            filter,
            listener,
        });
        id
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
