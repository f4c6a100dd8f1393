use std::{collections::HashMap, future::Future, sync::Arc};

use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, watch, Mutex,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use fanwatch_common::DeviceState;

const FEED_CAPACITY: usize = 64;

/// Published state of one device: the latest snapshot plus the live sequence of snapshots as
/// they arrive from the network.
#[derive(Clone)]
pub struct DeviceFeed {
    latest: watch::Sender<Option<DeviceState>>,
    events: broadcast::Sender<DeviceState>,
}

impl DeviceFeed {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Self { latest, events }
    }

    pub fn publish(&self, state: DeviceState) {
        self.latest.send_replace(Some(state.clone()));
        // No live subscribers is fine; the latest snapshot is still kept.
        let _ = self.events.send(state);
    }

    pub fn latest(&self) -> Option<DeviceState> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceState> {
        self.events.subscribe()
    }
}

impl Default for DeviceFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// A new feed's address and its live sequence.
pub type FeedSubscription = (String, broadcast::Receiver<DeviceState>);

/// Feeds keyed by device address.
#[derive(Clone, Default)]
pub struct DeviceHub {
    feeds: Arc<Mutex<HashMap<String, DeviceFeed>>>,
    observer: Option<mpsc::UnboundedSender<FeedSubscription>>,
}

impl DeviceHub {
    /// Hub that hands every feed it creates to the returned receiver. The subscription is taken
    /// before the feed is handed out, so the first state published on it is not missed.
    pub fn observed() -> (Self, mpsc::UnboundedReceiver<FeedSubscription>) {
        let (observer, subscriptions) = mpsc::unbounded_channel();
        let hub = Self {
            feeds: Arc::default(),
            observer: Some(observer),
        };
        (hub, subscriptions)
    }

    pub async fn feed(&self, ip_address: &str) -> DeviceFeed {
        let mut feeds = self.feeds.lock().await;
        if let Some(feed) = feeds.get(ip_address) {
            return feed.clone();
        }

        let feed = DeviceFeed::new();
        if let Some(observer) = &self.observer {
            if observer.send((ip_address.to_string(), feed.subscribe())).is_err() {
                warn!("{ip_address}: device feed has no relay");
            }
        }
        feeds.insert(ip_address.to_string(), feed.clone());
        feed
    }

    pub async fn snapshots(&self) -> Vec<DeviceState> {
        let feeds = self.feeds.lock().await;
        let mut states: Vec<DeviceState> = feeds.values().filter_map(DeviceFeed::latest).collect();
        states.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));
        states
    }

    pub async fn any_operating(&self) -> bool {
        self.snapshots().await.iter().any(DeviceState::is_operating)
    }
}

/// Hands every state of every observed feed to `sink`, one task per feed, in publish order.
pub fn spawn_relays<F, Fut>(
    mut subscriptions: mpsc::UnboundedReceiver<FeedSubscription>,
    cancel: CancellationToken,
    sink: F,
) -> JoinHandle<()>
where
    F: Fn(DeviceState) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = subscriptions.recv() => next,
            };
            let Some((ip_address, events)) = next else {
                return;
            };
            tokio::spawn(relay(ip_address, events, cancel.clone(), sink.clone()));
        }
    })
}

async fn relay<F, Fut>(
    ip_address: String,
    mut events: broadcast::Receiver<DeviceState>,
    cancel: CancellationToken,
    sink: F,
) where
    F: Fn(DeviceState) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(state) => sink(state).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!("{ip_address}: relay fell behind, {skipped} state(s) dropped")
            }
            Err(RecvError::Closed) => return,
        }
    }
}
