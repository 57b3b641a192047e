//! The event hub: the server-side event source behind subscriptions.
//!
//! The surrounding application publishes events per channel; the hub assigns
//! each one a monotonically increasing `eventId`, keeps a finite ring of
//! recent events for cursor replay, and wakes tailing subscriptions through
//! a `watch` channel. Subscriptions pull from the ring at their own pace, so
//! a slow connection never blocks the publisher or other subscribers.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use homelink_types::messages::Channel;

use crate::metrics::{METRICS_ID_EVENTS_DROPPED, METRICS_ID_EVENTS_PUBLISHED};

/// One published event, as retained by the hub.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    /// Monotonic per-channel cursor.
    pub event_id: u64,
    /// Channel-specific event kind.
    pub event_type: String,
    /// Scope for [`Channel::Session`] events; `None` on the activity feed.
    pub session_scope: Option<String>,
    /// Opaque payload.
    pub data: Option<Value>,
}

struct ChannelLog {
    retention: usize,
    state: Mutex<LogState>,
    latest_tx: watch::Sender<u64>,
}

struct LogState {
    next_id: u64,
    events: VecDeque<PublishedEvent>,
}

impl ChannelLog {
    fn new(retention: usize) -> Self {
        let (latest_tx, _) = watch::channel(0);
        Self {
            retention,
            state: Mutex::new(LogState {
                next_id: 1,
                events: VecDeque::new(),
            }),
            latest_tx,
        }
    }
}

/// Shared hub of all event channels. Cheap to clone.
#[derive(Clone)]
pub struct EventHub(Arc<HubInner>);

struct HubInner {
    session: ChannelLog,
    activity: ChannelLog,
}

impl EventHub {
    /// Creates a hub retaining `retention` events per channel.
    pub fn new(retention: usize) -> Self {
        Self(Arc::new(HubInner {
            session: ChannelLog::new(retention),
            activity: ChannelLog::new(retention),
        }))
    }

    fn log(&self, channel: Channel) -> &ChannelLog {
        match channel {
            Channel::Session => &self.0.session,
            Channel::Activity => &self.0.activity,
        }
    }

    /// Publishes one event, returning its assigned id.
    ///
    /// `session_scope` restricts delivery to subscriptions carrying the same
    /// `sessionId` parameter; it is meaningful on [`Channel::Session`] only.
    pub fn publish(
        &self,
        channel: Channel,
        session_scope: Option<&str>,
        event_type: &str,
        data: Option<Value>,
    ) -> u64 {
        let log = self.log(channel);
        let event_id = {
            let mut state = log.state.lock();
            let event_id = state.next_id;
            state.next_id += 1;
            state.events.push_back(PublishedEvent {
                event_id,
                event_type: event_type.to_owned(),
                session_scope: session_scope.map(str::to_owned),
                data,
            });
            while state.events.len() > log.retention {
                state.events.pop_front();
                ::metrics::counter!(METRICS_ID_EVENTS_DROPPED).increment(1);
            }
            event_id
        };
        ::metrics::counter!(METRICS_ID_EVENTS_PUBLISHED).increment(1);
        // Receivers may all be gone; publishing is still fine.
        let _ = log.latest_tx.send(event_id);
        event_id
    }

    /// The id of the most recently published event on `channel` (0 if none).
    pub fn latest(&self, channel: Channel) -> u64 {
        *self.log(channel).latest_tx.borrow()
    }

    /// The oldest event id still retained on `channel`, if any.
    pub(crate) fn oldest_retained(&self, channel: Channel) -> Option<u64> {
        let log = self.log(channel);
        let state = log.state.lock();
        state.events.front().map(|event| event.event_id)
    }

    /// All retained events with `event_id > cursor`, in publish order.
    pub(crate) fn replay_after(&self, channel: Channel, cursor: u64) -> Vec<PublishedEvent> {
        let log = self.log(channel);
        let state = log.state.lock();
        state
            .events
            .iter()
            .filter(|event| event.event_id > cursor)
            .cloned()
            .collect()
    }

    /// A watch receiver observing the latest event id on `channel`.
    pub(crate) fn watch(&self, channel: Channel) -> watch::Receiver<u64> {
        self.log(channel).latest_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_per_channel() {
        let hub = EventHub::new(8);
        let a = hub.publish(Channel::Activity, None, "agent_started", None);
        let b = hub.publish(Channel::Activity, None, "agent_stopped", None);
        let s = hub.publish(Channel::Session, Some("abc"), "output", None);
        assert_eq!((a, b), (1, 2));
        assert_eq!(s, 1); // channels have independent cursors
        assert_eq!(hub.latest(Channel::Activity), 2);
    }

    #[test]
    fn replay_respects_cursor_and_retention() {
        let hub = EventHub::new(3);
        for i in 0..5u64 {
            hub.publish(Channel::Activity, None, &format!("e{i}"), None);
        }
        // ids 1..=5 published, ring keeps 3..=5
        assert_eq!(hub.oldest_retained(Channel::Activity), Some(3));
        let replay = hub.replay_after(Channel::Activity, 3);
        let ids: Vec<u64> = replay.iter().map(|event| event.event_id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert!(hub.replay_after(Channel::Activity, 5).is_empty());
    }

    #[tokio::test]
    async fn watch_wakes_on_publish() {
        let hub = EventHub::new(8);
        let mut rx = hub.watch(Channel::Session);
        hub.publish(Channel::Session, Some("abc"), "output", None);
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), 1);
    }
}
