// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-process pub-sub for optional event-driven wake-ups. Workers still run
//! their interval loops; the bus only lets them react sooner.

use tokio::sync::broadcast;

use crunchcoord_core::entities::FeedScope;

#[derive(Debug, Clone)]
pub enum Event {
    FeedUpdated { scope: FeedScope, records: u64 },
    CycleScored { cycle_id: String },
    CheckpointBuilt { checkpoint_id: String },
}

#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget: publishing with no subscribers is fine.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = Bus::default();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(Event::CycleScored {
            cycle_id: "CYC_1".to_string(),
        });

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                Event::CycleScored { cycle_id } => assert_eq!(cycle_id, "CYC_1"),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = Bus::default();
        bus.publish(Event::CheckpointBuilt {
            checkpoint_id: "CKP_1".to_string(),
        });
    }
}
