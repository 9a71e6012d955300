//! Publish side of the quote path.
//!
//! The hub bundles the SeqLock cache, the global raw→display instrument map,
//! and the wake channel. [`QuoteHub::publish`] is the only code that runs on
//! an upstream callback thread: normalize, write the cache slot, enqueue the
//! raw id for the wake pump. Everything else (notify bookkeeping, client
//! peeks) happens on the downstream reactor.

use crate::cache::QuoteCache;
use crate::record::{DepthTick, QuoteRecord};
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;

pub struct QuoteHub {
    cache: QuoteCache,
    /// raw_id → display_id, recorded on downstream subscribe.
    display: DashMap<String, String>,
    wake_tx: mpsc::UnboundedSender<String>,
}

impl QuoteHub {
    /// Build the hub and hand back the wake receiver the gateway pump owns.
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        (
            Self {
                cache: QuoteCache::new(capacity),
                display: DashMap::new(),
                wake_tx,
            },
            wake_rx,
        )
    }

    pub fn cache(&self) -> &QuoteCache {
        &self.cache
    }

    /// Record the display form for a raw instrument id.
    pub fn map_display(&self, raw_id: &str, display_id: &str) {
        self.display
            .insert(raw_id.to_owned(), display_id.to_owned());
    }

    /// Display form of an instrument; falls back to the raw id.
    pub fn display_of(&self, raw_id: &str) -> String {
        self.display
            .get(raw_id)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| raw_id.to_owned())
    }

    /// Hot path: normalize a depth tick, write the cache, wake subscribers.
    pub fn publish(&self, tick: &DepthTick) {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let display = self.display_of(&tick.instrument_id);
        let record = QuoteRecord::from_tick(tick, &display, now_ms);

        let Some(index) = self.cache.get_or_create_index(&tick.instrument_id) else {
            // Cache full; counted and dropped, never overwrites a foreign slot.
            counter!("md_quotes_dropped_total").increment(1);
            return;
        };
        self.cache.store(index, &record);
        counter!("md_quotes_received_total").increment(1);

        // Wake pump may already be gone during shutdown.
        let _ = self.wake_tx.send(tick.instrument_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(raw_id: &str, last_price: f64) -> DepthTick {
        DepthTick {
            instrument_id: raw_id.into(),
            trading_day: "20260802".into(),
            update_time: "09:00:00".into(),
            last_price,
            ..Default::default()
        }
    }

    #[test]
    fn publish_writes_cache_and_signals_wake() {
        let (hub, mut wake_rx) = QuoteHub::new(4);
        hub.map_display("rb2410", "SHFE.rb2410");

        hub.publish(&tick("rb2410", 10.0));

        let index = hub.cache().index_of("rb2410").unwrap();
        let (record, version) = hub.cache().load(index).unwrap();
        assert_eq!(record.display_id(), "SHFE.rb2410");
        assert_eq!(record.last_price, 10.0);
        assert_eq!(version, 1);
        assert_eq!(wake_rx.try_recv().unwrap(), "rb2410");
    }

    #[test]
    fn unmapped_instrument_keeps_raw_id() {
        let (hub, _wake_rx) = QuoteHub::new(4);
        hub.publish(&tick("ag2412", 5.0));

        let index = hub.cache().index_of("ag2412").unwrap();
        let (record, _) = hub.cache().load(index).unwrap();
        assert_eq!(record.display_id(), "ag2412");
        assert_eq!(hub.display_of("ag2412"), "ag2412");
    }

    #[test]
    fn overflow_publish_is_dropped() {
        let (hub, mut wake_rx) = QuoteHub::new(1);
        hub.publish(&tick("a", 1.0));
        wake_rx.try_recv().unwrap();

        hub.publish(&tick("b", 2.0));
        assert!(hub.cache().index_of("b").is_none());
        assert!(wake_rx.try_recv().is_err());
    }

    #[test]
    fn versions_advance_per_publish() {
        let (hub, _wake_rx) = QuoteHub::new(2);
        for i in 1..=5 {
            hub.publish(&tick("a", i as f64));
        }
        let index = hub.cache().index_of("a").unwrap();
        let (_, version) = hub.cache().load(index).unwrap();
        assert_eq!(version, 5);
    }
}
