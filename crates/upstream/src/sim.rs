//! Simulated feed connector.
//!
//! Stands in for the native vendor binding in local runs and integration
//! tests: every handle gets a driver thread that acks control requests and
//! emits random-walk depth ticks for the subscribed instruments. All
//! callbacks are delivered off the caller's thread, matching the threading
//! model of the real binding.

use crate::api::{FeedConnector, FeedHandle, FeedRspError, FeedSpi};
use chrono::Utc;
use quotes::DepthTick;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

enum Command {
    Login,
    Subscribe(String),
    Unsubscribe(String),
    Release,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Spacing between generated ticks per handle.
    pub tick_interval: Duration,
    /// Starting price for instruments never seen before.
    pub start_price: f64,
    /// Per-tick relative price step bound.
    pub volatility: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            start_price: 100.0,
            volatility: 0.002,
        }
    }
}

#[derive(Debug, Default)]
pub struct SimConnector {
    config: SimConfig,
}

impl SimConnector {
    pub fn new(config: SimConfig) -> Self {
        Self { config }
    }
}

impl FeedConnector for SimConnector {
    fn connect(
        &self,
        _flow_dir: &Path,
        front_addr: &str,
        spi: Arc<dyn FeedSpi>,
    ) -> Result<Box<dyn FeedHandle>, FeedRspError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let config = self.config.clone();
        let front = front_addr.to_owned();
        std::thread::spawn(move || drive(config, front, spi, rx));
        Ok(Box::new(SimHandle { tx }))
    }
}

struct SimHandle {
    tx: Sender<Command>,
}

impl SimHandle {
    fn send(&self, command: Command) -> Result<(), FeedRspError> {
        self.tx
            .send(command)
            .map_err(|_| FeedRspError::new(-1, "sim feed driver gone"))
    }
}

impl FeedHandle for SimHandle {
    fn login(&self, _broker_id: &str, _user_id: &str, _password: &str) -> Result<(), FeedRspError> {
        self.send(Command::Login)
    }

    fn subscribe(&self, raw_id: &str) -> Result<(), FeedRspError> {
        self.send(Command::Subscribe(raw_id.to_owned()))
    }

    fn unsubscribe(&self, raw_id: &str) -> Result<(), FeedRspError> {
        self.send(Command::Unsubscribe(raw_id.to_owned()))
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Release);
    }
}

struct SimInstrument {
    price: f64,
    volume: i64,
}

fn drive(config: SimConfig, front: String, spi: Arc<dyn FeedSpi>, rx: Receiver<Command>) {
    debug!(%front, "sim feed driver up");
    spi.on_front_connected();

    let mut instruments: HashMap<String, SimInstrument> = HashMap::new();
    loop {
        match rx.recv_timeout(config.tick_interval) {
            Ok(Command::Login) => spi.on_login(None),
            Ok(Command::Subscribe(raw_id)) => {
                instruments.entry(raw_id.clone()).or_insert(SimInstrument {
                    price: config.start_price,
                    volume: 0,
                });
                spi.on_sub_ack(&raw_id, None);
            }
            Ok(Command::Unsubscribe(raw_id)) => {
                instruments.remove(&raw_id);
                spi.on_unsub_ack(&raw_id, None);
            }
            Ok(Command::Release) => break,
            Err(RecvTimeoutError::Timeout) => {
                for (raw_id, state) in instruments.iter_mut() {
                    spi.on_depth(&next_tick(raw_id, state, config.volatility));
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(%front, "sim feed driver down");
}

fn next_tick(raw_id: &str, state: &mut SimInstrument, volatility: f64) -> DepthTick {
    let mut rng = rand::thread_rng();
    let step = state.price * volatility;
    state.price = (state.price + rng.gen_range(-step..=step)).max(0.01);
    state.volume += rng.gen_range(1..100);

    let now = Utc::now();
    let mut tick = DepthTick {
        instrument_id: raw_id.to_owned(),
        trading_day: now.format("%Y%m%d").to_string(),
        update_time: now.format("%H:%M:%S").to_string(),
        update_millisec: now.timestamp_subsec_millis(),
        last_price: state.price,
        volume: state.volume,
        turnover: state.price * state.volume as f64,
        open_interest: 10_000.0,
        pre_settlement: state.price,
        pre_close: state.price,
        upper_limit: state.price * 1.1,
        lower_limit: state.price * 0.9,
        ..Default::default()
    };
    for level in 0..5 {
        let spread = 0.01 * (level + 1) as f64;
        tick.bid_price[level] = state.price - spread;
        tick.bid_volume[level] = rng.gen_range(1..50);
        tick.ask_price[level] = state.price + spread;
        tick.ask_volume[level] = rng.gen_range(1..50);
    }
    tick
}
