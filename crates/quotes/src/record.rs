//! Fixed-layout quote snapshot and the raw depth event it is built from.

/// Byte capacity of the inline id and datetime fields.
pub const ID_CAP: usize = 32;

/// Depth levels carried on the wire. Upstream populates levels 1-5; levels
/// 6-10 are reserved and always serialize as null.
pub const DEPTH_LEVELS: usize = 10;
pub const UPSTREAM_LEVELS: usize = 5;

/// Prices outside this open range are treated as unset and stored as zero.
pub fn valid_price(price: f64) -> bool {
    price > 1e-6 && price < 1e300
}

fn round2(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

fn gated(price: f64) -> f64 {
    if valid_price(price) {
        round2(price)
    } else {
        0.0
    }
}

fn str_from(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

fn copy_into(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf[n..].fill(0);
}

/// Raw depth event as delivered by the vendor feed callback.
#[derive(Debug, Clone, Default)]
pub struct DepthTick {
    pub instrument_id: String,
    /// Trading day in `YYYYMMDD` form.
    pub trading_day: String,
    /// Update time in `HH:MM:SS` form.
    pub update_time: String,
    pub update_millisec: u32,
    pub ask_price: [f64; UPSTREAM_LEVELS],
    pub ask_volume: [i32; UPSTREAM_LEVELS],
    pub bid_price: [f64; UPSTREAM_LEVELS],
    pub bid_volume: [i32; UPSTREAM_LEVELS],
    pub last_price: f64,
    pub highest: f64,
    pub lowest: f64,
    pub open: f64,
    pub close: f64,
    pub volume: i64,
    pub turnover: f64,
    pub open_interest: f64,
    pub settlement: f64,
    pub upper_limit: f64,
    pub lower_limit: f64,
    pub pre_open_interest: f64,
    pub pre_settlement: f64,
    pub pre_close: f64,
}

/// One instrument's latest quote in the shape the downstream protocol
/// serializes. `Copy` so SeqLock readers can take a bitwise snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct QuoteRecord {
    pub instrument_id: [u8; ID_CAP],
    pub datetime: [u8; ID_CAP],
    pub timestamp: u64,
    pub ask_price: [f64; DEPTH_LEVELS],
    pub ask_volume: [i32; DEPTH_LEVELS],
    pub bid_price: [f64; DEPTH_LEVELS],
    pub bid_volume: [i32; DEPTH_LEVELS],
    pub last_price: f64,
    pub highest: f64,
    pub lowest: f64,
    pub open: f64,
    pub close: f64,
    pub settlement: f64,
    pub upper_limit: f64,
    pub lower_limit: f64,
    pub pre_settlement: f64,
    pub pre_close: f64,
    pub amount: f64,
    pub volume: i64,
    pub open_interest: i64,
    pub pre_open_interest: i64,
}

impl QuoteRecord {
    /// Normalize a raw depth event. Prices are gated through the validity
    /// range and rounded to two decimals; the datetime string is composed
    /// byte-by-byte (this runs on the upstream callback thread).
    pub fn from_tick(tick: &DepthTick, display_id: &str, now_ms: u64) -> Self {
        let mut record = Self::default();
        copy_into(&mut record.instrument_id, display_id);
        compose_datetime(
            &mut record.datetime,
            &tick.trading_day,
            &tick.update_time,
            tick.update_millisec,
        );
        record.timestamp = now_ms;

        // Ask levels written 5 down to 1, bids 1 up to 5.
        for i in (0..UPSTREAM_LEVELS).rev() {
            if valid_price(tick.ask_price[i]) {
                record.ask_price[i] = round2(tick.ask_price[i]);
                record.ask_volume[i] = tick.ask_volume[i];
            }
        }
        for i in 0..UPSTREAM_LEVELS {
            if valid_price(tick.bid_price[i]) {
                record.bid_price[i] = round2(tick.bid_price[i]);
                record.bid_volume[i] = tick.bid_volume[i];
            }
        }

        record.last_price = gated(tick.last_price);
        record.highest = gated(tick.highest);
        record.lowest = gated(tick.lowest);
        record.open = gated(tick.open);
        record.close = gated(tick.close);
        record.settlement = gated(tick.settlement);
        record.upper_limit = gated(tick.upper_limit);
        record.lower_limit = gated(tick.lower_limit);
        record.pre_settlement = gated(tick.pre_settlement);
        record.pre_close = gated(tick.pre_close);

        record.volume = tick.volume;
        record.amount = tick.turnover;
        record.open_interest = tick.open_interest as i64;
        record.pre_open_interest = tick.pre_open_interest as i64;
        record
    }

    /// Display-form instrument id, NUL padding trimmed.
    pub fn display_id(&self) -> &str {
        str_from(&self.instrument_id)
    }

    pub fn datetime_str(&self) -> &str {
        str_from(&self.datetime)
    }

    pub fn set_display_id(&mut self, display_id: &str) {
        copy_into(&mut self.instrument_id, display_id);
    }
}

/// Assemble `YYYY-MM-DD HH:MM:SS.mmm` from the vendor's `YYYYMMDD` day and
/// `HH:MM:SS` time fields. A malformed day yields the time part alone; a
/// missing time yields an empty string.
fn compose_datetime(out: &mut [u8; ID_CAP], trading_day: &str, update_time: &str, millis: u32) {
    out.fill(0);
    let day = trading_day.as_bytes();
    let time = update_time.as_bytes();
    let mut at = 0;

    if day.len() >= 8 && day[0].is_ascii_digit() {
        out[0] = day[0];
        out[1] = day[1];
        out[2] = day[2];
        out[3] = day[3];
        out[4] = b'-';
        out[5] = day[4];
        out[6] = day[5];
        out[7] = b'-';
        out[8] = day[6];
        out[9] = day[7];
        out[10] = b' ';
        at = 11;
    }

    if time.len() >= 8 {
        out[at..at + 8].copy_from_slice(&time[..8]);
        out[at + 8] = b'.';
        out[at + 9] = b'0' + (millis / 100 % 10) as u8;
        out[at + 10] = b'0' + (millis / 10 % 10) as u8;
        out[at + 11] = b'0' + (millis % 10) as u8;
    } else if at > 0 {
        // Day without time: drop the trailing space.
        out[10] = 0;
    }
}
