//! Full and differential JSON serialization of quote records.
//!
//! A client's first delivery of an instrument carries every field of the
//! schema (reserved depth levels 6-10 and `average` as null); subsequent
//! deliveries carry only the fields whose value changed since the client's
//! last-sent record. Float comparison is exact: upstream rounding to two
//! decimals makes identity well-defined.

use crate::record::{QuoteRecord, DEPTH_LEVELS, UPSTREAM_LEVELS};
use serde_json::{Map, Value};

pub const ASK_PRICE_KEYS: [&str; DEPTH_LEVELS] = [
    "ask_price1",
    "ask_price2",
    "ask_price3",
    "ask_price4",
    "ask_price5",
    "ask_price6",
    "ask_price7",
    "ask_price8",
    "ask_price9",
    "ask_price10",
];
pub const ASK_VOLUME_KEYS: [&str; DEPTH_LEVELS] = [
    "ask_volume1",
    "ask_volume2",
    "ask_volume3",
    "ask_volume4",
    "ask_volume5",
    "ask_volume6",
    "ask_volume7",
    "ask_volume8",
    "ask_volume9",
    "ask_volume10",
];
pub const BID_PRICE_KEYS: [&str; DEPTH_LEVELS] = [
    "bid_price1",
    "bid_price2",
    "bid_price3",
    "bid_price4",
    "bid_price5",
    "bid_price6",
    "bid_price7",
    "bid_price8",
    "bid_price9",
    "bid_price10",
];
pub const BID_VOLUME_KEYS: [&str; DEPTH_LEVELS] = [
    "bid_volume1",
    "bid_volume2",
    "bid_volume3",
    "bid_volume4",
    "bid_volume5",
    "bid_volume6",
    "bid_volume7",
    "bid_volume8",
    "bid_volume9",
    "bid_volume10",
];

fn float(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Full-frame quote object: every key of the schema.
pub fn quote_to_json(record: &QuoteRecord) -> Value {
    let mut object = Map::new();
    object.insert("instrument_id".into(), record.display_id().into());
    object.insert("datetime".into(), record.datetime_str().into());
    object.insert("timestamp".into(), record.timestamp.into());

    for i in 0..DEPTH_LEVELS {
        if i < UPSTREAM_LEVELS {
            object.insert(ASK_PRICE_KEYS[i].into(), float(record.ask_price[i]));
            object.insert(ASK_VOLUME_KEYS[i].into(), record.ask_volume[i].into());
            object.insert(BID_PRICE_KEYS[i].into(), float(record.bid_price[i]));
            object.insert(BID_VOLUME_KEYS[i].into(), record.bid_volume[i].into());
        } else {
            object.insert(ASK_PRICE_KEYS[i].into(), Value::Null);
            object.insert(ASK_VOLUME_KEYS[i].into(), Value::Null);
            object.insert(BID_PRICE_KEYS[i].into(), Value::Null);
            object.insert(BID_VOLUME_KEYS[i].into(), Value::Null);
        }
    }

    object.insert("last_price".into(), float(record.last_price));
    object.insert("highest".into(), float(record.highest));
    object.insert("lowest".into(), float(record.lowest));
    object.insert("open".into(), float(record.open));
    object.insert("close".into(), float(record.close));
    object.insert("average".into(), Value::Null);
    object.insert("volume".into(), record.volume.into());
    object.insert("amount".into(), float(record.amount));
    object.insert("open_interest".into(), record.open_interest.into());
    object.insert("settlement".into(), float(record.settlement));
    object.insert("upper_limit".into(), float(record.upper_limit));
    object.insert("lower_limit".into(), float(record.lower_limit));
    object.insert("pre_open_interest".into(), record.pre_open_interest.into());
    object.insert("pre_settlement".into(), float(record.pre_settlement));
    object.insert("pre_close".into(), float(record.pre_close));
    Value::Object(object)
}

/// Field-level diff: keys only for values that changed between the client's
/// last-sent record and the current one. Empty map means nothing to send.
pub fn quote_diff(old: &QuoteRecord, new: &QuoteRecord) -> Map<String, Value> {
    let mut diff = Map::new();

    if old.instrument_id != new.instrument_id {
        diff.insert("instrument_id".into(), new.display_id().into());
    }
    if old.datetime != new.datetime {
        diff.insert("datetime".into(), new.datetime_str().into());
    }
    if old.timestamp != new.timestamp {
        diff.insert("timestamp".into(), new.timestamp.into());
    }

    for i in 0..DEPTH_LEVELS {
        if old.ask_price[i] != new.ask_price[i] {
            diff.insert(ASK_PRICE_KEYS[i].into(), float(new.ask_price[i]));
        }
        if old.ask_volume[i] != new.ask_volume[i] {
            diff.insert(ASK_VOLUME_KEYS[i].into(), new.ask_volume[i].into());
        }
        if old.bid_price[i] != new.bid_price[i] {
            diff.insert(BID_PRICE_KEYS[i].into(), float(new.bid_price[i]));
        }
        if old.bid_volume[i] != new.bid_volume[i] {
            diff.insert(BID_VOLUME_KEYS[i].into(), new.bid_volume[i].into());
        }
    }

    macro_rules! scalar {
        ($field:ident, float) => {
            if old.$field != new.$field {
                diff.insert(stringify!($field).into(), float(new.$field));
            }
        };
        ($field:ident, int) => {
            if old.$field != new.$field {
                diff.insert(stringify!($field).into(), new.$field.into());
            }
        };
    }

    scalar!(last_price, float);
    scalar!(highest, float);
    scalar!(lowest, float);
    scalar!(open, float);
    scalar!(close, float);
    scalar!(settlement, float);
    scalar!(upper_limit, float);
    scalar!(lower_limit, float);
    scalar!(pre_settlement, float);
    scalar!(pre_close, float);
    scalar!(volume, int);
    scalar!(amount, float);
    scalar!(open_interest, int);
    scalar!(pre_open_interest, int);

    diff
}
