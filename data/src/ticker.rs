//! Normalised top-of-book tick model.
//!
//! Aggregator payloads are loose JSON: every numeric field may arrive either
//! as a number or as a string ("50000.1"), and timestamps are epoch
//! milliseconds in either encoding. The [`lenient`] serde helpers absorb
//! both.

use arara_markets::ExchangeId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// One top-of-book update for a symbol on a venue.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: SmolStr,
    pub exchange: ExchangeId,
    #[serde(with = "lenient")]
    pub best_ask: Decimal,
    #[serde(with = "lenient")]
    pub best_bid: Decimal,
    #[serde(with = "lenient")]
    pub best_ask_qnt: Decimal,
    #[serde(with = "lenient")]
    pub best_bid_qnt: Decimal,
    #[serde(with = "lenient")]
    pub price: Decimal,
    #[serde(with = "lenient_time")]
    pub time: DateTime<Utc>,
    #[serde(default, with = "lenient_time_opt")]
    pub event_time: Option<DateTime<Utc>>,
}

impl Ticker {
    /// Timestamp used for ordering and freshness: the venue event time when
    /// present, the aggregator time otherwise.
    pub fn tick_time(&self) -> DateTime<Utc> {
        self.event_time.unwrap_or(self.time)
    }

    /// Content signature used to drop repeated quotes (§ dedup filter).
    /// Timestamps are deliberately excluded.
    pub fn signature(&self) -> TickSignature {
        TickSignature {
            best_ask: self.best_ask,
            best_bid: self.best_bid,
            best_ask_qnt: self.best_ask_qnt,
            best_bid_qnt: self.best_bid_qnt,
            price: self.price,
        }
    }
}

/// Quote-content signature of a [`Ticker`]. Two ticks with equal signatures
/// carry no new information for matching.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TickSignature {
    pub best_ask: Decimal,
    pub best_bid: Decimal,
    pub best_ask_qnt: Decimal,
    pub best_bid_qnt: Decimal,
    pub price: Decimal,
}

/// Serde helpers for `Decimal` fields that arrive as numbers or strings.
pub mod lenient {
    use rust_decimal::Decimal;
    use serde::{de, Deserializer, Serializer};
    use std::fmt;
    use std::str::FromStr;

    struct DecimalVisitor;

    impl de::Visitor<'_> for DecimalVisitor {
        type Value = Decimal;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a decimal number or numeric string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Decimal, E> {
            Decimal::from_str(v.trim()).map_err(E::custom)
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Decimal, E> {
            Decimal::try_from(v).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Decimal, E> {
            Ok(Decimal::from(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Decimal, E> {
            Ok(Decimal::from(v))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        deserializer.deserialize_any(DecimalVisitor)
    }

    pub fn serialize<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }
}

/// Serde helpers for epoch-millisecond timestamps in either encoding.
pub mod lenient_time {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserializer, Serializer};
    use std::fmt;

    struct MillisVisitor;

    impl de::Visitor<'_> for MillisVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("epoch milliseconds as integer or string")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            DateTime::from_timestamp_millis(v)
                .ok_or_else(|| E::custom(format!("timestamp out of range: {v}")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            let millis = i64::try_from(v).map_err(E::custom)?;
            self.visit_i64(millis)
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            self.visit_i64(v as i64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let millis = v.trim().parse::<i64>().map_err(E::custom)?;
            self.visit_i64(millis)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        deserializer.deserialize_any(MillisVisitor)
    }

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.timestamp_millis())
    }
}

/// Serde helpers for optional epoch-millisecond timestamps.
pub mod lenient_time_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Wrapper(#[serde(with = "super::lenient_time")] DateTime<Utc>);

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<Wrapper>::deserialize(deserializer)
            .map(|wrapped| wrapped.map(|Wrapper(time)| time))
    }

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_some(&time.timestamp_millis()),
            None => serializer.serialize_none(),
        }
    }
}
