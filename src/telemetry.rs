//! Ring telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::Gauge;
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct RingInstruments {
    member_ownership: Gauge<f64>,
    members: Gauge<u64>,
    tokens_total: Gauge<u64>,
    tokens_owned: Gauge<u64>,
    oldest_member_timestamp: Gauge<i64>,
}

fn instruments() -> &'static RingInstruments {
    static INSTRUMENTS: OnceLock<RingInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("ringleader.ring");
        RingInstruments {
            member_ownership: meter
                .f64_gauge("ring.member.ownership.percent")
                .with_description("Fraction of the token space owned by the member")
                .init(),
            members: meter
                .u64_gauge("ring.members")
                .with_description("Number of ring members by state and zone")
                .init(),
            tokens_total: meter
                .u64_gauge("ring.tokens.total")
                .with_description("Total number of tokens in the ring")
                .init(),
            tokens_owned: meter
                .u64_gauge("ring.tokens.owned")
                .with_description("Number of tokens owned by the member")
                .init(),
            oldest_member_timestamp: meter
                .i64_gauge("ring.oldest_member.timestamp")
                .with_description("Heartbeat timestamp of the oldest member by state")
                .init(),
        }
    })
}

pub(crate) fn record_members(ring_name: &str, state: &str, zone: &str, count: u64) {
    instruments().members.record(
        count,
        &[
            KeyValue::new("name", ring_name.to_string()),
            KeyValue::new("state", state.to_string()),
            KeyValue::new("zone", zone.to_string()),
        ],
    );
}

pub(crate) fn record_oldest_member_timestamp(ring_name: &str, state: &str, timestamp: i64) {
    instruments().oldest_member_timestamp.record(
        timestamp,
        &[
            KeyValue::new("name", ring_name.to_string()),
            KeyValue::new("state", state.to_string()),
        ],
    );
}

pub(crate) fn record_member_ownership(ring_name: &str, member: &str, fraction: f64) {
    instruments().member_ownership.record(
        fraction,
        &[
            KeyValue::new("name", ring_name.to_string()),
            KeyValue::new("member", member.to_string()),
        ],
    );
}

pub(crate) fn record_tokens_owned(ring_name: &str, member: &str, count: u64) {
    instruments().tokens_owned.record(
        count,
        &[
            KeyValue::new("name", ring_name.to_string()),
            KeyValue::new("member", member.to_string()),
        ],
    );
}

pub(crate) fn record_tokens_total(ring_name: &str, count: u64) {
    instruments().tokens_total.record(
        count,
        &[KeyValue::new("name", ring_name.to_string())],
    );
}
