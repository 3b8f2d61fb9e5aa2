//! Minimal connection gauge and dial-failure counter via the `metrics`
//! crate facade. Purely observability plumbing: the health/admin
//! surfaces read Connection Manager state directly and never scrape
//! these.

use crate::instance_id::InstanceId;

pub fn record_connection_opened() {
    metrics::increment_gauge!("proxy_open_connections", 1.0);
}

pub fn record_connection_closed() {
    metrics::decrement_gauge!("proxy_open_connections", 1.0);
}

pub fn record_dial_failure(instance: &InstanceId) {
    metrics::increment_counter!("proxy_dial_failures_total", "instance" => instance.to_string());
}
