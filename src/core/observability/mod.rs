use std::sync::atomic::{AtomicU64, Ordering};

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    PROTOCOL_VIOLATION,
    TRANSPORT_IO,
    RESOLUTION,
    INTERNAL_ASSERT,
}

static ERROR_CLASS_COUNT: [AtomicU64; 4] = [const { AtomicU64::new(0) }; 4];

#[inline]
pub fn record_error(class: ErrorClass) {
    ERROR_CLASS_COUNT[class as usize].fetch_add(1, Ordering::Relaxed);
}

static TOTAL_CONNECTIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static TOTAL_CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
static DIRECT_ROUTES: AtomicU64 = AtomicU64::new(0);
static RELAY_ROUTES: AtomicU64 = AtomicU64::new(0);
static CAMOUFLAGE_SERVED: AtomicU64 = AtomicU64::new(0);
static DOH_ESCALATIONS: AtomicU64 = AtomicU64::new(0);

const BYTE_BUCKETS: usize = 21;
static BYTES_UPSTREAM_COARSE: [AtomicU64; BYTE_BUCKETS] = [const { AtomicU64::new(0) }; BYTE_BUCKETS];
static BYTES_DOWNSTREAM_COARSE: [AtomicU64; BYTE_BUCKETS] =
    [const { AtomicU64::new(0) }; BYTE_BUCKETS];

#[inline]
pub fn record_connection_opened() {
    TOTAL_CONNECTIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_connection_closed() {
    TOTAL_CONNECTIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_direct_route() {
    DIRECT_ROUTES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_relay_route() {
    RELAY_ROUTES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_camouflage_served() {
    CAMOUFLAGE_SERVED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_doh_escalation() {
    DOH_ESCALATIONS.fetch_add(1, Ordering::Relaxed);
}

/// Records one finished pump direction pair, bucketed by log2 of the byte count.
#[inline]
pub fn record_pumped_bytes(upstream: u64, downstream: u64) {
    BYTES_UPSTREAM_COARSE[coarse_bucket_index(upstream)].fetch_add(1, Ordering::Relaxed);
    BYTES_DOWNSTREAM_COARSE[coarse_bucket_index(downstream)].fetch_add(1, Ordering::Relaxed);
}

#[inline]
const fn coarse_bucket_index(byte_len: u64) -> usize {
    if byte_len == 0 {
        return 0;
    }
    let mut v = byte_len;
    let mut idx: usize = 0;
    while v > 1 && idx + 1 < BYTE_BUCKETS {
        v >>= 1;
        idx += 1;
    }
    idx
}

#[derive(Debug, Clone)]
pub struct ObservabilitySnapshot {
    pub total_connections_opened: u64,
    pub total_connections_closed: u64,
    pub direct_routes: u64,
    pub relay_routes: u64,
    pub camouflage_served: u64,
    pub doh_escalations: u64,
    pub bytes_upstream_coarse: [u64; BYTE_BUCKETS],
    pub bytes_downstream_coarse: [u64; BYTE_BUCKETS],
    pub error_class_total: [u64; 4],
}

impl ObservabilitySnapshot {
    pub fn active_connections(&self) -> u64 {
        self.total_connections_opened
            .saturating_sub(self.total_connections_closed)
    }
}

pub fn snapshot() -> ObservabilitySnapshot {
    ObservabilitySnapshot {
        total_connections_opened: TOTAL_CONNECTIONS_OPENED.load(Ordering::Relaxed),
        total_connections_closed: TOTAL_CONNECTIONS_CLOSED.load(Ordering::Relaxed),
        direct_routes: DIRECT_ROUTES.load(Ordering::Relaxed),
        relay_routes: RELAY_ROUTES.load(Ordering::Relaxed),
        camouflage_served: CAMOUFLAGE_SERVED.load(Ordering::Relaxed),
        doh_escalations: DOH_ESCALATIONS.load(Ordering::Relaxed),
        bytes_upstream_coarse: BYTES_UPSTREAM_COARSE.each_ref().map(|c| c.load(Ordering::Relaxed)),
        bytes_downstream_coarse: BYTES_DOWNSTREAM_COARSE
            .each_ref()
            .map(|c| c.load(Ordering::Relaxed)),
        error_class_total: ERROR_CLASS_COUNT.each_ref().map(|c| c.load(Ordering::Relaxed)),
    }
}
