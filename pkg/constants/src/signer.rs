//! Signer profile names and defaults.

/// Organization of an etcd peer certificate request.
pub const ETCD_PEER_ORG: &str = "system:etcd-peers";

/// Organization of an etcd server certificate request.
pub const ETCD_SERVER_ORG: &str = "system:etcd-servers";

/// Organization of an etcd metrics certificate request.
pub const ETCD_METRIC_ORG: &str = "system:etcd-metrics";

/// Default certificate duration, in hours (365 days).
pub const DEFAULT_CERT_DURATION_HOURS: u64 = 8760;
