pub const HEARTBEAT_ERRORS: &str = "dcron_heartbeat_errors_total";
pub const MEMBERSHIP_REFRESH_ERRORS: &str = "dcron_membership_refresh_errors_total";
pub const RING_REBUILDS: &str = "dcron_ring_rebuilds_total";
// Size of the last membership snapshot that triggered a rebuild
pub const NODES: &str = "dcron_nodes";
