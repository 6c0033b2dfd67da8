pub const JOB_EXECUTED: &str = "dcron_job_executed_total";
// Labelled with `reason`: upgrading, no_ring, not_owner, error
pub const JOB_SKIPPED: &str = "dcron_job_skipped_total";
pub const JOB_REPLAYED: &str = "dcron_job_replayed_total";
pub const JOB_PANICKED: &str = "dcron_job_panicked_total";
