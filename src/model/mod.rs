pub mod backend;
pub mod certificate;
pub mod pool;

pub use backend::BackendRecord;
pub use certificate::CertificateRecord;
pub use pool::{Algorithm, AlgorithmState, PoolRecord, PoolStats, SslMode};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix milliseconds. All record timestamps
/// (created_at, updated_at, last_check, expires_at) use this representation,
/// and last-write-wins replication compares these values directly.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
