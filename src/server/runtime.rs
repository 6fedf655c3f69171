use std::fs;

/// Size the tokio worker pool for the container the node actually runs in.
///
/// Detection order:
/// 1. `EDGE_WORKER_THREADS` env var (explicit thread count)
/// 2. cgroup v2: `/sys/fs/cgroup/cpu.max`
/// 3. cgroup v1: `/sys/fs/cgroup/cpu/cpu.cfs_quota_us` + `cpu.cfs_period_us`
/// 4. Fallback: host parallelism
///
/// Without the cgroup checks, tokio sizes to the host CPU count — a node
/// limited to a few cores on a large machine would spawn a thread per host
/// core. Runs before tracing is initialized, hence `eprintln!`.
pub fn worker_threads() -> usize {
    if let Ok(raw) = std::env::var("EDGE_WORKER_THREADS") {
        if let Some(threads) = parse_thread_count(&raw) {
            eprintln!("[runtime] worker threads from EDGE_WORKER_THREADS: {}", threads);
            return threads;
        }
    }

    if let Ok(max) = fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2_cpu(&max) {
            let threads = cores.max(1);
            eprintln!("[runtime] worker threads from cgroup v2 cpu limit: {}", threads);
            return threads;
        }
    }

    if let (Ok(quota), Ok(period)) = (
        fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_cgroup_v1_cpu(&quota, &period) {
            let threads = cores.max(1);
            eprintln!("[runtime] worker threads from cgroup v1 cpu limit: {}", threads);
            return threads;
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] worker threads from host parallelism: {}", threads);
    threads
}

fn parse_thread_count(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().map(|n| n.max(1))
}

/// cgroup v2 `cpu.max` — "quota period", or "max period" for unlimited.
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" || period <= 0 {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    if quota <= 0 {
        return None;
    }
    Some((quota / period) as usize)
}

/// cgroup v1 cfs quota/period — quota -1 means unlimited.
fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some((quota / period) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_thread_count() {
        assert_eq!(parse_thread_count("4"), Some(4));
        assert_eq!(parse_thread_count("  8  "), Some(8));
        assert_eq!(parse_thread_count("0"), Some(1)); // clamped
        assert_eq!(parse_thread_count("many"), None);
    }

    #[test]
    fn test_parse_cgroup_v2_cpu() {
        assert_eq!(parse_cgroup_v2_cpu("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_v2_cpu("200000 100000"), Some(2));
        // half a core rounds down; worker_threads clamps to 1
        assert_eq!(parse_cgroup_v2_cpu("50000 100000"), Some(0));
        assert_eq!(parse_cgroup_v2_cpu("max 100000"), None);
        assert_eq!(parse_cgroup_v2_cpu(""), None);
        assert_eq!(parse_cgroup_v2_cpu("garbage"), None);
    }

    #[test]
    fn test_parse_cgroup_v1_cpu() {
        assert_eq!(parse_cgroup_v1_cpu("400000", "100000"), Some(4));
        assert_eq!(parse_cgroup_v1_cpu("-1", "100000"), None); // unlimited
        assert_eq!(parse_cgroup_v1_cpu("100000", "0"), None);
        assert_eq!(parse_cgroup_v1_cpu("abc", "100000"), None);
    }
}
