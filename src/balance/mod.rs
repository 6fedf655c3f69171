use crate::error::EdgeError;
use crate::model::{Algorithm, AlgorithmState, BackendRecord};
use rand::Rng;

/// Pick a backend from `backends` under `algorithm`, threading the
/// per-pool cursor through `state`.
///
/// The function is total and side-effect-free: the unhealthy subset is
/// filtered out first (insertion order preserved), an empty healthy set
/// yields `NoBackends`, and all per-algorithm memory lives in the returned
/// state. Counter mutation is the caller's job — the pool actor increments
/// the chosen backend after this returns.
pub fn select(
    backends: &[BackendRecord],
    algorithm: Algorithm,
    state: &AlgorithmState,
) -> Result<(String, AlgorithmState), EdgeError> {
    let healthy: Vec<&BackendRecord> = backends.iter().filter(|b| b.healthy).collect();
    if healthy.is_empty() {
        return Err(EdgeError::NoBackends);
    }

    match algorithm {
        Algorithm::RoundRobin => {
            let idx = (state.cursor % healthy.len() as u64) as usize;
            Ok((
                healthy[idx].id.clone(),
                AlgorithmState {
                    cursor: state.cursor.wrapping_add(1),
                },
            ))
        }
        Algorithm::LeastConnections => {
            // argmin over current_connections; ties broken by lowest id so
            // repeated calls against an unchanged set are deterministic.
            let chosen = healthy
                .iter()
                .min_by(|a, b| {
                    a.current_connections
                        .cmp(&b.current_connections)
                        .then_with(|| a.id.cmp(&b.id))
                })
                .unwrap();
            Ok((chosen.id.clone(), state.clone()))
        }
        Algorithm::WeightedRoundRobin => {
            // Round-robin over the weight-expanded healthy list, computed
            // with prefix sums instead of materializing the expansion.
            let mut prefix_sum = Vec::with_capacity(healthy.len());
            let mut total: u64 = 0;
            for b in &healthy {
                total += b.weight.max(1) as u64;
                prefix_sum.push(total);
            }
            let target = state.cursor % total;
            let idx = prefix_sum.partition_point(|&s| s <= target);
            Ok((
                healthy[idx].id.clone(),
                AlgorithmState {
                    cursor: state.cursor.wrapping_add(1),
                },
            ))
        }
        Algorithm::Random => {
            let idx = rand::thread_rng().gen_range(0..healthy.len());
            Ok((healthy[idx].id.clone(), state.clone()))
        }
    }
}
