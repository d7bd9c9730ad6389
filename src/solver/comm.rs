//! Communication backend abstraction for the distributed operator.
//!
//! Every collective in the crate (global norms, matrix combination, halo
//! import/export) goes through [`CommunicationBackend`]. A single-process
//! no-op implementation lives here; the threaded one is in
//! [`super::comm_threaded`].

use crate::error::{MfdError, Result};

/// Neighbor data for halo exchange: rank and the local indices to send/receive.
#[derive(Debug, Clone)]
pub struct HaloNeighbor {
    pub rank: usize,
    pub send_indices: Vec<usize>,
    pub recv_start: usize,
    pub recv_count: usize,
}

/// Abstraction over inter-rank communication.
///
/// All calls are collective: every rank must make the same sequence of
/// calls, with symmetric neighbor lists in `halo_exchange`.
pub trait CommunicationBackend: Send + Sync {
    /// Sum a local scalar across all ranks.
    fn all_reduce_sum(&self, local: f64) -> f64;

    /// Max of a local scalar across all ranks.
    fn all_reduce_max(&self, local: f64) -> f64;

    /// Exchange values with neighbor ranks.
    ///
    /// For each neighbor, `local_data[send_indices]` is sent and whatever the
    /// neighbor sends back is written to
    /// `recv_halo[recv_start..recv_start + recv_count]`.
    fn halo_exchange(
        &self,
        neighbors: &[HaloNeighbor],
        local_data: &[f64],
        recv_halo: &mut [f64],
    );

    /// This process's rank (subdomain index).
    fn rank(&self) -> usize;

    /// Total number of ranks (subdomains).
    fn num_ranks(&self) -> usize;

    /// Element-wise sum of a vector across all ranks, in place.
    fn all_reduce_sum_vec(&self, local: &mut [f64]);

    /// Synchronization barrier.
    fn barrier(&self);
}

/// No-op communication backend for single-rank execution.
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        local
    }

    fn all_reduce_max(&self, local: f64) -> f64 {
        local
    }

    fn halo_exchange(
        &self,
        _neighbors: &[HaloNeighbor],
        _local_data: &[f64],
        _recv_halo: &mut [f64],
    ) {
        // Single process: no neighbors, nothing to exchange.
    }

    fn all_reduce_sum_vec(&self, _local: &mut [f64]) {}

    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn barrier(&self) {}
}

/// Global 2-norm of the owned parts of a distributed vector.
pub fn global_norm(comm: &dyn CommunicationBackend, owned: &[f64]) -> f64 {
    comm.all_reduce_sum(owned.iter().map(|v| v * v).sum::<f64>())
        .sqrt()
}

/// Global max-norm of the owned parts of a distributed vector.
pub fn global_max_abs(comm: &dyn CommunicationBackend, owned: &[f64]) -> f64 {
    comm.all_reduce_max(owned.iter().fold(0.0, |m: f64, v| m.max(v.abs())))
}

/// Make a local outcome collective: if any rank failed, every rank returns
/// an error. Ranks that did not fail report a consistency error naming
/// `what`, so no rank goes on to a collective the others skip.
pub fn collective<T>(comm: &dyn CommunicationBackend, local: Result<T>, what: &str) -> Result<T> {
    let failed = comm.all_reduce_max(if local.is_err() { 1.0 } else { 0.0 });
    match local {
        Err(e) => Err(e),
        Ok(_) if failed > 0.0 => Err(MfdError::Consistency(format!(
            "{what} failed on another rank"
        ))),
        Ok(v) => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_reductions_pass_through() {
        let comm = SingleProcessComm;
        assert_eq!(comm.all_reduce_sum(42.0), 42.0);
        assert_eq!(comm.all_reduce_max(-1.5), -1.5);
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.num_ranks(), 1);
    }

    #[test]
    fn single_process_halo_exchange_is_noop() {
        let comm = SingleProcessComm;
        let send = vec![1.0, 2.0, 3.0];
        let mut recv = vec![0.0; 0];
        comm.halo_exchange(&[], &send, &mut recv);
        assert!(recv.is_empty());
    }

    #[test]
    fn global_norms_of_local_vector() {
        let comm = SingleProcessComm;
        assert_eq!(global_norm(&comm, &[3.0, 4.0]), 5.0);
        assert_eq!(global_max_abs(&comm, &[1.0, -7.0, 2.0]), 7.0);
        assert_eq!(global_max_abs(&comm, &[]), 0.0);
    }

    #[test]
    fn collective_passes_local_outcome_through() {
        let comm = SingleProcessComm;
        assert_eq!(collective(&comm, Ok(3), "step").unwrap(), 3);
        let err = collective::<()>(&comm, Err(MfdError::Solve("x".into())), "step");
        assert!(matches!(err, Err(MfdError::Solve(_))));
    }
}
