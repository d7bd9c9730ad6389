//! In-process multi-rank communication over crossbeam channels.
//!
//! Each rank runs on its own thread and owns a [`ThreadComm`]. Every ordered
//! pair of ranks gets a dedicated unbounded channel, so sends never block and
//! messages between two ranks arrive in the order they were sent. Because all
//! operations are collective, that FIFO order is enough to match messages.

use super::comm::{CommunicationBackend, HaloNeighbor};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Barrier};

/// One rank's endpoint of a thread-backed communicator group.
pub struct ThreadComm {
    rank: usize,
    size: usize,
    /// `outgoing[q]` sends to rank q (`None` for self).
    outgoing: Vec<Option<Sender<Vec<f64>>>>,
    /// `incoming[q]` receives from rank q (`None` for self).
    incoming: Vec<Option<Receiver<Vec<f64>>>>,
    barrier: Arc<Barrier>,
}

impl ThreadComm {
    /// Create a connected group of `size` communicators, one per rank.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let barrier = Arc::new(Barrier::new(size.max(1)));
        let mut outgoing: Vec<Vec<Option<Sender<Vec<f64>>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        let mut incoming: Vec<Vec<Option<Receiver<Vec<f64>>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        for from in 0..size {
            for to in 0..size {
                if from != to {
                    let (tx, rx) = unbounded();
                    outgoing[from][to] = Some(tx);
                    incoming[to][from] = Some(rx);
                }
            }
        }
        outgoing
            .into_iter()
            .zip(incoming)
            .enumerate()
            .map(|(rank, (outgoing, incoming))| ThreadComm {
                rank,
                size,
                outgoing,
                incoming,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }

    fn send(&self, to: usize, data: Vec<f64>) {
        let Some(tx) = &self.outgoing[to] else {
            panic!("rank {} has no channel to itself", self.rank);
        };
        if tx.send(data).is_err() {
            panic!("rank {}: peer {} hung up", self.rank, to);
        }
    }

    fn recv(&self, from: usize) -> Vec<f64> {
        let Some(rx) = &self.incoming[from] else {
            panic!("rank {} has no channel to itself", self.rank);
        };
        match rx.recv() {
            Ok(data) => data,
            Err(_) => panic!("rank {}: peer {} hung up", self.rank, from),
        }
    }

    /// Gather one vector from every rank, indexed by rank.
    fn all_gather(&self, local: &[f64]) -> Vec<Vec<f64>> {
        for q in (0..self.size).filter(|&q| q != self.rank) {
            self.send(q, local.to_vec());
        }
        (0..self.size)
            .map(|q| {
                if q == self.rank {
                    local.to_vec()
                } else {
                    self.recv(q)
                }
            })
            .collect()
    }
}

impl CommunicationBackend for ThreadComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        // Summed in rank order so every rank sees the identical result.
        self.all_gather(&[local]).iter().map(|v| v[0]).sum()
    }

    fn all_reduce_max(&self, local: f64) -> f64 {
        self.all_gather(&[local])
            .iter()
            .fold(f64::NEG_INFINITY, |m, v| m.max(v[0]))
    }

    fn halo_exchange(
        &self,
        neighbors: &[HaloNeighbor],
        local_data: &[f64],
        recv_halo: &mut [f64],
    ) {
        for nbr in neighbors {
            let data = nbr.send_indices.iter().map(|&i| local_data[i]).collect();
            self.send(nbr.rank, data);
        }
        for nbr in neighbors {
            let data = self.recv(nbr.rank);
            assert_eq!(
                data.len(),
                nbr.recv_count,
                "rank {}: halo message from {} has the wrong length",
                self.rank,
                nbr.rank
            );
            recv_halo[nbr.recv_start..nbr.recv_start + nbr.recv_count].copy_from_slice(&data);
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.size
    }

    fn all_reduce_sum_vec(&self, local: &mut [f64]) {
        let gathered = self.all_gather(local);
        for (i, v) in local.iter_mut().enumerate() {
            *v = gathered.iter().map(|g| g[i]).sum();
        }
    }

    fn barrier(&self) {
        self.barrier.wait();
    }
}

/// Run `f` once per rank on `num_ranks` scoped threads and collect the
/// results in rank order. A panic on any rank is re-raised here.
pub fn run_ranks<T, F>(num_ranks: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&ThreadComm) -> T + Sync,
{
    let comms = ThreadComm::group(num_ranks);
    let f = &f;
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(move || f(&comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}
