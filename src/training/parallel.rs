//! Parallel-execution collaborators
//!
//! The trainer never spawns workers itself. It is handed an [`Accelerator`]
//! describing the worker it runs on and uses it for the few collective
//! points of the loop: barriers and success flags around checkpoint writes
//! and restores, and the loss gather used by the logging hooks.

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

/// Handle to the worker group the current flow of control belongs to
pub trait Accelerator: Send + Sync {
    /// Rank of this worker
    fn process_index(&self) -> usize;

    /// Number of cooperating workers
    fn num_processes(&self) -> usize;

    /// Whether this worker performs I/O side effects
    fn is_main_process(&self) -> bool {
        self.process_index() == 0
    }

    /// Block until every worker reaches this point
    fn wait_for_everyone(&self);

    /// Collect one scalar per worker, ordered by rank. Blocking collective.
    fn gather(&self, value: f64) -> Vec<f64>;

    /// Mean of `value` over all workers
    fn reduce_mean(&self, value: f64) -> f64 {
        let values = self.gather(value);
        if values.is_empty() {
            return value;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Share a success flag with every worker; returns the rank of the
    /// first worker that reported failure
    fn first_failure(&self, ok: bool) -> Option<usize> {
        self.gather(if ok { 1.0 } else { 0.0 })
            .iter()
            .position(|flag| *flag == 0.0)
    }
}

/// The trivial group of one worker
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Accelerator for SingleProcess {
    fn process_index(&self) -> usize {
        0
    }

    fn num_processes(&self) -> usize {
        1
    }

    fn wait_for_everyone(&self) {}

    fn gather(&self, value: f64) -> Vec<f64> {
        vec![value]
    }
}

struct GroupShared {
    barrier: Barrier,
    slots: Mutex<Vec<f64>>,
}

/// In-process worker group where each worker is a thread.
///
/// All handles of a group must take part in every collective call, in the
/// same order, exactly like separate processes would.
#[derive(Clone)]
pub struct LocalProcessGroup {
    shared: Arc<GroupShared>,
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Create one handle per worker
    pub fn new(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let shared = Arc::new(GroupShared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![0.0; world_size]),
        });

        (0..world_size)
            .map(|rank| Self {
                shared: Arc::clone(&shared),
                rank,
                world_size,
            })
            .collect()
    }
}

impl Accelerator for LocalProcessGroup {
    fn process_index(&self) -> usize {
        self.rank
    }

    fn num_processes(&self) -> usize {
        self.world_size
    }

    fn wait_for_everyone(&self) {
        self.shared.barrier.wait();
    }

    fn gather(&self, value: f64) -> Vec<f64> {
        self.shared.slots.lock()[self.rank] = value;
        self.shared.barrier.wait();
        let values = self.shared.slots.lock().clone();
        // slots may be overwritten by the next gather only after everyone has read
        self.shared.barrier.wait();
        values
    }
}

impl std::fmt::Debug for LocalProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_process() {
        let acc = SingleProcess;
        assert!(acc.is_main_process());
        assert_eq!(acc.num_processes(), 1);
        assert_eq!(acc.gather(2.5), vec![2.5]);
        assert_eq!(acc.reduce_mean(2.5), 2.5);
    }

    #[test]
    fn test_local_group_gather() {
        let handles: Vec<_> = LocalProcessGroup::new(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let first = group.gather(group.process_index() as f64);
                    let second = group.reduce_mean(10.0 * group.process_index() as f64);
                    (group.is_main_process(), first, second)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(main, _, _)| *main).count(), 1);
        for (_, first, second) in results {
            assert_eq!(first, vec![0.0, 1.0, 2.0]);
            assert_eq!(second, 10.0);
        }
    }

    #[test]
    fn test_first_failure_seen_by_all_workers() {
        assert_eq!(SingleProcess.first_failure(true), None);
        assert_eq!(SingleProcess.first_failure(false), Some(0));

        let handles: Vec<_> = LocalProcessGroup::new(3)
            .into_iter()
            .map(|group| thread::spawn(move || group.first_failure(group.process_index() != 1)))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(1));
        }
    }
}
