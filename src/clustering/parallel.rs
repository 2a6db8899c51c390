use crossbeam::channel;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{ClusteringError, JobFailure, Result};

/// Runs batches of independent jobs on a fixed number of workers and returns the results in
/// submission order.
///
/// Each worker sends `(job_index, outcome)` back over a channel and the coordinator slots the
/// outcomes by index, so the output never depends on completion order. With one worker the
/// jobs run in order on the calling thread and no pool is created.
pub struct ParallelEvaluator {
    n_processes: usize,
    pool: Option<ThreadPool>,
}

impl std::fmt::Debug for ParallelEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelEvaluator")
            .field("n_processes", &self.n_processes)
            .finish()
    }
}

impl ParallelEvaluator {
    pub fn new(n_processes: usize) -> Result<Self> {
        if n_processes == 0 {
            return Err(ClusteringError::invalid("n_processes", "must be at least 1"));
        }
        let pool = if n_processes > 1 {
            Some(
                ThreadPoolBuilder::new()
                    .num_threads(n_processes)
                    .thread_name(|i| format!("gap-worker-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(ParallelEvaluator { n_processes, pool })
    }

    pub fn n_processes(&self) -> usize {
        self.n_processes
    }

    /// Apply `worker` to every job. `output[i]` is the result of `jobs[i]`.
    ///
    /// If any job fails, every failure is collected into a single
    /// [`ClusteringError::Worker`] and no results are returned.
    pub fn run<J, R, F>(&self, jobs: Vec<J>, worker: F) -> Result<Vec<R>>
    where
        J: Send,
        R: Send,
        F: Fn(J) -> anyhow::Result<R> + Sync,
    {
        let total = jobs.len();
        let mut slots: Vec<Option<anyhow::Result<R>>> = (0..total).map(|_| None).collect();

        match &self.pool {
            None => {
                for (slot, job) in slots.iter_mut().zip(jobs) {
                    *slot = Some(worker(job));
                }
            }
            Some(pool) => {
                let (sender, receiver) = channel::unbounded();
                let worker = &worker;
                pool.scope(|scope| {
                    for (index, job) in jobs.into_iter().enumerate() {
                        let sender = sender.clone();
                        scope.spawn(move |_| {
                            // The receiver outlives the scope, so sending cannot fail
                            let _ = sender.send((index, worker(job)));
                        });
                    }
                });
                drop(sender);
                for (index, outcome) in receiver.iter() {
                    slots[index] = Some(outcome);
                }
            }
        }

        collect_ordered(slots)
    }
}

fn collect_ordered<R>(slots: Vec<Option<anyhow::Result<R>>>) -> Result<Vec<R>> {
    let total = slots.len();
    let mut results = Vec::with_capacity(total);
    let mut failures = Vec::new();

    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(Ok(value)) => results.push(value),
            Some(Err(e)) => failures.push(JobFailure {
                index,
                message: format!("{e:#}"),
            }),
            None => failures.push(JobFailure {
                index,
                message: "worker returned no result".to_string(),
            }),
        }
    }

    if failures.is_empty() {
        Ok(results)
    } else {
        Err(ClusteringError::Worker { total, failures })
    }
}
