use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::debug;

use tracery_cache::{CacheError, LiftedModule, Lifter};
use tracery_decode::DecodedTrace;

struct LiftJob {
    traces: Vec<DecodedTrace>,
    result: Sender<tracery_cache::Result<LiftedModule>>,
}

/// Bounded pool of worker threads running [`Lifter::lift`] off the dispatch
/// thread. Jobs from independent tasks compile in parallel; each submitter
/// awaits only its own module.
pub struct LifterPool {
    jobs: Option<Sender<LiftJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl LifterPool {
    pub fn new(lifter: Arc<dyn Lifter>, worker_count: usize) -> Self {
        let (jobs, queue) = mpsc::channel::<LiftJob>();
        let queue = Arc::new(Mutex::new(queue));

        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let lifter = lifter.clone();
            let queue = queue.clone();
            let builder = thread::Builder::new().name(format!("lifter-{i}"));
            match builder.spawn(move || loop {
                let job = {
                    let queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                    queue.recv()
                };
                let Ok(job) = job else {
                    break;
                };
                let module = lifter.lift(&job.traces);
                let _ = job.result.send(module);
            }) {
                Ok(handle) => workers.push(handle),
                Err(err) => debug!("failed to spawn lifter worker {i}: {err}"),
            }
        }

        Self {
            jobs: Some(jobs),
            workers,
        }
    }

    /// Queue a batch of traces for lifting into one module.
    pub fn submit(&self, traces: Vec<DecodedTrace>) -> PendingModule {
        let (tx, rx) = mpsc::channel();
        if let Some(jobs) = &self.jobs {
            let _ = jobs.send(LiftJob { traces, result: tx });
        }
        PendingModule { rx }
    }
}

impl Drop for LifterPool {
    fn drop(&mut self) {
        self.jobs = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// A module whose lift is in flight on the pool.
pub struct PendingModule {
    rx: Receiver<tracery_cache::Result<LiftedModule>>,
}

impl PendingModule {
    /// Await the lifted module.
    pub fn wait(self) -> tracery_cache::Result<LiftedModule> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(CacheError::Lift("lifter worker pool shut down".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tracery_mem::{CodeVersion, Pc};

    struct CountingLifter {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Lifter for CountingLifter {
        fn lift(&self, traces: &[DecodedTrace]) -> tracery_cache::Result<LiftedModule> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(LiftedModule {
                functions: traces
                    .iter()
                    .map(|t| tracery_cache::LiftedTraceFunction {
                        id: t.id,
                        func: std::sync::Arc::new(
                            |_state: &mut tracery_cache::ArchState,
                             pc: Pc,
                             memory: tracery_mem::AddressSpaceHandle| {
                                tracery_cache::TraceExit {
                                    next_pc: pc,
                                    memory,
                                    kind: tracery_cache::TraceExitKind::Exited,
                                }
                            },
                        ),
                    })
                    .collect(),
            })
        }
    }

    fn trace(pc: u64) -> DecodedTrace {
        DecodedTrace {
            entry_pc: Pc::new(pc),
            code_version: CodeVersion::ZERO,
            id: tracery_decode::TraceId {
                entry_pc: Pc::new(pc),
                hash: pc,
            },
            instructions: BTreeMap::new(),
        }
    }

    #[test]
    fn lifts_batches_on_workers() {
        let lifter = Arc::new(CountingLifter {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let pool = LifterPool::new(lifter.clone(), 2);

        let first = pool.submit(vec![trace(0x1000), trace(0x2000)]);
        let second = pool.submit(vec![trace(0x3000)]);

        assert_eq!(first.wait().unwrap().functions.len(), 2);
        assert_eq!(second.wait().unwrap().functions.len(), 1);
        assert_eq!(lifter.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
