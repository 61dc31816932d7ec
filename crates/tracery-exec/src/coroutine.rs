use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Per-task context for blocking guest work.
///
/// The original switches machine contexts onto a separate stack owned by the
/// task; here that stack belongs to a dedicated parked thread. Work handed to
/// [`Coroutine::run`] may block freely — the dispatch thread only ever polls
/// the returned [`Completion`] at trace boundaries.
pub struct Coroutine {
    jobs: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl Coroutine {
    pub fn new(name: &str) -> Self {
        let (jobs, queue) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name(format!("coroutine-{name}"))
            .spawn(move || {
                while let Ok(job) = queue.recv() {
                    job();
                }
            })
            .ok();
        if thread.is_none() {
            debug!("failed to spawn coroutine thread {name}");
        }
        Self {
            jobs: Some(jobs),
            thread,
        }
    }

    /// Hand `work` to the coroutine stack; the result is observable through
    /// the returned completion.
    pub fn run<F, R>(&self, work: F) -> Completion<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        if let Some(jobs) = &self.jobs {
            // A failed submission drops the result sender, so the completion
            // reports failure instead of pending forever.
            let _ = jobs.send(Box::new(move || {
                let _ = tx.send(work());
            }));
        }
        Completion { rx }
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain and exit.
        self.jobs = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Outcome of polling a [`Completion`].
#[derive(Debug, PartialEq, Eq)]
pub enum Poll<R> {
    Pending,
    Ready(R),
    /// The coroutine died before producing a result.
    Failed,
}

/// Handle to work in flight on a coroutine.
pub struct Completion<R> {
    rx: Receiver<R>,
}

impl<R> Completion<R> {
    /// Non-blocking check; safe to call from the dispatch thread.
    pub fn poll(&self) -> Poll<R> {
        match self.rx.try_recv() {
            Ok(value) => Poll::Ready(value),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => Poll::Failed,
        }
    }

    /// Block until the work finishes. Only for callers that are themselves
    /// off the dispatch thread.
    pub fn wait(self) -> Option<R> {
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn completes_off_thread() {
        let coroutine = Coroutine::new("test");
        let completion = coroutine.run(|| 21 * 2);
        assert_eq!(completion.wait(), Some(42));
    }

    #[test]
    fn poll_sees_pending_then_ready() {
        let coroutine = Coroutine::new("test");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let completion = coroutine.run(move || {
            let _ = gate_rx.recv();
            7
        });

        assert_eq!(completion.poll(), Poll::Pending);
        gate_tx.send(()).unwrap();

        let mut spins = 0;
        loop {
            match completion.poll() {
                Poll::Ready(v) => {
                    assert_eq!(v, 7);
                    break;
                }
                Poll::Pending => {
                    spins += 1;
                    assert!(spins < 1000, "work never completed");
                    thread::sleep(Duration::from_millis(1));
                }
                Poll::Failed => panic!("coroutine died"),
            }
        }
    }

    #[test]
    fn jobs_on_one_coroutine_run_in_order() {
        let coroutine = Coroutine::new("test");
        let first = coroutine.run(|| {
            thread::sleep(Duration::from_millis(5));
            1
        });
        let second = coroutine.run(|| 2);
        assert_eq!(second.wait(), Some(2));
        assert_eq!(first.wait(), Some(1));
    }
}
