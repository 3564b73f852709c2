//! Fixed-size pool of named OS threads for the DICOM listener.
//!
//! Job dispatch after The Book's thread pool chapter.
//! <https://doc.rust-lang.org/book/ch20-02-multithreaded.html>
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    handles: Vec<thread::JoinHandle<()>>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    /// Create a pool of `size` workers named `{name}/{index}`.
    pub fn new(size: usize, name: &'static str) -> ThreadPool {
        assert!(size > 0, "thread pool cannot have 0 threads");
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..size)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("{name}/{index}"))
                    .spawn(move || {
                        while let Ok(job) = {
                            let guard = receiver.lock().unwrap();
                            guard.recv()
                        } {
                            job();
                        }
                        tracing::debug!("worker {name}/{index} exiting");
                    })
                    .expect("spawning a listener worker thread")
            })
            .collect();
        ThreadPool {
            handles,
            sender: Some(sender),
        }
    }

    /// Run a job on this thread pool.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .as_ref()
            .expect("thread pool has been shut down")
            .send(Box::new(f))
            .unwrap();
    }

    /// Drain queued jobs and join the workers.
    ///
    /// Cleanup is a method rather than Drop so CTRL-C can abort threads
    /// immediately instead of waiting for them to finish.
    pub fn shutdown(&mut self) {
        drop(self.sender.take());
        for handle in self.handles.drain(..) {
            handle.join().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_all_jobs_before_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(4, "test_pool");
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }
}
