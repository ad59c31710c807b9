//! A thread pool which runs a closure in parallel.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, Sender};

fn check_abort(abort: &Mutex<Option<String>>) -> Result<(), Error> {
    let guard = abort.lock().unwrap();
    if let Some(err_msg) = &*guard {
        return Err(format_err!("{}", err_msg));
    }
    Ok(())
}

/// A bounded pool of worker threads feeding a shared handler closure.
///
/// `send` hands data to the workers. Once a handler returns an error
/// the pool is marked as failed and further sends are rejected. When
/// done, `complete()` must be called to join the workers and surface
/// any outstanding error.
pub struct ParallelHandler<I> {
    handles: Vec<JoinHandle<()>>,
    name: String,
    input: Option<Sender<I>>,
    abort: Arc<Mutex<Option<String>>>,
}

impl<I: Send + 'static> ParallelHandler<I> {
    /// Spawn `threads` workers, each processing incoming data with
    /// `handler_fn`.
    pub fn new<F>(name: &str, threads: usize, handler_fn: F) -> Self
    where
        F: Fn(I) -> Result<(), Error> + Send + Clone + 'static,
    {
        let mut handles = Vec::new();
        let (input_tx, input_rx) = bounded::<I>(threads);

        let abort = Arc::new(Mutex::new(None));

        for i in 0..threads {
            let input_rx = input_rx.clone();
            let abort = Arc::clone(&abort);
            let handler_fn = handler_fn.clone();

            handles.push(
                std::thread::Builder::new()
                    .name(format!("{} ({})", name, i))
                    .spawn(move || loop {
                        let data = match input_rx.recv() {
                            Ok(data) => data,
                            Err(_) => return,
                        };
                        if let Err(err) = (handler_fn)(data) {
                            let mut guard = abort.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err.to_string());
                            }
                        }
                    })
                    .unwrap(),
            );
        }

        Self {
            handles,
            name: name.to_string(),
            input: Some(input_tx),
            abort,
        }
    }

    /// Send data to the worker threads.
    pub fn send(&self, input: I) -> Result<(), Error> {
        check_abort(&self.abort)?;
        let sender = self.input.as_ref().unwrap();
        if sender.send(input).is_err() {
            bail!("send failed - channel closed");
        }
        Ok(())
    }

    /// Wait for the worker threads to finish and check for errors.
    pub fn complete(mut self) -> Result<(), Error> {
        check_abort(&self.abort)?;
        drop(self.input.take());

        let msg_list = self.join_threads();

        // an error might be encountered while waiting for the join
        check_abort(&self.abort)?;

        if msg_list.is_empty() {
            return Ok(());
        }
        Err(format_err!("{}", msg_list.join("\n")))
    }

    fn join_threads(&mut self) -> Vec<String> {
        let mut msg_list = Vec::new();

        let mut i = 0;
        while let Some(handle) = self.handles.pop() {
            if let Err(panic) = handle.join() {
                match panic.downcast::<&str>() {
                    Ok(panic_msg) => msg_list.push(format!(
                        "thread {} ({}) panicked: {}",
                        self.name, i, panic_msg
                    )),
                    Err(_) => msg_list.push(format!("thread {} ({}) panicked", self.name, i)),
                }
            }
            i += 1;
        }
        msg_list
    }
}

// Note: makes sure that all threads will be joined
impl<I> Drop for ParallelHandler<I> {
    fn drop(&mut self) {
        drop(self.input.take());
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

#[test]
fn test_parallel_handler() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let counter = Arc::new(AtomicUsize::new(0));
    let counter2 = Arc::clone(&counter);

    let pool = ParallelHandler::new("test worker", 4, move |n: usize| {
        counter2.fetch_add(n, Ordering::SeqCst);
        Ok(())
    });

    for n in 1..=10 {
        pool.send(n).unwrap();
    }
    pool.complete().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 55);
}

#[test]
fn test_parallel_handler_error() {
    let pool = ParallelHandler::new("failing worker", 2, |_: usize| {
        bail!("no luck");
    });

    for n in 0..10 {
        // the pool may already be failed - send errors are fine here
        let _ = pool.send(n);
    }
    assert!(pool.complete().is_err());
}
