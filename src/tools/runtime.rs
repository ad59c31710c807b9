//! Helpers to drive futures from synchronous code.

use std::future::Future;

use lazy_static::lazy_static;
use tokio::runtime::{self, Runtime};

lazy_static! {
    static ref RUNTIME: Runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to spawn tokio runtime");
}

/// Get or create the process wide tokio runtime.
pub fn get_runtime() -> &'static Runtime {
    &RUNTIME
}

/// Block the current thread on a future.
///
/// Callers are plain (non runtime) threads - the store API is
/// synchronous and async I/O backends hop onto the shared runtime
/// through here.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    get_runtime().block_on(fut)
}
