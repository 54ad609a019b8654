//! Abstraction over the time/wait primitives the OS or test harness
//! supplies (§6 "downward API"). `malloc`/`free` and mutexes from the
//! original downward API have no counterpart here: allocation goes
//! through `alloc` and the only lock the core needs is `spin::Mutex`
//! around the ingress queue (§5), so this trait only covers the clock
//! and the worker's suspend/resume signal.

/// Time source and worker-suspension primitive a host provides to the core.
pub trait OsGlue {
    /// Monotonic seconds, used for ND aging and TCP retransmission deadlines.
    fn now_secs(&self) -> u64;
    /// Monotonic nanoseconds, used for the worker's bounded wait.
    fn now_nanos(&self) -> u64;
    /// Blocks the worker until `signal` is called or `timeout_ns` elapses.
    fn wait(&self, timeout_ns: u64);
    /// Wakes a thread blocked in `wait`; called by the driver after enqueue.
    fn signal(&self);
}

#[cfg(feature = "std")]
pub use std_glue::StdGlue;

#[cfg(feature = "std")]
mod std_glue {
    use super::OsGlue;
    use std::sync::{Condvar, Mutex};
    use std::time::{Duration, Instant};

    /// A `std`-backed [`OsGlue`] for the test harness and user-space hosts:
    /// a `Condvar` plays the role of the original semaphore.
    pub struct StdGlue {
        epoch: Instant,
        signal: Mutex<bool>,
        condvar: Condvar,
    }

    impl StdGlue {
        pub fn new() -> Self {
            Self {
                epoch: Instant::now(),
                signal: Mutex::new(false),
                condvar: Condvar::new(),
            }
        }
    }

    impl Default for StdGlue {
        fn default() -> Self {
            Self::new()
        }
    }

    impl OsGlue for StdGlue {
        fn now_secs(&self) -> u64 {
            self.epoch.elapsed().as_secs()
        }

        fn now_nanos(&self) -> u64 {
            self.epoch.elapsed().as_nanos() as u64
        }

        fn wait(&self, timeout_ns: u64) {
            let guard = self.signal.lock().unwrap();
            let (mut guard, _) = self
                .condvar
                .wait_timeout_while(guard, Duration::from_nanos(timeout_ns), |ready| !*ready)
                .unwrap();
            *guard = false;
        }

        fn signal(&self) {
            let mut guard = self.signal.lock().unwrap();
            *guard = true;
            self.condvar.notify_one();
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn signal_before_wait_is_observed() {
        let glue = StdGlue::new();
        glue.signal();
        glue.wait(1_000_000_000);
    }

    #[test]
    fn now_secs_is_monotonic_nondecreasing() {
        let glue = StdGlue::new();
        let a = glue.now_secs();
        let b = glue.now_secs();
        assert!(b >= a);
    }
}
