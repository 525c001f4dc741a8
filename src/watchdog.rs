use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

/// How often the watchdog thread re-checks its budget and cancel flag.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Terminates a running script once its wall-clock budget expires.
///
/// One watchdog is armed per handler invocation. The expiry path calls the
/// engine's asynchronous terminate through a thread-safe isolate handle, so
/// even a pure-CPU loop inside JS is interrupted. `stop()` is called from
/// the finally path whether or not the budget fired; both it and the
/// termination itself are idempotent.
pub struct Watchdog {
    fired: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    /// Arms a new watchdog against the given isolate.
    pub fn start(isolate_handle: v8::IsolateHandle, budget: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));

        let thread = thread::spawn({
            let fired = fired.clone();
            let cancel = cancel.clone();
            let deadline = Instant::now() + budget;

            move || loop {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                if Instant::now() >= deadline {
                    fired.store(true, Ordering::SeqCst);
                    isolate_handle.terminate_execution();
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
        });

        Watchdog {
            fired,
            cancel,
            thread: Some(thread),
        }
    }

    /// Disarms the watchdog. Safe to call after the budget fired.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Returns if the budget expired and the engine was terminated.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
