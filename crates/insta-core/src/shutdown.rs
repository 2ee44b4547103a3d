use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks long-running operations (log follows, pulls) to wind
/// down; a second one exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, stopping streams...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Block until `done` returns true or shutdown is requested, checking every
/// `poll`. Returns whether shutdown interrupted the wait.
pub fn wait_until(poll: Duration, mut done: impl FnMut() -> bool) -> bool {
    loop {
        if done() {
            return false;
        }
        if shutdown_requested() {
            return true;
        }
        std::thread::sleep(poll);
    }
}
