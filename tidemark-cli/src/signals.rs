//! Interrupt handling
//!
//! The first SIGINT, SIGTERM or SIGHUP cancels the running command: a waiting
//! `up`/`down`/`redo` gives up on the lock, and a batch stops before its next
//! migration and rolls back. A second signal exits at once.

use tidemark::CancelToken;

/// Exit status for a run stopped by a second signal
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// What the watcher does with the `nth` signal received (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Cancel,
    Exit,
}

pub fn respond(nth: usize, cancel: &CancelToken) -> Response {
    if nth <= 1 {
        cancel.cancel();
        Response::Cancel
    } else {
        Response::Exit
    }
}

/// Route termination signals to `cancel`
///
/// Must run before any other thread is spawned: the signals are blocked on the
/// calling thread, threads spawned later inherit that mask, and only the watcher
/// thread receives them.
///
/// # Errors
///
/// Fails if the signal mask cannot be changed or the watcher cannot be spawned.
#[cfg(unix)]
pub fn cancel_on_signal(cancel: &CancelToken) -> anyhow::Result<()> {
    let set = watched_signals();
    set.thread_block()?;

    let cancel = cancel.clone();
    std::thread::Builder::new()
        .name("tidemark-signals".to_string())
        .spawn(move || watch(&set, &cancel))?;
    Ok(())
}

#[cfg(unix)]
fn watched_signals() -> nix::sys::signal::SigSet {
    use nix::sys::signal::{SigSet, Signal};

    let mut set = SigSet::empty();
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        set.add(signal);
    }
    set
}

#[cfg(unix)]
fn watch(set: &nix::sys::signal::SigSet, cancel: &CancelToken) {
    let mut received = 0;
    loop {
        let signal = match set.wait() {
            Ok(signal) => signal,
            Err(e) => {
                log::warn!("Stopped watching for signals: {e}");
                return;
            }
        };
        received += 1;

        match respond(received, cancel) {
            Response::Cancel => log::warn!(
                "Received {}, cancelling (send again to exit immediately)",
                signal.as_str()
            ),
            Response::Exit => {
                log::error!("Received {} again, exiting", signal.as_str());
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
        }
    }
}

/// Without POSIX signals the process keeps the platform's default Ctrl-C handling
#[cfg(not(unix))]
pub fn cancel_on_signal(_cancel: &CancelToken) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signal_cancels_second_exits() {
        let cancel = CancelToken::new();
        let held_by_migrator = cancel.clone();

        assert_eq!(respond(1, &cancel), Response::Cancel);
        assert!(held_by_migrator.is_cancelled());
        assert!(matches!(
            held_by_migrator.check(),
            Err(tidemark::MigrationError::Cancelled)
        ));

        assert_eq!(respond(2, &cancel), Response::Exit);
    }

    #[cfg(unix)]
    #[test]
    fn test_watches_termination_signals() {
        use nix::sys::signal::Signal;

        let set = watched_signals();
        assert!(set.contains(Signal::SIGINT));
        assert!(set.contains(Signal::SIGTERM));
        assert!(set.contains(Signal::SIGHUP));
        assert!(!set.contains(Signal::SIGQUIT));
    }
}
