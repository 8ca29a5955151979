use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::mpsc;

use crate::scheduler::Breaker;

/// Sends `true` on every stop channel on SIGINT or SIGTERM.
pub fn handle_shutdown(stops: Vec<mpsc::Sender<bool>>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("Received signal {}, shutting down", signal);
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            for stop in &stops {
                // A loop that already exited has dropped its receiver
                let _ = stop.blocking_send(true);
            }
        }
    });
    Ok(())
}

/// Resets every breaker on SIGHUP, resuming scheduling of releases that
/// were suspended after repeated failures.
pub fn handle_reset(breakers: Vec<Breaker>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    std::thread::spawn(move || {
        for _ in signals.forever() {
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Reloading]);
            for breaker in &breakers {
                breaker.reset();
            }
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
        }
    });
    Ok(())
}
