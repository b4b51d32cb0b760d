//! Complains when the engine stops making rounds.
use std::time::Duration;

use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tracing::{debug, warn};

/// What the engine reports on every reset, and what the watchdog prints
/// when the resets stop coming.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Heartbeat {
    pub phase: &'static str,
    pub rounds: u64,
    pub received_messages: u64,
    pub pending_data: usize,
    pub downloads: usize,
}

/// The engine side of the watchdog. Dropping it stops the watchdog.
#[derive(Debug)]
pub struct Watchdog {
    tx: watch::Sender<Heartbeat>,
}

impl Watchdog {
    /// Spawn a watchdog that expects a reset at least every `interval`.
    pub fn spawn(interval: Duration) -> (Self, JoinHandle<u64>) {
        let (tx, rx) = watch::channel(Heartbeat::default());
        let handle = tokio::spawn(watch_over(rx, interval));
        (Self { tx }, handle)
    }

    pub fn reset(&self, beat: Heartbeat) {
        self.tx.send_replace(beat);
    }
}

/// Returns how many times the engine missed a reset.
async fn watch_over(mut rx: watch::Receiver<Heartbeat>, interval: Duration) -> u64 {
    let mut missed = 0;
    loop {
        match timeout(interval, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                missed += 1;
                let beat = rx.borrow().clone();
                warn!(
                    "engine did not reset the watchdog for {interval:?}: phase={} \
                     rounds={} received={} pending data={} downloads={}",
                    beat.phase,
                    beat.rounds,
                    beat.received_messages,
                    beat.pending_data,
                    beat.downloads
                );
            }
        }
    }
    debug!("watchdog stopped after {missed} missed resets");
    missed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn silence_is_reported() {
        let (watchdog, handle) = Watchdog::spawn(Duration::from_secs(1));
        watchdog.reset(Heartbeat {
            phase: "running",
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        drop(watchdog);
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resets_keep_it_quiet() {
        let (watchdog, handle) = Watchdog::spawn(Duration::from_secs(1));
        for rounds in 0..5 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            watchdog.reset(Heartbeat {
                rounds,
                ..Default::default()
            });
        }
        drop(watchdog);
        assert_eq!(handle.await.unwrap(), 0);
    }
}
