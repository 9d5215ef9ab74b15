//! Background expiry for the TTL index.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::index::TtlIndex;

/// Owns the sweep thread. Dropping it stops and joins the thread.
pub struct Sweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start sweeping `index` every `interval`.
    pub fn spawn(index: Arc<TtlIndex>, interval: Duration) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("simplefs-sweeper".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "Sweeper started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            index.sweep();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Sweeper stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Sweeper thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::index::{EntryValue, Expiry};
    use bytes::Bytes;

    #[test]
    fn test_sweeper_expires_entries() {
        let index = Arc::new(TtlIndex::new(0));
        index.set("meta", EntryValue::Inline(Bytes::from_static(b"m")), Expiry::NextSweep);
        index.set(
            "keep",
            EntryValue::Inline(Bytes::from_static(b"k")),
            Expiry::Never,
        );

        let mut sweeper = Sweeper::spawn(index.clone(), Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        sweeper.stop();

        assert_eq!(index.keys(), vec!["keep".to_string()]);
    }
}
