//! Debounced state writer for the local persistence mode.
//!
//! Rapid successive edits coalesce into one write: each scheduled payload
//! pushes the deadline out again, and only the latest payload reaches disk
//! once the window goes quiet.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct DebouncedWriter {
    tx: mpsc::UnboundedSender<String>,
}

impl DebouncedWriter {
    pub fn spawn(path: PathBuf, window: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut latest = first;
                let mut deadline = Instant::now() + window;
                loop {
                    tokio::select! {
                        _ = sleep_until(deadline) => break,
                        next = rx.recv() => match next {
                            Some(payload) => {
                                latest = payload;
                                deadline = Instant::now() + window;
                            }
                            // Sender gone: flush what we have and stop.
                            None => break,
                        }
                    }
                }
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::write(&path, latest.as_bytes()).await {
                    tracing::error!(path = %path.display(), error = %e, "state write failed");
                }
            }
        });
        Self { tx }
    }

    /// Queues the payload; a failed send means the writer task is gone, which
    /// only happens at shutdown.
    pub fn schedule(&self, contents: String) {
        if self.tx.send(contents).is_err() {
            tracing::warn!("state writer task gone; dropping write");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_file(path: &std::path::Path) -> String {
        for _ in 0..200 {
            if let Ok(contents) = tokio::fs::read_to_string(path).await {
                return contents;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state file never appeared at {}", path.display());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_writes_coalesce_to_latest_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = DebouncedWriter::spawn(path.clone(), Duration::from_millis(500));

        writer.schedule("first".into());
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        writer.schedule("second".into());
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        writer.schedule("third".into());
        tokio::task::yield_now().await;
        // Only now does the window elapse without a fresh payload.
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        tokio::time::resume();
        assert_eq!(wait_for_file(&path).await, "third");
    }

    #[tokio::test(start_paused = true)]
    async fn later_batches_overwrite_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = DebouncedWriter::spawn(path.clone(), Duration::from_millis(100));

        writer.schedule("one".into());
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        tokio::time::resume();
        assert_eq!(wait_for_file(&path).await, "one");

        tokio::time::pause();
        writer.schedule("two".into());
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        tokio::time::resume();
        for _ in 0..200 {
            if wait_for_file(&path).await == "two" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("second batch never reached disk");
    }
}
