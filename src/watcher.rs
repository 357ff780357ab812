//! Filesystem watch boundary for hot reload.
//!
//! Watches an addon's source directory recursively, reacts to
//! create/modify/delete/rename notifications, and debounces them: every
//! notification inside one debounce window coalesces into a single
//! [`ReloadRequest`]. Requests go out on a depth-1 channel, so a request
//! arriving while one is already queued is dropped; the queued reload
//! will pick the change up anyway.

use std::path::PathBuf;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::HostError;

/// Request to run one reload cycle (empty - coalesced requests are identical).
#[derive(Debug, Clone)]
pub struct ReloadRequest;

/// Watches one addon's source directory and emits debounced reload requests.
pub struct SourceWatcher {
    source_dir: PathBuf,
    debounce: Duration,
    /// The `notify` watcher handle. Dropping it stops filesystem monitoring.
    watcher: RecommendedWatcher,
    /// Raw filesystem events from the `notify` callback thread.
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    reload_tx: mpsc::Sender<ReloadRequest>,
}

impl SourceWatcher {
    /// Create a watcher for one source directory.
    ///
    /// Call [`run()`](Self::run) to start watching. Reload requests are
    /// sent on `reload_tx`, which should have capacity 1 so identical
    /// queued requests collapse.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Watch`] if the filesystem watcher cannot be
    /// initialized.
    pub fn new(
        source_dir: PathBuf,
        debounce: Duration,
        reload_tx: mpsc::Sender<ReloadRequest>,
    ) -> Result<Self, HostError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| HostError::Watch(e.to_string()))?;

        Ok(Self {
            source_dir,
            debounce,
            watcher,
            raw_rx,
            reload_tx,
        })
    }

    /// Run the watch loop until the raw event channel closes or the reload
    /// receiver is dropped.
    pub async fn run(mut self) {
        if let Err(e) = self
            .watcher
            .watch(&self.source_dir, RecursiveMode::Recursive)
        {
            warn!(
                target: "addon_host",
                path = %self.source_dir.display(),
                error = %e,
                "Failed to watch source directory"
            );
            return;
        }
        info!(target: "addon_host", path = %self.source_dir.display(), "Watching addon sources");

        debounce_loop(self.raw_rx, self.debounce, self.reload_tx).await;
    }
}

/// Whether a raw event can change source content.
fn is_content_event(event: &Event) -> bool {
    // Renames surface as Modify(Name) on every notify backend.
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Coalesce raw events into reload requests: each content event restarts
/// the debounce timer; when the timer fires, exactly one request goes out.
/// Stops as soon as the reload receiver is dropped, so a shut-down
/// supervisor does not leave the loop parked on a quiet directory.
async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    debounce: Duration,
    reload_tx: mpsc::Sender<ReloadRequest>,
) {
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            biased;

            () = reload_tx.closed() => {
                debug!(target: "addon_host", "Reload receiver dropped, stopping watcher");
                return;
            }

            () = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                deadline = None;
                match reload_tx.try_send(ReloadRequest) {
                    Ok(()) => debug!(target: "addon_host", "Source changed, reload requested"),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(target: "addon_host", "Reload already queued, dropping request");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(target: "addon_host", "Reload receiver dropped, stopping watcher");
                        return;
                    }
                }
            }

            event = raw_rx.recv() => {
                match event {
                    Some(Ok(ev)) if is_content_event(&ev) => {
                        deadline = Some(tokio::time::Instant::now() + debounce);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(target: "addon_host", error = %e, "Filesystem watcher error");
                    }
                    None => {
                        debug!(target: "addon_host", "Watcher channel closed, stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, ModifyKind};
    use tempfile::TempDir;

    fn modify_event(path: &str) -> notify::Result<Event> {
        Ok(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from(path)))
    }

    #[test]
    fn test_access_events_ignored() {
        let access = Event::new(EventKind::Access(AccessKind::Any));
        assert!(!is_content_event(&access));

        let modify = Event::new(EventKind::Modify(ModifyKind::Any));
        assert!(is_content_event(&modify));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_one_request() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (reload_tx, mut reload_rx) = mpsc::channel(1);

        tokio::spawn(debounce_loop(raw_rx, Duration::from_millis(100), reload_tx));

        // A single save can emit several events in quick succession.
        for _ in 0..5 {
            raw_tx.send(modify_event("/addons/foo/src/a.cs")).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(reload_rx.try_recv().is_ok(), "one request expected");
        assert!(
            reload_rx.try_recv().is_err(),
            "burst must coalesce to a single request"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_fire_separately() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (reload_tx, mut reload_rx) = mpsc::channel(1);

        tokio::spawn(debounce_loop(raw_rx, Duration::from_millis(100), reload_tx));

        raw_tx.send(modify_event("/addons/foo/src/a.cs")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(reload_rx.try_recv().is_ok());

        raw_tx.send(modify_event("/addons/foo/src/a.cs")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(reload_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_inside_window_extend_it() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (reload_tx, mut reload_rx) = mpsc::channel(1);

        tokio::spawn(debounce_loop(raw_rx, Duration::from_millis(100), reload_tx));

        // Keep poking inside the window; no request until the burst ends.
        for _ in 0..3 {
            raw_tx.send(modify_event("/addons/foo/src/a.cs")).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(reload_rx.try_recv().is_err());
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(reload_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_not_duplicated() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        // Receiver never drains: the channel stays full after one request.
        let (reload_tx, mut reload_rx) = mpsc::channel(1);

        tokio::spawn(debounce_loop(raw_rx, Duration::from_millis(100), reload_tx));

        raw_tx.send(modify_event("/a.cs")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        raw_tx.send(modify_event("/a.cs")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(reload_rx.try_recv().is_ok());
        assert!(reload_rx.try_recv().is_err(), "second request was dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_reload_receiver_dropped() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (reload_tx, reload_rx) = mpsc::channel(1);

        let handle = tokio::spawn(debounce_loop(raw_rx, Duration::from_millis(100), reload_tx));

        // No filesystem events arrive; dropping the receiver alone must
        // stop the loop.
        drop(reload_rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop kept running after the receiver was dropped")
            .unwrap();

        drop(raw_tx);
    }

    /// Integration test against the real filesystem. Marked ignored because
    /// inotify/FSEvents latency makes it flaky in CI; run manually with
    /// `--ignored`.
    #[tokio::test]
    #[ignore = "flaky on CI due to filesystem timing"]
    async fn test_watcher_real_fs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.cs"), "initial").unwrap();

        let (reload_tx, mut reload_rx) = mpsc::channel(1);
        let watcher = SourceWatcher::new(
            dir.path().to_path_buf(),
            Duration::from_millis(100),
            reload_tx,
        )
        .unwrap();
        let handle = tokio::spawn(watcher.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        std::fs::write(dir.path().join("a.cs"), "changed").unwrap();

        let request = tokio::time::timeout(Duration::from_secs(10), reload_rx.recv()).await;
        assert!(request.is_ok());

        handle.abort();
    }
}
