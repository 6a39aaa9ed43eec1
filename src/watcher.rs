//! File watching for live shader editing.
//!
//! Changes are debounced and delivered to listeners as one set of paths per
//! polling interval. Listeners are held as weak references: the watcher
//! never owns its observers, and a listener that forgets to remove itself
//! is dropped silently once it dies.

use fxhash::FxHashSet;
use log::{debug, warn};
use notify::{watcher, DebouncedEvent, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

pub trait FileWatchListener: Send + Sync {
    fn on_files_changed(&self, files: &FxHashSet<PathBuf>);
}

struct WatcherShared {
    listeners: Mutex<Vec<Weak<dyn FileWatchListener>>>,
    active: AtomicBool,
}

impl WatcherShared {
    fn dispatch(&self, files: &FxHashSet<PathBuf>) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|weak| match weak.upgrade() {
            Some(listener) => {
                listener.on_files_changed(files);
                true
            }
            None => false,
        });
    }
}

pub struct FileWatcher {
    shared: Arc<WatcherShared>,
    watcher: Mutex<RecommendedWatcher>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatcher {
    /// Spawns the polling thread. `poll_interval` is both the debounce
    /// window and the delivery cadence.
    pub fn new(poll_interval: Duration) -> notify::Result<FileWatcher> {
        let (tx, rx) = channel();
        let inner = watcher(tx, poll_interval)?;
        let shared = Arc::new(WatcherShared {
            listeners: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("file-watcher".into())
                .spawn(move || pump_events(rx, shared, poll_interval))
                .expect("failed to spawn watcher thread")
        };

        Ok(FileWatcher {
            shared,
            watcher: Mutex::new(inner),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn add_directory(&self, path: &Path) {
        if let Err(e) = self
            .watcher
            .lock()
            .unwrap()
            .watch(path, RecursiveMode::Recursive)
        {
            warn!("could not watch directory {:?}: {}", path, e);
        }
    }

    pub fn add_listener(&self, listener: Weak<dyn FileWatchListener>) {
        self.shared.listeners.lock().unwrap().push(listener);
    }

    pub fn remove_listener(&self, listener: &Weak<dyn FileWatchListener>) {
        self.shared
            .listeners
            .lock()
            .unwrap()
            .retain(|other| !other.ptr_eq(listener));
    }

    pub fn stop(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_events(
    rx: Receiver<DebouncedEvent>,
    shared: Arc<WatcherShared>,
    poll_interval: Duration,
) {
    let mut batch: FxHashSet<PathBuf> = FxHashSet::default();
    while shared.active.load(Ordering::SeqCst) {
        match rx.recv_timeout(poll_interval) {
            Ok(event) => {
                match event {
                    DebouncedEvent::Create(path)
                    | DebouncedEvent::Write(path)
                    | DebouncedEvent::Chmod(path)
                    | DebouncedEvent::Remove(path) => {
                        batch.insert(path);
                    }
                    DebouncedEvent::Rename(from, to) => {
                        batch.insert(from);
                        batch.insert(to);
                    }
                    _ => {}
                }
                // keep draining whatever the debouncer already queued
                while let Ok(event) = rx.try_recv() {
                    if let DebouncedEvent::Create(p)
                    | DebouncedEvent::Write(p)
                    | DebouncedEvent::Chmod(p)
                    | DebouncedEvent::Remove(p) = event
                    {
                        batch.insert(p);
                    }
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if !batch.is_empty() {
            debug!("watcher: {} changed file(s)", batch.len());
            shared.dispatch(&batch);
            batch.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener {
        hits: AtomicUsize,
        last: Mutex<FxHashSet<PathBuf>>,
    }

    impl FileWatchListener for CountingListener {
        fn on_files_changed(&self, files: &FxHashSet<PathBuf>) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = files.clone();
        }
    }

    #[test]
    fn delivers_debounced_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched.hlsl");
        std::fs::write(&file, "a").unwrap();

        let watcher = FileWatcher::new(Duration::from_millis(50)).unwrap();
        watcher.add_directory(dir.path());

        let listener = Arc::new(CountingListener {
            hits: AtomicUsize::new(0),
            last: Mutex::new(FxHashSet::default()),
        });
        let weak: Weak<dyn FileWatchListener> = Arc::downgrade(&listener);
        watcher.add_listener(weak);

        // give the OS watcher a moment to arm before mutating
        std::thread::sleep(Duration::from_millis(200));
        std::fs::write(&file, "b").unwrap();

        let mut waited = 0;
        while listener.hits.load(Ordering::SeqCst) == 0 && waited < 5000 {
            std::thread::sleep(Duration::from_millis(50));
            waited += 50;
        }
        assert!(listener.hits.load(Ordering::SeqCst) > 0, "no change delivered");
        let last = listener.last.lock().unwrap();
        assert!(last.iter().any(|p| p.ends_with("watched.hlsl")));
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let watcher = FileWatcher::new(Duration::from_millis(50)).unwrap();
        let listener = Arc::new(CountingListener {
            hits: AtomicUsize::new(0),
            last: Mutex::new(FxHashSet::default()),
        });
        let weak: Weak<dyn FileWatchListener> = Arc::downgrade(&listener);
        watcher.add_listener(weak.clone());
        watcher.remove_listener(&weak);

        let mut set = FxHashSet::default();
        set.insert(PathBuf::from("x"));
        watcher.shared.dispatch(&set);
        assert_eq!(listener.hits.load(Ordering::SeqCst), 0);
    }
}
