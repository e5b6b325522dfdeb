#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use docfs::backend::{BackendError, ChildEntry, ObjectAttrs, ObjectKind, StorageBackend};
use docfs::mount::{MountContext, MountOptions};
use docfs::path::ObjectPath;
use docfs::watchdog::ExpiryAction;

pub fn p(raw: &str) -> ObjectPath {
    ObjectPath::parse(raw).unwrap()
}

#[derive(Debug, Clone)]
enum MockObject {
    File(Bytes),
    Dir,
}

/// In-memory store with knobs for latency, stalls and panics.
///
/// Every call records how many calls are executing at once, so tests can assert on the
/// concurrency the dispatcher allows.
#[derive(Debug)]
pub struct MockStore {
    objects: Mutex<BTreeMap<ObjectPath, MockObject>>,
    latency: Mutex<Duration>,
    held: Mutex<bool>,
    unheld: Condvar,
    panic_on: Mutex<Option<ObjectPath>>,
    pub calls: AtomicUsize,
    pub waiting_on_hold: AtomicUsize,
    executing: AtomicUsize,
    max_executing: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(ObjectPath::root(), MockObject::Dir);
        Self {
            objects: Mutex::new(objects),
            latency: Mutex::new(Duration::ZERO),
            held: Mutex::new(false),
            unheld: Condvar::new(),
            panic_on: Mutex::new(None),
            calls: AtomicUsize::new(0),
            waiting_on_hold: AtomicUsize::new(0),
            executing: AtomicUsize::new(0),
            max_executing: AtomicUsize::new(0),
        }
    }

    /// Add a file, creating its ancestors.
    pub fn file(self, raw: &str, content: &[u8]) -> Self {
        let path = p(raw);
        self.add_parents(&path);
        self.objects
            .lock()
            .unwrap()
            .insert(path, MockObject::File(Bytes::copy_from_slice(content)));
        self
    }

    /// Add a directory, creating its ancestors.
    pub fn dir(self, raw: &str) -> Self {
        let path = p(raw);
        self.add_parents(&path);
        self.objects.lock().unwrap().insert(path, MockObject::Dir);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = latency;
        self
    }

    fn add_parents(&self, path: &ObjectPath) {
        let mut objects = self.objects.lock().unwrap();
        let mut cursor = path.parent();
        while let Some(parent) = cursor {
            cursor = parent.parent();
            objects.insert(parent, MockObject::Dir);
        }
    }

    /// Make every subsequent call block until [`unhold`](Self::unhold).
    pub fn hold(&self) {
        *self.held.lock().unwrap() = true;
    }

    pub fn unhold(&self) {
        *self.held.lock().unwrap() = false;
        self.unheld.notify_all();
    }

    /// Panic when `raw` is touched.
    pub fn panic_on(&self, raw: &str) {
        *self.panic_on.lock().unwrap() = Some(p(raw));
    }

    /// Remove an object from under the mount.
    pub fn remove(&self, raw: &str) {
        self.objects.lock().unwrap().remove(&p(raw));
    }

    pub fn max_executing(&self) -> usize {
        self.max_executing.load(Ordering::SeqCst)
    }

    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    /// Spin until `n` calls are parked on the hold.
    pub fn wait_for_held_calls(&self, n: usize) {
        for _ in 0..1000 {
            if self.waiting_on_hold.load(Ordering::SeqCst) >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("{n} calls never reached the backend");
    }

    fn enter(&self, path: &ObjectPath) -> CallGuard<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_executing.fetch_max(now, Ordering::SeqCst);
        let guard = CallGuard { store: self };

        {
            let mut held = self.held.lock().unwrap();
            if *held {
                self.waiting_on_hold.fetch_add(1, Ordering::SeqCst);
                while *held {
                    held = self.unheld.wait(held).unwrap();
                }
                self.waiting_on_hold.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let should_panic = self.panic_on.lock().unwrap().as_ref() == Some(path);
        if should_panic {
            panic!("mock store told to panic on {path}");
        }
        guard
    }

    fn get(&self, path: &ObjectPath) -> Result<MockObject, BackendError> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(path.clone()))
    }
}

struct CallGuard<'a> {
    store: &'a MockStore,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.store.executing.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StorageBackend for MockStore {
    /// Whether the store is reachable.
    type Endpoint = bool;

    fn connect(reachable: &bool) -> Result<Self, BackendError> {
        if *reachable {
            Ok(Self::new())
        } else {
            Err(BackendError::Connect("mock store unreachable".to_owned()))
        }
    }

    fn fetch(&self, path: &ObjectPath, offset: u64, len: u32) -> Result<Bytes, BackendError> {
        let _call = self.enter(path);
        match self.get(path)? {
            MockObject::File(content) => {
                let start = usize::try_from(offset).unwrap().min(content.len());
                let end = start.saturating_add(len as usize).min(content.len());
                Ok(content.slice(start..end))
            }
            MockObject::Dir => Err(BackendError::Io(std::io::Error::from_raw_os_error(
                libc::EISDIR,
            ))),
        }
    }

    fn stat(&self, path: &ObjectPath) -> Result<ObjectAttrs, BackendError> {
        let _call = self.enter(path);
        Ok(match self.get(path)? {
            MockObject::File(content) => {
                ObjectAttrs::file(content.len() as u64, SystemTime::UNIX_EPOCH)
            }
            MockObject::Dir => ObjectAttrs::directory(SystemTime::UNIX_EPOCH),
        })
    }

    fn list(&self, path: &ObjectPath) -> Result<Vec<ChildEntry>, BackendError> {
        let _call = self.enter(path);
        if let MockObject::File(_) = self.get(path)? {
            return Err(BackendError::NotADirectory(path.clone()));
        }
        let objects = self.objects.lock().unwrap();
        let mut children: Vec<ChildEntry> = objects
            .iter()
            .filter(|(candidate, _)| candidate.parent().as_ref() == Some(path))
            .map(|(candidate, object)| ChildEntry {
                name: candidate.file_name().unwrap().to_owned(),
                kind: match object {
                    MockObject::File(_) => ObjectKind::File,
                    MockObject::Dir => ObjectKind::Directory,
                },
            })
            .collect();
        children.sort();
        Ok(children)
    }
}

/// Expiry action that reports instead of exiting.
pub struct RecordingExpiry {
    fired: AtomicUsize,
    tx: Sender<Duration>,
}

impl RecordingExpiry {
    pub fn new() -> (Arc<Self>, Receiver<Duration>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Arc::new(Self {
                fired: AtomicUsize::new(0),
                tx,
            }),
            rx,
        )
    }

    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

impl ExpiryAction for RecordingExpiry {
    fn expire(&self, deadline: Duration) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        // The receiver may be gone; only the count matters then.
        let _ = self.tx.send(deadline);
    }
}

/// Mount `store` with an expiry action that never exits the test process.
pub fn mount(
    store: MockStore,
    options: MountOptions,
) -> (Arc<MountContext<MockStore>>, Arc<MockStore>, Arc<RecordingExpiry>) {
    let store = Arc::new(store);
    let (expiry, _rx) = RecordingExpiry::new();
    let action: Arc<dyn ExpiryAction> = expiry.clone();
    let ctx = MountContext::with_backend(Arc::clone(&store), options, action).unwrap();
    (ctx, store, expiry)
}
