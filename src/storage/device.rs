//! Whole-device mutual exclusion.
//!
//! Every pool that lives on the same physical medium shares one
//! [`SharedDevice`]. Components take the lock for a single logical operation
//! (one slot write, one append, one migration chunk) and release it before
//! returning, so the acquisition and maintenance tasks never interleave at the
//! byte level but neither can starve the other for a whole segment.
//!
//! Waiting for the lock and the I/O behind it are synchronous. Async tasks
//! reach storage through [`run_blocking`] so a busy device never parks a
//! runtime worker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::StorageError;

/// Handle to the shared storage device
#[derive(Debug, Clone, Default)]
pub struct SharedDevice {
    lock: Arc<Mutex<()>>,
}

/// Exclusive access to the device until dropped
pub type DeviceGuard<'a> = MutexGuard<'a, ()>;

impl SharedDevice {
    /// Create a new device handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the device is free
    ///
    /// A panic while holding the lock leaves no state behind the mutex
    /// itself, so a poisoned lock is simply taken over.
    pub fn lock(&self) -> DeviceGuard<'_> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run a storage operation on tokio's blocking thread pool
///
/// # Errors
///
/// Whatever `op` returns, or [`StorageError::TaskFailed`] if it panicked.
pub async fn run_blocking<T, E, F>(op: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StorageError> + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => result,
        Err(e) => Err(StorageError::TaskFailed(e.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[tokio::test]
    async fn test_busy_device_does_not_stall_runtime() {
        let device = SharedDevice::new();
        let holder_device = device.clone();
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            let _guard = holder_device.lock();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();

        let waiting = tokio::spawn(run_blocking(move || {
            let _guard = device.lock();
            Ok::<_, StorageError>(7)
        }));

        // Single-threaded runtime keeps serving other tasks meanwhile
        let other = tokio::spawn(async { 2 + 2 });
        assert_eq!(other.await.unwrap(), 4);
        assert!(!waiting.is_finished());

        release_tx.send(()).unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), 7);
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn test_panicking_operation_becomes_error() {
        let result: Result<(), StorageError> = run_blocking(|| panic!("worn flash")).await;
        assert!(matches!(result, Err(StorageError::TaskFailed(_))));
    }

    #[test]
    fn test_lock_is_shared_between_clones() {
        let device = SharedDevice::new();
        let other = device.clone();
        let busy = Arc::new(AtomicBool::new(false));

        let guard = device.lock();
        let flag = Arc::clone(&busy);
        let handle = thread::spawn(move || {
            let _guard = other.lock();
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!busy.load(Ordering::SeqCst), "second holder must wait");
        drop(guard);

        handle.join().unwrap();
        assert!(busy.load(Ordering::SeqCst));
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let device = SharedDevice::new();
        let other = device.clone();
        let _ = thread::spawn(move || {
            let _guard = other.lock();
            panic!("storage task crashed");
        })
        .join();

        let _guard = device.lock();
    }
}
