use std::sync::{Arc, Mutex, MutexGuard};

/// A cell holding a mutable value where we can wait
/// for the value to reach a given condition
pub struct StateCell<T> {
    inner: Arc<StateCellImpl<T>>,
}

struct StateCellImpl<T> {
    // A Mutex + Notify pair plays the role of a mutex + condition variable.
    // Every mutation goes through `update`, which wakes all waiters while
    // the new value is already visible.
    value: Mutex<T>,
    cvar: tokio::sync::Notify,
}

impl<T: Default> Default for StateCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        let inner = self.inner.clone();
        Self { inner }
    }
}

impl<T> StateCell<T> {
    /// Creates a StateCell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(StateCellImpl {
                value: Mutex::new(value),
                cvar: tokio::sync::Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // a panic while holding the lock cannot leave the value half-written,
        // every update is a plain field assignment
        self.inner.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutates the value under the lock and wakes every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let res = f(&mut self.lock());
        self.inner.cvar.notify_waiters();
        res
    }

    /// Wakes every waiter without changing the value.
    pub fn notify(&self) {
        self.inner.cvar.notify_waiters();
    }
}

impl<T: Clone> StateCell<T> {
    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.lock().clone()
    }

    /// Wait for the value to satisfy `pred`, returning a copy of it.
    pub async fn wait_until(&self, mut pred: impl FnMut(&T) -> bool) -> T {
        loop {
            // register interest before checking so an update between the
            // check and the await is not lost
            let notified = self.inner.cvar.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let value = self.lock();
                if pred(&value) {
                    return value.clone();
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::StateCell;

    #[tokio::test]
    async fn basic() {
        let cell = StateCell::new(0);
        cell.update(|v| *v = 42);
        assert_eq!(42, cell.get());
        assert_eq!(42, cell.wait_until(|v| *v == 42).await);
    }

    #[tokio::test]
    async fn unset_timeout_1ms() {
        let cell = StateCell::new(0);
        let res = tokio::time::timeout(Duration::from_millis(1), cell.wait_until(|v| *v == 42)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn clone() {
        let cell = StateCell::new(0);
        let cloned = cell.clone();
        cloned.update(|v| *v = 42);
        assert_eq!(42, cell.get());
    }

    #[tokio::test]
    async fn basic_threaded() {
        let cell = StateCell::new(0);
        {
            let cell = cell.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                cell.update(|v| *v = 1);
                tokio::time::sleep(Duration::from_millis(1)).await;
                cell.update(|v| *v = 42);
            });
        }
        assert_eq!(42, cell.wait_until(|v| *v == 42).await);
    }

    #[tokio::test]
    async fn update_returns_value() {
        let cell = StateCell::new(7);
        let prev = cell.update(|v| std::mem::replace(v, 8));
        assert_eq!(7, prev);
        assert_eq!(8, cell.get());
    }
}
