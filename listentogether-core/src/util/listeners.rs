use std::sync::Arc;

use parking_lot::Mutex;

use super::Id;

/// Marker for [ListenerId].
pub struct Listener;

pub type ListenerId = Id<Listener>;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of state listeners that are notified whenever a store changes.
pub struct Listeners<T> {
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> Listeners<T> {
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId::new();
        self.entries.lock().push((id, Arc::new(listener)));

        id
    }

    /// Removes a listener, returning false if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(i, _)| *i != id);

        entries.len() != before
    }

    /// Calls every listener with the given value.
    ///
    /// The list is copied first, so listeners may subscribe or unsubscribe while being notified.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<_> = self.entries.lock().iter().map(|(_, c)| c.clone()).collect();

        for callback in callbacks {
            callback(value)
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            entries: Default::default(),
        }
    }
}
