use std::{fmt, marker::PhantomData};

use crossbeam::atomic::AtomicCell;

static NEXT: AtomicCell<u64> = AtomicCell::new(1);

/// A handle to something registered, such as a transport handler or a state listener.
///
/// Handles are unique within the process and typed by what they refer to, so removing
/// a registration never depends on comparing closures.
pub struct Id<T> {
    value: u64,
    kind: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            value: NEXT.fetch_add(1),
            kind: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.value)
    }
}

// `T` is only a marker and needs none of these
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for Id<T> {}
