//! Explicitly constructed and destroyed values
//!
//! GPU objects are often declared before the resources needed to build them
//! exist, and rebuilt in place later (resizes). [`Deferred`] makes the
//! "not built yet" state visible in the type.

/// A value that is constructed and destroyed explicitly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred<T> {
    /// Nothing constructed
    Uninitialized,
    /// A live value
    Initialized(T),
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl<T> Deferred<T> {
    /// Store `value`, returning the previously constructed value if there was one
    pub fn construct(&mut self, value: T) -> Option<T> {
        match std::mem::replace(self, Self::Initialized(value)) {
            Self::Initialized(previous) => Some(previous),
            Self::Uninitialized => None,
        }
    }

    /// Take the value out, leaving the slot uninitialized
    pub fn destroy(&mut self) -> Option<T> {
        match std::mem::take(self) {
            Self::Initialized(value) => Some(value),
            Self::Uninitialized => None,
        }
    }

    /// Whether a value is constructed
    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::Initialized(_))
    }

    /// Borrow the value
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Initialized(value) => Some(value),
            Self::Uninitialized => None,
        }
    }

    /// Mutably borrow the value
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Self::Initialized(value) => Some(value),
            Self::Uninitialized => None,
        }
    }
}
