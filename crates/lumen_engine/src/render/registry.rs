//! Bounded table of live renderers
//!
//! Renderers are addressed by a small [`RendererId`]. Ids are handed out
//! lowest-free-first, so an id becomes available again once its renderer is
//! removed.

use std::fmt;

/// Maximum number of renderers alive at once
pub const MAX_RENDERERS: usize = 255;

/// Index of a renderer in a [`RendererRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RendererId(u8);

impl RendererId {
    /// Raw index
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for RendererId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "renderer#{}", self.0)
    }
}

/// Owner of every renderer created by the application
pub struct RendererRegistry<T> {
    slots: Vec<Option<T>>,
    len: usize,
}

impl<T> RendererRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { slots: Vec::new(), len: 0 }
    }

    /// Store `renderer` under the lowest free id
    ///
    /// Returns `None` when the registry is full, dropping `renderer`. Use
    /// [`try_insert`](Self::try_insert) to get it back instead.
    pub fn insert(&mut self, renderer: T) -> Option<RendererId> {
        self.try_insert(renderer).ok()
    }

    /// Store `renderer` under the lowest free id, or give it back when full
    pub fn try_insert(&mut self, renderer: T) -> Result<RendererId, T> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.slots.len() < MAX_RENDERERS => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => {
                log::warn!("Renderer registry is full ({} renderers), rejecting new renderer", MAX_RENDERERS);
                return Err(renderer);
            }
        };

        let Ok(raw) = u8::try_from(index) else {
            return Err(renderer);
        };
        self.slots[index] = Some(renderer);
        self.len += 1;
        let id = RendererId(raw);
        log::debug!("Registered {}", id);
        Ok(id)
    }

    /// Borrow a renderer
    pub fn get(&self, id: RendererId) -> Option<&T> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Mutably borrow a renderer
    pub fn get_mut(&mut self, id: RendererId) -> Option<&mut T> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Take a renderer out, freeing its id
    pub fn remove(&mut self, id: RendererId) -> Option<T> {
        let renderer = self.slots.get_mut(id.index()).and_then(Option::take)?;
        self.len -= 1;
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        log::debug!("Unregistered {}", id);
        Some(renderer)
    }

    /// Number of live renderers
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no renderer is registered
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live renderers with their ids, in id order
    pub fn iter(&self) -> impl Iterator<Item = (RendererId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let raw = u8::try_from(index).ok()?;
            slot.as_ref().map(|renderer| (RendererId(raw), renderer))
        })
    }

    /// Drop every renderer, highest id first
    pub fn clear(&mut self) {
        while self.slots.pop().is_some() {}
        self.len = 0;
    }
}

impl<T> Default for RendererRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
