//! Index-addressed storage for connection records.
//!
//! [`Slab`] hands out stable slot indices for live connections; removing an
//! entry returns its index to a free stack so the next insert reuses it.
//! [`FreeList`] is a bounded stack of reset records kept for reuse.

#[derive(Debug)]
pub struct Slab<T> {
    items: Vec<Option<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Slab<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { items: Vec::with_capacity(capacity), free: Vec::new(), len: 0 }
    }

    pub fn insert(&mut self, item: T) -> usize {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                self.items[index] = Some(item);
                index
            }
            None => {
                self.items.push(Some(item));
                self.items.len() - 1
            }
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        let item = self.items.get_mut(index)?.take()?;
        self.free.push(index);
        self.len -= 1;
        Some(item)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)?.as_mut()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items.iter().enumerate().filter_map(|(i, item)| item.as_ref().map(|item| (i, item)))
    }

    /// Removes every entry, yielding them.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.free.clear();
        self.len = 0;
        self.items.drain(..).flatten()
    }
}

#[derive(Debug)]
pub struct FreeList<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> FreeList<T> {
    pub fn new(capacity: usize) -> Self {
        Self { items: Vec::with_capacity(capacity.min(1024)), capacity }
    }

    pub fn take(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Parks an item for reuse; once full the item is handed back to be dropped.
    pub fn park(&mut self, item: T) -> Result<(), T> {
        if self.items.len() < self.capacity {
            self.items.push(item);
            Ok(())
        } else {
            Err(item)
        }
    }
}
