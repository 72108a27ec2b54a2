//! Opaque handles: generation-checked indices into a per-bridge resource table.
//! Handle layout: high 32 bits generation, low 32 bits slot index + 1. Always > 0; 0 is never issued.

const MAX_GENERATION: u32 = 0x7FFF_FFFF;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> i64 {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;
        compose(index, slot.generation)
    }

    pub fn get(&self, handle: i64) -> Option<&T> {
        let (index, generation) = split(handle)?;
        let slot = self.slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: i64) -> Option<&mut T> {
        let (index, generation) = split(handle)?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, handle: i64) -> bool {
        self.get(handle).is_some()
    }

    /// Remove and return the value; the slot's generation moves on so `handle` goes stale.
    pub fn remove(&mut self, handle: i64) -> Option<T> {
        let (index, generation) = split(handle)?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = if slot.generation >= MAX_GENERATION {
            1
        } else {
            slot.generation + 1
        };
        self.free.push(index as u32);
        self.len -= 1;
        Some(value)
    }

    /// Remove every live entry, returning (handle, value) pairs.
    pub fn drain(&mut self) -> Vec<(i64, T)> {
        let handles: Vec<i64> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(i, s)| compose(i as u32, s.generation))
            .collect();
        handles
            .into_iter()
            .filter_map(|h| self.remove(h).map(|v| (h, v)))
            .collect()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn compose(index: u32, generation: u32) -> i64 {
    (i64::from(generation) << 32) | (i64::from(index) + 1)
}

fn split(handle: i64) -> Option<(usize, u32)> {
    if handle <= 0 {
        return None;
    }
    let low = (handle & 0xFFFF_FFFF) as u32;
    if low == 0 {
        return None;
    }
    Some(((low - 1) as usize, (handle >> 32) as u32))
}
