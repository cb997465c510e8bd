// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./slab_list_test.rs"]
mod slab_list_test;

//
// SlabHandle
//

// Addresses a node of a SlabList. A handle to a removed node never resolves again, even after its
// slot has been reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlabHandle {
  index: usize,
  generation: u64,
}

#[derive(Debug)]
struct Slot<T> {
  generation: u64,
  value: Option<T>,
  prev: Option<usize>,
  next: Option<usize>,
}

//
// SlabList
//

// Doubly linked list stored in a slab. Nodes are addressed by generational handles so that cursors
// can be held across mutations without borrowing the list.
#[derive(Debug)]
pub struct SlabList<T> {
  slots: Vec<Slot<T>>,
  free: Vec<usize>,
  head: Option<usize>,
  tail: Option<usize>,
  len: usize,
}

impl<T> Default for SlabList<T> {
  fn default() -> Self {
    Self {
      slots: Vec::new(),
      free: Vec::new(),
      head: None,
      tail: None,
      len: 0,
    }
  }
}

impl<T> SlabList<T> {
  #[must_use]
  pub const fn len(&self) -> usize {
    self.len
  }

  #[must_use]
  pub const fn is_empty(&self) -> bool {
    self.len == 0
  }

  fn alloc(&mut self, value: T, prev: Option<usize>, next: Option<usize>) -> usize {
    if let Some(index) = self.free.pop() {
      let slot = &mut self.slots[index];
      slot.value = Some(value);
      slot.prev = prev;
      slot.next = next;
      index
    } else {
      self.slots.push(Slot {
        generation: 0,
        value: Some(value),
        prev,
        next,
      });
      self.slots.len() - 1
    }
  }

  pub fn push_back(&mut self, value: T) -> SlabHandle {
    let index = self.alloc(value, self.tail, None);
    match self.tail {
      Some(tail) => self.slots[tail].next = Some(index),
      None => self.head = Some(index),
    }
    self.tail = Some(index);
    self.len += 1;
    self.handle(index)
  }

  // Inserts before the supplied node. Returns None without inserting if the handle is stale.
  pub fn insert_before(&mut self, before: SlabHandle, value: T) -> Option<SlabHandle> {
    let prev = self.live_slot(before)?.prev;
    let index = self.alloc(value, prev, Some(before.index));
    self.slots[before.index].prev = Some(index);
    match prev {
      Some(prev) => self.slots[prev].next = Some(index),
      None => self.head = Some(index),
    }
    self.len += 1;
    Some(self.handle(index))
  }

  fn handle(&self, index: usize) -> SlabHandle {
    SlabHandle {
      index,
      generation: self.slots[index].generation,
    }
  }

  fn live_slot(&self, handle: SlabHandle) -> Option<&Slot<T>> {
    self
      .slots
      .get(handle.index)
      .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
  }

  pub fn get(&self, handle: SlabHandle) -> Option<&T> {
    self.live_slot(handle).and_then(|slot| slot.value.as_ref())
  }

  pub fn get_mut(&mut self, handle: SlabHandle) -> Option<&mut T> {
    self
      .slots
      .get_mut(handle.index)
      .filter(|slot| slot.generation == handle.generation)
      .and_then(|slot| slot.value.as_mut())
  }

  pub fn front(&self) -> Option<SlabHandle> {
    self.head.map(|index| self.handle(index))
  }

  pub fn back(&self) -> Option<SlabHandle> {
    self.tail.map(|index| self.handle(index))
  }

  // The node after the supplied one, or None if it is the last or the handle is stale.
  pub fn next(&self, handle: SlabHandle) -> Option<SlabHandle> {
    self
      .live_slot(handle)
      .and_then(|slot| slot.next)
      .map(|index| self.handle(index))
  }

  pub fn prev(&self, handle: SlabHandle) -> Option<SlabHandle> {
    self
      .live_slot(handle)
      .and_then(|slot| slot.prev)
      .map(|index| self.handle(index))
  }

  pub fn remove(&mut self, handle: SlabHandle) -> Option<T> {
    self.live_slot(handle)?;

    let slot = &mut self.slots[handle.index];
    let value = slot.value.take();
    let (prev, next) = (slot.prev.take(), slot.next.take());
    slot.generation += 1;

    match prev {
      Some(prev) => self.slots[prev].next = next,
      None => self.head = next,
    }
    match next {
      Some(next) => self.slots[next].prev = prev,
      None => self.tail = prev,
    }
    self.free.push(handle.index);
    self.len -= 1;
    value
  }

  // Removes every node, front first.
  pub fn drain(&mut self) -> Vec<T> {
    let mut values = Vec::with_capacity(self.len);
    while let Some(handle) = self.front() {
      values.extend(self.remove(handle));
    }
    values
  }

  // Removes every node. The slab allocation is kept.
  pub fn clear(&mut self) {
    while let Some(handle) = self.front() {
      self.remove(handle);
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (SlabHandle, &T)> {
    std::iter::successors(self.front(), |handle| self.next(*handle))
      .filter_map(|handle| self.get(handle).map(|value| (handle, value)))
  }
}
