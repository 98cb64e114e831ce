//! Child storage for element nodes.
//!
//! The first four children live in an inline block inside the node; a heap
//! block takes over from the fifth child on, growing by an amortized
//! formula so repeated appends stay O(1). Slice operations follow list
//! semantics: negative indices, any nonzero step, and exact-length
//! replacement for extended slices.

use super::element::Element;
use super::TreeError;

/// Children held without a separate allocation.
const INLINE_CAP: usize = 4;

/// Capacity target for a heap block that must hold `needed` children.
fn grow_target(needed: usize) -> usize {
    needed + (needed >> 3) + if needed < 9 { 3 } else { 6 }
}

enum Store {
    Inline {
        slots: [Option<Element>; INLINE_CAP],
        len: u8,
    },
    Heap(Vec<Element>),
}

pub(crate) struct ChildList {
    store: Store,
}

impl ChildList {
    pub(crate) fn new() -> Self {
        ChildList {
            store: Store::Inline {
                slots: [None, None, None, None],
                len: 0,
            },
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.store {
            Store::Inline { len, .. } => *len as usize,
            Store::Heap(vec) => vec.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn get(&self, i: usize) -> Option<&Element> {
        match &self.store {
            Store::Inline { slots, len } => {
                if i < *len as usize {
                    slots[i].as_ref()
                } else {
                    None
                }
            }
            Store::Heap(vec) => vec.get(i),
        }
    }

    fn at(&self, i: usize) -> &Element {
        match self.get(i) {
            Some(el) => el,
            None => unreachable!("child index within length"),
        }
    }

    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            inner: match &self.store {
                Store::Inline { slots, len } => Inner::Inline(slots[..*len as usize].iter()),
                Store::Heap(vec) => Inner::Heap(vec.iter()),
            },
        }
    }

    /// Drops every child and returns storage to the inline block.
    pub(crate) fn clear(&mut self) {
        self.store = Store::Inline {
            slots: [None, None, None, None],
            len: 0,
        };
    }

    /// Promote or grow so one more batch of `extra` children fits.
    fn ensure_room(&mut self, extra: usize) {
        let needed = self.len() + extra;
        match &mut self.store {
            Store::Inline { .. } if needed <= INLINE_CAP => {}
            Store::Inline { slots, len } => {
                let mut vec = Vec::with_capacity(grow_target(needed));
                for slot in &mut slots[..*len as usize] {
                    if let Some(el) = slot.take() {
                        vec.push(el);
                    }
                }
                self.store = Store::Heap(vec);
            }
            Store::Heap(vec) => {
                if needed > vec.capacity() {
                    vec.reserve_exact(grow_target(needed) - vec.len());
                }
            }
        }
    }

    pub(crate) fn push(&mut self, child: Element) {
        self.ensure_room(1);
        match &mut self.store {
            Store::Inline { slots, len } => {
                slots[*len as usize] = Some(child);
                *len += 1;
            }
            Store::Heap(vec) => vec.push(child),
        }
    }

    fn insert_at(&mut self, i: usize, child: Element) {
        self.ensure_room(1);
        match &mut self.store {
            Store::Inline { slots, len } => {
                let n = *len as usize;
                for j in (i..n).rev() {
                    slots[j + 1] = slots[j].take();
                }
                slots[i] = Some(child);
                *len += 1;
            }
            Store::Heap(vec) => vec.insert(i, child),
        }
    }

    fn remove_at(&mut self, i: usize) -> Element {
        match &mut self.store {
            Store::Inline { slots, len } => {
                let n = *len as usize;
                let removed = slots[i].take();
                for j in i..n - 1 {
                    slots[j] = slots[j + 1].take();
                }
                *len -= 1;
                match removed {
                    Some(el) => el,
                    None => unreachable!("child index within length"),
                }
            }
            Store::Heap(vec) => vec.remove(i),
        }
    }

    fn replace_at(&mut self, i: usize, child: Element) -> Element {
        match &mut self.store {
            Store::Inline { slots, .. } => match slots[i].replace(child) {
                Some(old) => old,
                None => unreachable!("child index within length"),
            },
            Store::Heap(vec) => std::mem::replace(&mut vec[i], child),
        }
    }

    fn take_all(&mut self) -> Vec<Element> {
        match std::mem::replace(
            &mut self.store,
            Store::Inline {
                slots: [None, None, None, None],
                len: 0,
            },
        ) {
            Store::Inline { mut slots, len } => slots[..len as usize]
                .iter_mut()
                .filter_map(Option::take)
                .collect(),
            Store::Heap(vec) => vec,
        }
    }

    /// Put back what `take_all` handed out. A heap block stays a heap block
    /// with its allocation intact; only `clear` releases capacity.
    fn restore(&mut self, items: Vec<Element>, was_heap: bool) {
        let n = items.len();
        if was_heap {
            self.store = Store::Heap(items);
        } else if n <= INLINE_CAP {
            let mut slots = [None, None, None, None];
            for (i, el) in items.into_iter().enumerate() {
                slots[i] = Some(el);
            }
            self.store = Store::Inline {
                slots,
                len: n as u8,
            };
        } else {
            let mut vec = Vec::with_capacity(grow_target(n));
            vec.extend(items);
            self.store = Store::Heap(vec);
        }
    }

    /// Cheap handle copies of every child, in order.
    pub(crate) fn to_vec(&self) -> Vec<Element> {
        self.iter().cloned().collect()
    }

    fn normalize(&self, index: isize) -> Option<usize> {
        let len = self.len() as isize;
        let i = if index < 0 { index + len } else { index };
        if i < 0 || i >= len {
            None
        } else {
            Some(i as usize)
        }
    }

    pub(crate) fn get_item(&self, index: isize) -> Result<Element, TreeError> {
        let i = self.normalize(index).ok_or(TreeError::IndexOutOfRange)?;
        Ok(self.at(i).clone())
    }

    /// Replace the child at `index`, returning the displaced one.
    pub(crate) fn set_item(&mut self, index: isize, child: Element) -> Result<Element, TreeError> {
        let i = self
            .normalize(index)
            .ok_or(TreeError::AssignIndexOutOfRange)?;
        Ok(self.replace_at(i, child))
    }

    pub(crate) fn delete_item(&mut self, index: isize) -> Result<Element, TreeError> {
        let i = self
            .normalize(index)
            .ok_or(TreeError::AssignIndexOutOfRange)?;
        Ok(self.remove_at(i))
    }

    /// Insert with clamping: out-of-bounds indices snap to the nearest end
    /// instead of failing.
    pub(crate) fn insert_clamped(&mut self, index: isize, child: Element) {
        let len = self.len() as isize;
        let mut i = index;
        if i < 0 {
            i += len;
            if i < 0 {
                i = 0;
            }
        }
        if i > len {
            i = len;
        }
        self.insert_at(i as usize, child);
    }

    pub(crate) fn get_slice(
        &self,
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
    ) -> Result<Vec<Element>, TreeError> {
        let (start, _stop, slicelen) = adjust_indices(self.len(), start, stop, step)?;
        let mut out = Vec::with_capacity(slicelen);
        let mut idx = start;
        for _ in 0..slicelen {
            out.push(self.at(idx as usize).clone());
            idx += step;
        }
        Ok(out)
    }

    pub(crate) fn set_slice(
        &mut self,
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
        new: &[Element],
    ) -> Result<(), TreeError> {
        let (start, stop, slicelen) = adjust_indices(self.len(), start, stop, step)?;
        if step == 1 {
            let stop = stop.max(start);
            let was_heap = matches!(self.store, Store::Heap(_));
            let mut items = self.take_all();
            items.splice(start as usize..stop as usize, new.iter().cloned());
            self.restore(items, was_heap);
            Ok(())
        } else {
            if new.len() != slicelen {
                return Err(TreeError::SliceSizeMismatch {
                    size: new.len(),
                    slice: slicelen,
                });
            }
            let mut idx = start;
            for el in new {
                self.replace_at(idx as usize, el.clone());
                idx += step;
            }
            Ok(())
        }
    }

    pub(crate) fn delete_slice(
        &mut self,
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
    ) -> Result<(), TreeError> {
        let (start, _stop, slicelen) = adjust_indices(self.len(), start, stop, step)?;
        if slicelen == 0 {
            return Ok(());
        }
        // Walk ascending regardless of the requested direction.
        let (first, astep) = if step < 0 {
            (start + (slicelen as isize - 1) * step, -step)
        } else {
            (start, step)
        };
        let last = first + (slicelen as isize - 1) * astep;
        let was_heap = matches!(self.store, Store::Heap(_));
        let mut items = self.take_all();
        let mut i: isize = 0;
        items.retain(|_| {
            let doomed = i >= first && i <= last && (i - first) % astep == 0;
            i += 1;
            !doomed
        });
        self.restore(items, was_heap);
        Ok(())
    }
}

pub(crate) struct Iter<'a> {
    inner: Inner<'a>,
}

enum Inner<'a> {
    Inline(std::slice::Iter<'a, Option<Element>>),
    Heap(std::slice::Iter<'a, Element>),
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<&'a Element> {
        match &mut self.inner {
            Inner::Inline(it) => it.next().and_then(Option::as_ref),
            Inner::Heap(it) => it.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            Inner::Inline(it) => it.size_hint(),
            Inner::Heap(it) => it.size_hint(),
        }
    }
}

/// Normalize slice bounds against `len` the way list slicing does, and
/// compute how many indices the slice selects.
fn adjust_indices(
    len: usize,
    start: Option<isize>,
    stop: Option<isize>,
    step: isize,
) -> Result<(isize, isize, usize), TreeError> {
    if step == 0 {
        return Err(TreeError::ZeroStep);
    }
    let len = len as isize;

    let clamp = |i: isize| -> isize {
        let mut i = i;
        if i < 0 {
            i += len;
            if i < 0 {
                i = if step < 0 { -1 } else { 0 };
            }
        } else if i >= len {
            i = if step < 0 { len - 1 } else { len };
        }
        i
    };

    let start = match start {
        Some(s) => clamp(s),
        None => {
            if step > 0 {
                0
            } else {
                len - 1
            }
        }
    };
    let stop = match stop {
        Some(s) => clamp(s),
        None => {
            if step > 0 {
                len
            } else {
                -1
            }
        }
    };

    let slicelen = if step > 0 {
        if stop > start {
            ((stop - start - 1) / step + 1) as usize
        } else {
            0
        }
    } else if start > stop {
        ((start - stop - 1) / (-step) + 1) as usize
    } else {
        0
    };

    Ok((start, stop, slicelen))
}
