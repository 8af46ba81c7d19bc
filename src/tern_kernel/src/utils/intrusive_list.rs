//! Intrusive circular doubly linked list whose elements live in a container
//! implementing `std::ops::Index`.
//!
//! Links are stored in `Cell`s inside the elements, so a list can be
//! manipulated through a shared reference to the pool while the head is
//! borrowed mutably. Structural inconsistency is a kernel bug and causes a
//! panic.
use core::{cell::Cell, fmt, ops};

use super::Init;

/// Circular linked list header.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// The link storage embedded in each element.
pub type LinkCell<Index> = Cell<Option<Link<Index>>>;

/// Accessor to a linked list made of `head` and the elements of `pool`.
pub struct ListAccessor<'a, Index, Pool: ?Sized, Element> {
    head: &'a mut ListHead<Index>,
    pool: &'a Pool,
    map_link: fn(&Element) -> &LinkCell<Index>,
}

impl<'a, Index, Pool, Element: 'a> ListAccessor<'a, Index, Pool, Element>
where
    Index: Copy + PartialEq + fmt::Debug,
    Pool: ?Sized + ops::Index<Index, Output = Element>,
{
    pub fn new(
        head: &'a mut ListHead<Index>,
        pool: &'a Pool,
        map_link: fn(&Element) -> &LinkCell<Index>,
    ) -> Self {
        Self {
            head,
            pool,
            map_link,
        }
    }

    #[inline]
    fn link_cell(&self, i: Index) -> &'a LinkCell<Index> {
        let pool: &'a Pool = self.pool;
        (self.map_link)(&pool[i])
    }

    #[inline]
    fn link(&self, i: Index) -> Link<Index> {
        self.link_cell(i)
            .get()
            .unwrap_or_else(|| panic!("{i:?} is expected to be linked"))
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    pub fn is_linked(&self, i: Index) -> bool {
        self.link_cell(i).get().is_some()
    }

    pub fn front(&self) -> Option<Index> {
        self.head.first
    }

    pub fn back(&self) -> Option<Index> {
        self.head.first.map(|first| self.link(first).prev)
    }

    pub fn front_data(&self) -> Option<&'a Element> {
        let pool = self.pool;
        self.front().map(|i| &pool[i])
    }

    /// Insert `item` before the position `at` (if `Some`) or to the back of
    /// the list (if `None`).
    ///
    /// Panics if `item` is already linked.
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        assert!(!self.is_linked(item), "{item:?} is already linked");

        if let Some(first) = self.head.first {
            let next = at.unwrap_or(first);
            let prev = self.link(next).prev;

            let mut prev_link = self.link(prev);
            prev_link.next = item;
            self.link_cell(prev).set(Some(prev_link));

            let mut next_link = self.link(next);
            next_link.prev = item;
            self.link_cell(next).set(Some(next_link));

            self.link_cell(item).set(Some(Link { prev, next }));

            if at == Some(first) {
                self.head.first = Some(item);
            }
        } else {
            debug_assert!(at.is_none());
            self.link_cell(item).set(Some(Link {
                prev: item,
                next: item,
            }));
            self.head.first = Some(item);
        }
    }

    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None)
    }

    pub fn push_front(&mut self, item: Index) {
        let at = self.front();
        self.insert(item, at)
    }

    /// Insert `item` after every element `e` for which `goes_before(item, e)`
    /// is `false`, i.e., as close to the back as the ordering permits. This
    /// keeps equal elements in insertion order.
    pub fn insert_sorted(&mut self, item: Index, goes_before: impl Fn(&Element, &Element) -> bool) {
        let pool = self.pool;
        let mut cursor = self.front();
        while let Some(i) = cursor {
            if goes_before(&pool[item], &pool[i]) {
                break;
            }
            cursor = self.next(i);
        }
        self.insert(item, cursor);
    }

    /// Remove `item` from the list. Returns `false` if it wasn't linked.
    pub fn remove(&mut self, item: Index) -> bool {
        let link = match self.link_cell(item).get() {
            Some(link) => link,
            None => return false,
        };

        if self.head.first == Some(item) {
            if link.next == item {
                // The list just became empty
                self.head.first = None;
                self.link_cell(item).set(None);
                return true;
            }
            self.head.first = Some(link.next);
        }

        let mut prev_link = self.link(link.prev);
        prev_link.next = link.next;
        self.link_cell(link.prev).set(Some(prev_link));

        let mut next_link = self.link(link.next);
        next_link.prev = link.prev;
        self.link_cell(link.next).set(Some(next_link));

        self.link_cell(item).set(None);
        true
    }

    pub fn pop_front(&mut self) -> Option<Index> {
        let first = self.front()?;
        self.remove(first);
        Some(first)
    }

    /// Get the element following `i`, or `None` if `i` is the last one.
    pub fn next(&self, i: Index) -> Option<Index> {
        let next = self.link(i).next;
        if Some(next) == self.head.first {
            None
        } else {
            Some(next)
        }
    }

    pub fn iter(&self) -> Iter<'_, 'a, Index, Pool, Element> {
        Iter {
            accessor: self,
            next: self.head.first,
        }
    }
}

/// An iterator over the indices of the elements of [`ListAccessor`].
pub struct Iter<'b, 'a, Index, Pool: ?Sized, Element> {
    accessor: &'b ListAccessor<'a, Index, Pool, Element>,
    next: Option<Index>,
}

impl<Index, Pool, Element> Iterator for Iter<'_, '_, Index, Pool, Element>
where
    Index: Copy + PartialEq + fmt::Debug,
    Pool: ?Sized + ops::Index<Index, Output = Element>,
{
    type Item = Index;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = self.accessor.next(cur);
        Some(cur)
    }
}
