//! Fixed-capacity object pools addressed by typed indices.
use arrayvec::ArrayVec;
use core::{fmt, marker::PhantomData, ops};

use super::Init;

/// A typed index into a [`Pool`].
pub trait PoolId: Copy + PartialEq + fmt::Debug {
    fn from_index(i: usize) -> Self;
    fn index(self) -> usize;
}

/// Define an opaque object identifier type usable as [`PoolId`].
macro_rules! define_id {
    (
        $( #[$meta:meta] )*
        $vis:vis struct $Name:ident;
    ) => {
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $Name(usize);

        impl $Name {
            /// Get the zero-based index of the object.
            #[inline]
            pub const fn as_index(self) -> usize {
                self.0
            }
        }

        impl $crate::utils::pool::PoolId for $Name {
            #[inline]
            fn from_index(i: usize) -> Self {
                Self(i)
            }

            #[inline]
            fn index(self) -> usize {
                self.0
            }
        }

        impl core::fmt::Debug for $Name {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "{}({})", stringify!($Name), self.0)
            }
        }
    };
}

/// An append-only pool of `T`. Objects are never freed; this matches the
/// kernel's object model where everything lives until system reset.
pub struct Pool<Id, T, const N: usize> {
    items: ArrayVec<T, N>,
    _phantom: PhantomData<fn(Id) -> Id>,
}

impl<Id, T, const N: usize> Init for Pool<Id, T, N> {
    const INIT: Self = Self {
        items: ArrayVec::new_const(),
        _phantom: PhantomData,
    };
}

impl<Id: PoolId, T, const N: usize> Pool<Id, T, N> {
    /// Store `x` and return its identifier. Returns `x` back if the pool is
    /// full.
    pub fn allocate(&mut self, x: T) -> Result<Id, T> {
        let i = self.items.len();
        self.items.try_push(x).map_err(|e| e.element())?;
        Ok(Id::from_index(i))
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.items.get(id.index())
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.items.get_mut(id.index())
    }

    pub fn contains(&self, id: Id) -> bool {
        id.index() < self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> + '_ {
        self.items
            .iter()
            .enumerate()
            .map(|(i, x)| (Id::from_index(i), x))
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> {
        (0..self.items.len()).map(Id::from_index)
    }
}

impl<Id: PoolId, T, const N: usize> ops::Index<Id> for Pool<Id, T, N> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id) -> &Self::Output {
        &self.items[id.index()]
    }
}

impl<Id: PoolId, T, const N: usize> ops::IndexMut<Id> for Pool<Id, T, N> {
    #[inline]
    fn index_mut(&mut self, id: Id) -> &mut Self::Output {
        &mut self.items[id.index()]
    }
}

impl<Id: PoolId, T: fmt::Debug, const N: usize> fmt::Debug for Pool<Id, T, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
