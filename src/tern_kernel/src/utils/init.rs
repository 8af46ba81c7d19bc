/// A constant initial value, i.e., a `const` counterpart of `Default`.
///
/// The kernel state of each kernel trait type is a single `static` built
/// from these, so every state component implements it.
pub trait Init {
    const INIT: Self;
}

// The containers that kernel state is made of

impl<T, const N: usize> Init for arrayvec::ArrayVec<T, N> {
    const INIT: Self = Self::new_const();
}

impl<T: Init, Keyhole: Init> Init for tokenlock::UnsyncTokenLock<T, Keyhole> {
    const INIT: Self = Self::new(Keyhole::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}
