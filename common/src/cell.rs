//! Primitives for dealing with self-referential data.
//!
//! ELF and DWARF objects borrow from the bytes that back them (a memory-
//! mapped file, a `Vec<u8>`, or a decompressed section buffer), but Rust has
//! no built-in way to store an owner and a borrow of it in the same struct.
//! [`SelfCell`] works around this by coercing the dependent type's lifetime
//! down to the lifetime of the borrow at construction time, relying on the
//! owner's address never moving ([`StableDeref`]).

use std::ops::Deref;

pub use stable_deref_trait::StableDeref;

/// Downcasts a dependent type's lifetime bound to the lifetime of a borrow
/// of `self`.
///
/// Implement this for any type with a lifetime parameter that should be
/// storable inside a [`SelfCell`]: define `Ref` as `Self` with every
/// dependent lifetime set to `'slf`, and return `self`.
///
/// ```rust
/// use elfstack_common::AsSelf;
///
/// struct Frame<'a>(&'a str);
///
/// impl<'slf> AsSelf<'slf> for Frame<'_> {
///     type Ref = Frame<'slf>;
///
///     fn as_self(&'slf self) -> &Self::Ref {
///         self
///     }
/// }
/// ```
pub trait AsSelf<'slf> {
    /// `Self` with all dependent lifetimes downcast to `'slf`.
    type Ref: ?Sized;

    /// Returns `self` with its lifetime bound coerced to `'slf`.
    fn as_self(&'slf self) -> &Self::Ref;
}

impl AsSelf<'_> for u8 {
    type Ref = u8;

    fn as_self(&self) -> &Self::Ref {
        self
    }
}

impl AsSelf<'_> for str {
    type Ref = str;

    fn as_self(&self) -> &Self::Ref {
        self
    }
}

impl<'slf, T> AsSelf<'slf> for [T]
where
    T: AsSelf<'slf>,
    T::Ref: Sized,
{
    type Ref = [T::Ref];

    fn as_self(&'slf self) -> &Self::Ref {
        unsafe { &*(self as *const [T] as *const [T::Ref]) }
    }
}

impl<'slf, T> AsSelf<'slf> for &'slf T
where
    T: AsSelf<'slf> + ?Sized,
{
    type Ref = T::Ref;

    fn as_self(&'slf self) -> &Self::Ref {
        (*self).as_self()
    }
}

impl<'slf, T> AsSelf<'slf> for Vec<T>
where
    T: AsSelf<'slf>,
    T::Ref: Sized,
{
    type Ref = [T::Ref];

    fn as_self(&'slf self) -> &Self::Ref {
        (**self).as_self()
    }
}

impl<'slf, T> AsSelf<'slf> for std::sync::Arc<T>
where
    T: AsSelf<'slf>,
{
    type Ref = T::Ref;

    fn as_self(&'slf self) -> &Self::Ref {
        (**self).as_self()
    }
}

/// A derived object stored alongside the owner it borrows from.
///
/// **Safety note**: this builds on [`StableDeref`] and [`AsSelf`] to give
/// somewhat safe self-reference. Prefer restructuring around a borrow in an
/// outer scope where that is practical; reach for this only where the
/// derived object genuinely must be co-owned with its backing bytes (e.g. a
/// parsed DWARF unit borrowing from the section bytes of its `ElfObject`).
#[derive(Clone, Debug)]
pub struct SelfCell<O, D>
where
    O: StableDeref,
{
    owner: O,
    derived: D,
}

impl<'slf, O, T> SelfCell<O, T>
where
    O: StableDeref + 'slf,
    T: AsSelf<'slf>,
{
    /// Creates a new `SelfCell`.
    ///
    /// # Safety
    ///
    /// `derive` receives a raw pointer to the owned data. The borrow used to
    /// build the derived object must not escape the callback.
    #[inline]
    pub fn new<F>(owner: O, derive: F) -> Self
    where
        F: FnOnce(*const <O as Deref>::Target) -> T,
    {
        let derived = derive(owner.deref() as *const _);
        SelfCell { owner, derived }
    }

    /// Creates a new `SelfCell` that may fail to construct.
    ///
    /// # Safety
    ///
    /// Same constraint as [`SelfCell::new`].
    #[inline]
    pub fn try_new<E, F>(owner: O, derive: F) -> Result<Self, E>
    where
        F: FnOnce(*const <O as Deref>::Target) -> Result<T, E>,
    {
        let derived = derive(owner.deref() as *const _)?;
        Ok(SelfCell { owner, derived })
    }

    /// Returns a reference to the owner of this cell.
    #[inline(always)]
    pub fn owner(&self) -> &O {
        &self.owner
    }

    /// Returns a safe reference to the derived object.
    #[inline(always)]
    pub fn get(&'slf self) -> &'slf <T as AsSelf<'slf>>::Ref {
        self.derived.as_self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[derive(Debug, PartialEq)]
    struct Frame<'a>(&'a str);

    impl<'slf> AsSelf<'slf> for Frame<'_> {
        type Ref = Frame<'slf>;

        fn as_self(&'slf self) -> &Self::Ref {
            self
        }
    }

    #[test]
    fn test_new() {
        let cell = SelfCell::new(String::from("main+0x10"), |s| Frame(unsafe { &*s }));
        assert_eq!(cell.get().0, "main+0x10");
    }

    #[test]
    fn test_try_new_err() {
        #[derive(Debug)]
        struct Empty;

        fn parse(s: &str) -> Result<Frame<'_>, Empty> {
            if s.is_empty() {
                Err(Empty)
            } else {
                Ok(Frame(s))
            }
        }

        let ok = SelfCell::try_new(String::from("main"), |s| parse(unsafe { &*s }));
        ok.expect("non-empty string parses");

        let err = SelfCell::try_new(String::new(), |s| parse(unsafe { &*s }));
        err.expect_err("empty string should fail");
    }
}
