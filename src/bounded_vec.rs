use std::{
    ops::{Deref, DerefMut},
    slice,
};

/// Returned when pushing into a full `BoundedVec`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CapacityError {
    pub capacity: usize,
}

/// A list that never holds more than `N` items.
///
/// The trace records carry fixed capacity arrays together with a separate
/// "how many are used" count. Here the count *is* the length of the list,
/// so the two can never disagree.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BoundedVec<T, const N: usize> {
    items: Vec<T>,
}

impl<T, const N: usize> BoundedVec<T, N> {
    pub const CAPACITY: usize = N;

    pub fn new() -> BoundedVec<T, N> {
        BoundedVec { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) -> Result<(), CapacityError> {
        if self.items.len() == N {
            return Err(CapacityError { capacity: N });
        }
        self.items.push(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn clear(&mut self) {
        self.items.clear()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == N
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn iter_mut(&mut self) -> slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T: Clone, const N: usize> BoundedVec<T, N> {
    pub fn from_slice(items: &[T]) -> Result<BoundedVec<T, N>, CapacityError> {
        if items.len() > N {
            return Err(CapacityError { capacity: N });
        }
        Ok(BoundedVec {
            items: items.to_vec(),
        })
    }
}

impl<T, const N: usize> Default for BoundedVec<T, N> {
    fn default() -> Self {
        BoundedVec::new()
    }
}

impl<T, const N: usize> Deref for BoundedVec<T, N> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

/// Items can be modified in place; the length cannot.
impl<T, const N: usize> DerefMut for BoundedVec<T, N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.items
    }
}

impl<'a, T, const N: usize> IntoIterator for &'a BoundedVec<T, N> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_until_full() {
        let mut v = BoundedVec::<u8, 2>::new();
        assert!(v.push(1).is_ok());
        assert!(v.push(2).is_ok());
        assert!(v.is_full());
        assert_eq!(Err(CapacityError { capacity: 2 }), v.push(3));
        assert_eq!(&[1, 2], v.as_slice());
    }

    #[test]
    fn from_slice_respects_capacity() {
        assert!(BoundedVec::<u8, 3>::from_slice(&[1, 2, 3]).is_ok());
        assert!(BoundedVec::<u8, 3>::from_slice(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn pop_makes_room() {
        let mut v = BoundedVec::<u8, 1>::from_slice(&[7]).unwrap();
        assert_eq!(Some(7), v.pop());
        assert!(v.push(8).is_ok());
        assert_eq!(1, v.len());
    }

    #[test]
    fn index_mut_keeps_length() {
        let mut v = BoundedVec::<u8, 2>::from_slice(&[1, 2]).unwrap();
        v[0] = 5;
        v.sort();
        assert_eq!(&[2, 5], v.as_slice());
        assert!(v.is_full());
        assert!(v.push(9).is_err());
    }
}
