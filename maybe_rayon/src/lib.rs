//! Feature-gated wrapper around rayon.
//!
//! With the `parallel` feature the traits below forward to rayon; without it
//! they fall back to the sequential iterators of `core`, so callers write the
//! same code either way.

#[cfg(not(feature = "parallel"))]
use core::slice::{self, ChunksMut};

#[cfg(feature = "parallel")]
pub use rayon::{
    self,
    prelude::{IndexedParallelIterator, ParallelIterator},
};
#[cfg(feature = "parallel")]
use rayon::slice::ChunksMut as ParChunksMut;

pub trait MaybeParIter<'data> {
    #[cfg(feature = "parallel")]
    type Item: Send + 'data;

    #[cfg(feature = "parallel")]
    type Iter: ParallelIterator<Item = Self::Item>;

    #[cfg(not(feature = "parallel"))]
    type Item;

    #[cfg(not(feature = "parallel"))]
    type Iter: Iterator<Item = Self::Item>;

    fn par_iter(&'data self) -> Self::Iter;
}

#[cfg(feature = "parallel")]
impl<'data, T> MaybeParIter<'data> for T
where
    T: ?Sized + rayon::iter::IntoParallelRefIterator<'data>,
{
    type Item = T::Item;
    type Iter = T::Iter;

    fn par_iter(&'data self) -> Self::Iter {
        rayon::iter::IntoParallelRefIterator::par_iter(self)
    }
}

#[cfg(not(feature = "parallel"))]
impl<'data, T: 'data> MaybeParIter<'data> for Vec<T> {
    type Item = &'data T;
    type Iter = slice::Iter<'data, T>;

    fn par_iter(&'data self) -> Self::Iter {
        self.iter()
    }
}

#[cfg(not(feature = "parallel"))]
impl<'data, T: 'data> MaybeParIter<'data> for [T] {
    type Item = &'data T;
    type Iter = slice::Iter<'data, T>;

    fn par_iter(&'data self) -> Self::Iter {
        self.iter()
    }
}

pub trait MaybeParChunksMut<T: Send> {
    #[cfg(feature = "parallel")]
    fn par_chunks_mut(&mut self, chunk_size: usize) -> ParChunksMut<'_, T>;

    #[cfg(not(feature = "parallel"))]
    fn par_chunks_mut(&mut self, chunk_size: usize) -> ChunksMut<'_, T>;
}

#[cfg(feature = "parallel")]
impl<T: ?Sized + rayon::slice::ParallelSliceMut<U>, U: Send> MaybeParChunksMut<U> for T {
    fn par_chunks_mut(&mut self, chunk_size: usize) -> ParChunksMut<'_, U> {
        rayon::slice::ParallelSliceMut::par_chunks_mut(self, chunk_size)
    }
}

#[cfg(not(feature = "parallel"))]
impl<T: Send> MaybeParChunksMut<T> for [T] {
    fn par_chunks_mut(&mut self, chunk_size: usize) -> ChunksMut<'_, T> {
        self.chunks_mut(chunk_size)
    }
}

/// `for_each` with a per-worker state built by `init`.
///
/// Under rayon, `init` runs once per split of the work, so every worker owns
/// its state exclusively. Sequentially, `init` runs exactly once.
pub trait MaybeParForEachInit: Sized {
    type Item;

    fn par_for_each_init<S, INIT, OP>(self, init: INIT, op: OP)
    where
        INIT: Fn() -> S + Sync + Send,
        OP: Fn(&mut S, Self::Item) + Sync + Send;
}

#[cfg(feature = "parallel")]
impl<I: ParallelIterator> MaybeParForEachInit for I {
    type Item = I::Item;

    fn par_for_each_init<S, INIT, OP>(self, init: INIT, op: OP)
    where
        INIT: Fn() -> S + Sync + Send,
        OP: Fn(&mut S, Self::Item) + Sync + Send,
    {
        ParallelIterator::for_each_init(self, init, op);
    }
}

#[cfg(not(feature = "parallel"))]
impl<I: Iterator> MaybeParForEachInit for I {
    type Item = I::Item;

    fn par_for_each_init<S, INIT, OP>(self, init: INIT, op: OP)
    where
        INIT: Fn() -> S + Sync + Send,
        OP: Fn(&mut S, Self::Item) + Sync + Send,
    {
        let mut state = init();
        for item in self {
            op(&mut state, item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_visited_once_with_private_state() {
        let mut values = vec![0usize; 64];
        values
            .par_chunks_mut(8)
            .enumerate()
            .par_for_each_init(Vec::<usize>::new, |scratch, (i, chunk)| {
                scratch.clear();
                scratch.extend((0..chunk.len()).map(|j| i * 8 + j));
                chunk.copy_from_slice(scratch);
            });
        assert_eq!(values, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn par_iter_preserves_order() {
        let values = vec![1u64, 2, 3, 4];
        let doubled: Vec<u64> = values.par_iter().map(|v| v * 2).collect();
        assert_eq!(doubled, vec![2, 4, 6, 8]);
    }
}
