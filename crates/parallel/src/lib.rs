//! Parallel-or-sequential iteration helpers for the ensemble engine.
//!
//! Tree growing and multi-model scoring are independent per item, so they can
//! fan out over rayon. Whether they do is decided in two places only: the
//! `parallel` cargo feature, and a `force_sequential` flag at each call site.
//! Keeping the `cfg` split here means callers never write it themselves.
//!
//! # Example
//!
//! ```ignore
//! // Grow 100 trees, each from its own seed.
//! let trees = parallel::map_indices(100, |t| grow_tree(seed + t as u64), false);
//!
//! // Score requests on the calling thread only.
//! let probs = parallel::map_slice(&models, |m| m.predict_proba(&x), true);
//! ```
//!
//! Results always come back in input order, whichever path runs.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Map `f` over a slice.
///
/// # Parameters
/// - `force_sequential`: run on the calling thread even when the `parallel` feature is on
#[inline]
pub fn map_slice<T, F, R>(slice: &[T], f: F, force_sequential: bool) -> Vec<R>
where
    T: Sync,
    F: Fn(&T) -> R + Sync + Send,
    R: Send,
{
    #[cfg(feature = "parallel")]
    {
        if force_sequential {
            slice.iter().map(f).collect()
        } else {
            slice.par_iter().map(f).collect()
        }
    }

    #[cfg(not(feature = "parallel"))]
    {
        let _ = force_sequential;
        slice.iter().map(f).collect()
    }
}

/// Map `f` over `0..n`.
///
/// Used where each work item is identified only by its position, e.g. the
/// tree index that seeds a tree's RNG.
///
/// # Parameters
/// - `force_sequential`: run on the calling thread even when the `parallel` feature is on
#[inline]
pub fn map_indices<F, R>(n: usize, f: F, force_sequential: bool) -> Vec<R>
where
    F: Fn(usize) -> R + Sync + Send,
    R: Send,
{
    #[cfg(feature = "parallel")]
    {
        if force_sequential {
            (0..n).map(f).collect()
        } else {
            (0..n).into_par_iter().map(f).collect()
        }
    }

    #[cfg(not(feature = "parallel"))]
    {
        let _ = force_sequential;
        (0..n).map(f).collect()
    }
}

/// Map a fallible `f` over `0..n`, stopping at the first error.
///
/// # Parameters
/// - `force_sequential`: run on the calling thread even when the `parallel` feature is on
#[inline]
pub fn try_map_indices<F, R, E>(n: usize, f: F, force_sequential: bool) -> Result<Vec<R>, E>
where
    F: Fn(usize) -> Result<R, E> + Sync + Send,
    R: Send,
    E: Send,
{
    #[cfg(feature = "parallel")]
    {
        if force_sequential {
            (0..n).map(f).collect()
        } else {
            (0..n).into_par_iter().map(f).collect()
        }
    }

    #[cfg(not(feature = "parallel"))]
    {
        let _ = force_sequential;
        (0..n).map(f).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_slice_preserves_order() {
        let items: Vec<u64> = (0..1000).collect();
        let par = map_slice(&items, |x| x * 2, false);
        let seq = map_slice(&items, |x| x * 2, true);
        assert_eq!(par, seq);
        assert_eq!(par[999], 1998);
    }

    #[test]
    fn test_map_indices_preserves_order() {
        let out = map_indices(64, |i| i * i, false);
        assert_eq!(out, (0..64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_try_map_indices_propagates_error() {
        let ok: Result<Vec<usize>, String> = try_map_indices(10, Ok, false);
        assert_eq!(ok.unwrap().len(), 10);

        let err: Result<Vec<usize>, String> = try_map_indices(
            10,
            |i| if i == 7 { Err(format!("bad {i}")) } else { Ok(i) },
            true,
        );
        assert_eq!(err.unwrap_err(), "bad 7");
    }

    #[test]
    fn test_empty_inputs() {
        let empty: Vec<u8> = Vec::new();
        assert!(map_slice(&empty, |x| *x, false).is_empty());
        assert!(map_indices(0, |i| i, false).is_empty());
    }
}
