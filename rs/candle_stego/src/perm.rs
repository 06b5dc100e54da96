//! Negative pairing generator
//!
//! Produces derangements of batch indices so every image can be paired with a
//! different image of the same batch.

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::error::{Result, StegoError};

/// Random permutation of `0..size` with no fixed point.
///
/// Uses Sattolo's algorithm, which yields a single `size`-cycle: every index
/// moves, so `perm[i] != i` for all `i`. Not uniform over all derangements.
pub fn derangement<R: Rng + ?Sized>(size: usize, rng: &mut R) -> Result<Vec<usize>> {
    if size < 2 {
        return Err(StegoError::precondition(format!(
            "negative pairing needs a batch of at least 2 images, got {size}"
        )));
    }
    let mut perm: Vec<usize> = (0..size).collect();
    for i in (1..size).rev() {
        let j = rng.gen_range(0..i);
        perm.swap(i, j);
    }
    Ok(perm)
}

/// [`derangement`] as a `u32` index tensor for `index_select` along the batch axis.
pub fn derangement_tensor<R: Rng + ?Sized>(
    size: usize,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let perm: Vec<u32> = derangement(size, rng)?
        .into_iter()
        .map(|i| i as u32)
        .collect();
    Ok(Tensor::from_vec(perm, size, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_no_fixed_points() {
        let mut rng = StdRng::seed_from_u64(0);
        for size in 2..40 {
            for _ in 0..25 {
                let perm = derangement(size, &mut rng).unwrap();
                for (i, &p) in perm.iter().enumerate() {
                    assert_ne!(i, p, "fixed point at {} for size {}", i, size);
                }
            }
        }
    }

    #[test]
    fn test_is_permutation() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut perm = derangement(17, &mut rng).unwrap();
        perm.sort_unstable();
        assert_eq!(perm, (0..17).collect::<Vec<_>>());
    }

    #[test]
    fn test_batch_of_two_swaps() {
        let mut rng = StdRng::seed_from_u64(11);
        assert_eq!(derangement(2, &mut rng).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_small_batches_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            derangement(1, &mut rng),
            Err(StegoError::Precondition { .. })
        ));
        assert!(derangement(0, &mut rng).is_err());
    }

    #[test]
    fn test_successive_pairings_differ() {
        let mut rng = StdRng::seed_from_u64(5);
        let perms: Vec<Vec<usize>> = (0..8).map(|_| derangement(8, &mut rng).unwrap()).collect();
        assert!(perms.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_tensor_form() {
        let mut rng = StdRng::seed_from_u64(9);
        let t = derangement_tensor(5, &Device::Cpu, &mut rng).unwrap();
        let values: Vec<u32> = t.to_vec1().unwrap();
        assert_eq!(values.len(), 5);
        assert!(values.iter().enumerate().all(|(i, &p)| p as usize != i));
    }
}
