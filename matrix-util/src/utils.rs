use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// Draw `nsub` of `ntot` indexes uniformly without replacement
/// * `ntot` - number of total samples
/// * `nsub` - size of the subset (capped at `ntot`)
/// * `seed` - random seed
/// # Returns
/// sorted indexes of the subset
pub fn sample_subset(ntot: usize, nsub: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut idx = (0..ntot).collect::<Vec<_>>();
    if nsub < ntot {
        idx.shuffle(&mut rng);
        idx.truncate(nsub);
        idx.sort_unstable();
    }
    idx
}

/// `num` values evenly spaced on a log10 scale between `10^lb` and `10^ub`
pub fn logspace(lb: f64, ub: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![10_f64.powf(lb)],
        _ => {
            let step = (ub - lb) / (num - 1) as f64;
            (0..num)
                .map(|i| 10_f64.powf(lb + step * i as f64))
                .collect()
        }
    }
}
