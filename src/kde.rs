//! Product kernel density estimators over encoded configurations.
//!
//! Numerical dimensions live in `[0, 1]` and use Gaussian kernels;
//! categorical dimensions hold choice indices and use Aitchison-Aitken kernels.
use crate::{ErrorKind, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

const MAX_TRUNCATED_NORMAL_TRIALS: usize = 100;

/// Kind of one encoded dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// A numerical dimension scaled to `[0, 1]`.
    Continuous,

    /// A categorical dimension with the given number of choices.
    Categorical(usize),
}

/// Multivariate kernel density estimator.
#[derive(Debug, Clone)]
pub struct Kde {
    data: Vec<Vec<f64>>,
    kinds: Vec<VarKind>,
    bandwidths: Vec<f64>,
}
impl Kde {
    /// Fits an estimator to `data` using the normal reference rule for the bandwidths.
    ///
    /// Bandwidths are bounded from below by `min_bandwidth`.
    ///
    /// # Errors
    ///
    /// If `data` is empty or a row does not match `kinds` in length,
    /// an `ErrorKind::InvalidInput` error will be returned.
    pub fn fit(data: Vec<Vec<f64>>, kinds: &[VarKind], min_bandwidth: f64) -> Result<Self> {
        track_assert!(!data.is_empty(), ErrorKind::InvalidInput);
        for row in &data {
            track_assert_eq!(row.len(), kinds.len(), ErrorKind::InvalidInput);
        }

        let n = data.len() as f64;
        let factor = n.powf(-1.0 / (kinds.len() as f64 + 4.0));
        let bandwidths = kinds
            .iter()
            .enumerate()
            .map(|(d, kind)| {
                let mean = data.iter().map(|r| r[d]).sum::<f64>() / n;
                let var = data.iter().map(|r| (r[d] - mean).powi(2)).sum::<f64>() / n;
                let bw = (1.06 * var.sqrt() * factor).max(min_bandwidth);
                match *kind {
                    VarKind::Continuous => bw,
                    VarKind::Categorical(c) => bw.min(max_aitchison_aitken(c)),
                }
            })
            .collect();
        Ok(Self {
            data,
            kinds: kinds.to_vec(),
            bandwidths,
        })
    }

    /// Returns the bandwidth of each dimension.
    pub fn bandwidths(&self) -> &[f64] {
        &self.bandwidths
    }

    /// Returns the number of data points.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the estimator has no data points.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Evaluates the density at `x`.
    pub fn pdf(&self, x: &[f64]) -> f64 {
        let sum = self
            .data
            .iter()
            .map(|row| {
                row.iter()
                    .zip(x)
                    .zip(self.kinds.iter().zip(&self.bandwidths))
                    .map(|((&mu, &v), (&kind, &bw))| kernel(kind, bw, mu, v))
                    .product::<f64>()
            })
            .sum::<f64>();
        sum / self.data.len() as f64
    }

    /// Draws a point near a random data point.
    ///
    /// Numerical dimensions are perturbed with a Gaussian truncated to `[0, 1]`
    /// whose scale is the bandwidth multiplied by `bandwidth_factor`.
    /// Categorical dimensions keep the data point's choice with probability `1 - bw`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, bandwidth_factor: f64) -> Vec<f64> {
        let row = &self.data[rng.gen_range(0, self.data.len())];
        row.iter()
            .zip(self.kinds.iter().zip(&self.bandwidths))
            .map(|(&mu, (&kind, &bw))| match kind {
                VarKind::Continuous => truncated_normal(rng, mu, bw * bandwidth_factor),
                VarKind::Categorical(c) => {
                    if c <= 1 || rng.gen::<f64>() < 1.0 - bw {
                        mu
                    } else {
                        rng.gen_range(0, c) as f64
                    }
                }
            })
            .collect()
    }
}

fn max_aitchison_aitken(choices: usize) -> f64 {
    if choices <= 1 {
        0.0
    } else {
        (choices as f64 - 1.0) / choices as f64
    }
}

fn kernel(kind: VarKind, bw: f64, mu: f64, x: f64) -> f64 {
    match kind {
        VarKind::Continuous => {
            let z = (x - mu) / bw;
            (-0.5 * z * z).exp() / (bw * (2.0 * PI).sqrt())
        }
        VarKind::Categorical(c) => {
            if c <= 1 {
                1.0
            } else if (x - mu).abs() < 0.5 {
                1.0 - bw
            } else {
                bw / (c as f64 - 1.0)
            }
        }
    }
}

fn truncated_normal<R: Rng + ?Sized>(rng: &mut R, mu: f64, sd: f64) -> f64 {
    let normal = match Normal::new(mu, sd) {
        Ok(normal) => normal,
        Err(_) => return mu.max(0.0).min(1.0),
    };
    for _ in 0..MAX_TRUNCATED_NORMAL_TRIALS {
        let x = normal.sample(rng);
        if 0.0 <= x && x <= 1.0 {
            return x;
        }
    }
    mu.max(0.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use trackable::result::TestResult;

    #[test]
    fn density_is_higher_near_data() -> TestResult {
        let data = vec![vec![0.1, 0.0], vec![0.15, 0.0], vec![0.2, 0.0]];
        let kinds = [VarKind::Continuous, VarKind::Categorical(3)];
        let kde = track!(Kde::fit(data, &kinds, 1e-3))?;
        assert!(kde.pdf(&[0.15, 0.0]) > kde.pdf(&[0.9, 0.0]));
        assert!(kde.pdf(&[0.15, 0.0]) > kde.pdf(&[0.15, 2.0]));
        Ok(())
    }

    #[test]
    fn bandwidths_are_bounded() -> TestResult {
        let data = vec![vec![0.5, 1.0]; 4];
        let kinds = [VarKind::Continuous, VarKind::Categorical(2)];
        let kde = track!(Kde::fit(data, &kinds, 1e-3))?;
        assert_eq!(kde.bandwidths(), &[1e-3, 1e-3]);

        let data = vec![vec![0.0], vec![1.0]];
        let kde = track!(Kde::fit(data, &[VarKind::Categorical(2)], 1e-3))?;
        assert!(kde.bandwidths()[0] <= 0.5);
        Ok(())
    }

    #[test]
    fn samples_stay_in_domain() -> TestResult {
        let data = vec![vec![0.0, 1.0], vec![1.0, 2.0], vec![0.5, 0.0]];
        let kinds = [VarKind::Continuous, VarKind::Categorical(3)];
        let kde = track!(Kde::fit(data, &kinds, 1e-3))?;
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let x = kde.sample(&mut rng, 3.0);
            assert!(0.0 <= x[0] && x[0] <= 1.0);
            assert!(x[1] == 0.0 || x[1] == 1.0 || x[1] == 2.0);
        }
        Ok(())
    }

    #[test]
    fn empty_data_is_rejected() {
        assert!(Kde::fit(Vec::new(), &[VarKind::Continuous], 1e-3).is_err());
    }
}
