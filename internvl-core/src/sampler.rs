#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{Error, Result, Tensor, D};
use rand::{
    distributions::{Distribution, WeightedIndex},
    SeedableRng,
};

/// Token sampler over a logits vector.
#[derive(Clone)]
pub struct Sampler {
    rng: rand::rngs::StdRng,
    temperature: Option<f64>,
    topk: usize,
    topp: f64,
}

impl Sampler {
    /// A `topk` of 0 disables top-k filtering.
    pub fn new(seed: u64, temperature: Option<f64>, topk: usize, topp: f64) -> Self {
        let temperature = if temperature.map_or(true, |v| v < 1e-7) {
            None
        } else {
            temperature
        };
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
            temperature,
            topk,
            topp,
        }
    }

    pub fn greedy() -> Self {
        Self::new(0, None, 0, 1.)
    }

    fn sample_argmax(&mut self, logits: &Tensor) -> Result<u32> {
        logits.argmax(D::Minus1)?.to_scalar::<u32>()
    }

    fn sample_multinomial(&mut self, probs: &[f32]) -> Result<u32> {
        let distr = WeightedIndex::new(probs).map_err(Error::wrap)?;
        let next_token = distr.sample(&mut self.rng);
        Ok(next_token as u32)
    }

    fn sample_topkp(&mut self, probs: &mut [f32]) -> Result<u32> {
        let mut argsort_indices = (0..probs.len()).collect::<Vec<_>>();

        // Sort by descending probability.
        argsort_indices.sort_unstable_by(|&i, &j| probs[j].total_cmp(&probs[i]));

        if self.topk > 0 {
            for (index, val) in argsort_indices.iter().enumerate() {
                if index >= self.topk {
                    probs[*val] = 0.0;
                }
            }
        }

        if self.topp <= 0.0 || self.topp >= 1.0 {
            return self.sample_multinomial(probs);
        }

        // Keep the smallest prefix whose mass reaches top-p.
        let top_p = self.topp as f32;
        let mut cumsum = 0.;
        for index in &argsort_indices {
            if cumsum >= top_p {
                probs[*index] = 0.0;
            } else {
                cumsum += probs[*index];
            }
        }

        self.sample_multinomial(probs)
    }

    /// Sample from a 1D logits tensor.
    ///
    /// If the temperature is `None`, argmax sampling is used. Otherwise the logits are scaled by
    /// it, softmaxed, then filtered by top-k and top-p. A `top-p` value `<= 0.0` or `>= 1.0`
    /// disables the top-p filter.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        match self.temperature {
            None => self.sample_argmax(logits),
            Some(temperature) => {
                let logits = (logits / temperature)?;
                let probs = candle_nn::ops::softmax_last_dim(&logits)?;
                let mut probs: Vec<f32> = probs.to_vec1()?;
                self.sample_topkp(&mut probs)
            }
        }
    }
}
