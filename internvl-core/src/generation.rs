use crate::sampler::Sampler;

/// Decoding settings for one chat turn.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: Option<f64>,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub seed: u64,
}

impl Default for GenerationConfig {
    /// Greedy decoding of up to 1024 tokens.
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            do_sample: false,
            temperature: None,
            top_k: None,
            top_p: None,
            seed: 299792458,
        }
    }
}

impl GenerationConfig {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Default::default()
        }
    }

    pub(crate) fn sampler(&self) -> Sampler {
        if !self.do_sample {
            return Sampler::greedy();
        }
        Sampler::new(
            self.seed,
            Some(self.temperature.unwrap_or(1.)),
            self.top_k.unwrap_or(0),
            self.top_p.unwrap_or(1.),
        )
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::GenerationConfig;

    #[test]
    fn default_is_greedy_1024() {
        let cfg = GenerationConfig::default();
        assert_eq!(cfg.max_new_tokens, 1024);
        assert!(!cfg.do_sample);
        let logits = Tensor::new(&[0f32, 5., 1.], &Device::Cpu).unwrap();
        assert_eq!(cfg.sampler().sample(&logits).unwrap(), 1);
    }

    #[test]
    fn sampling_uses_temperature() {
        let cfg = GenerationConfig {
            do_sample: true,
            temperature: Some(0.7),
            top_k: Some(1),
            ..GenerationConfig::greedy(8)
        };
        let logits = Tensor::new(&[0f32, 1., 4.], &Device::Cpu).unwrap();
        assert_eq!(cfg.sampler().sample(&logits).unwrap(), 2);
    }
}
