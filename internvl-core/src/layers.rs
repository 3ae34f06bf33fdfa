#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::f32::consts::PI;

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::VarBuilder;
use tracing::debug;

use crate::config::LlmConfig;

#[derive(Debug, Clone)]
pub struct RmsNorm {
    eps: f64,
    weight: Tensor,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let w = vb.get(size, "weight")?;
        Ok(Self { eps, weight: w })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        candle_nn::ops::rms_norm(&x.contiguous()?, &self.weight, self.eps as f32)
    }
}

/// Rotate-half RoPE with the scaling variants used by the supported backbones.
///
/// `su`/`longrope` checkpoints carry two tables; the long one is used once a sequence runs past
/// `original_max_position_embeddings`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    short_sin: Tensor,
    short_cos: Tensor,
    long: Option<(Tensor, Tensor)>,
    original_max_position_embeddings: usize,
}

fn default_inv_freq(head_dim: usize, base: f64) -> Vec<f32> {
    (0..head_dim)
        .step_by(2)
        .map(|i| 1f32 / base.powf(i as f64 / head_dim as f64) as f32)
        .collect()
}

/// Returns (sin, cos) of shape (max_seq_len, head_dim / 2).
fn sin_cos(
    inv_freq: Vec<f32>,
    max_seq_len: usize,
    mscale: f64,
    dtype: DType,
    dev: &Device,
) -> Result<(Tensor, Tensor)> {
    let inv_freq_len = inv_freq.len();
    let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), dev)?;
    let t = Tensor::arange(0u32, max_seq_len as u32, dev)?
        .to_dtype(DType::F32)?
        .reshape((max_seq_len, 1))?;
    let freqs = t.matmul(&inv_freq)?;
    let sin = (freqs.sin()? * mscale)?.to_dtype(dtype)?;
    let cos = (freqs.cos()? * mscale)?.to_dtype(dtype)?;
    Ok((sin, cos))
}

impl RotaryEmbedding {
    pub fn new(cfg: &LlmConfig, dtype: DType, dev: &Device) -> Result<Self> {
        let head_dim = cfg.head_dim();
        let max_seq_len = cfg.max_position_embeddings;
        let original_max_position_embeddings = cfg
            .original_max_position_embeddings
            .unwrap_or(cfg.max_position_embeddings);
        let inv_freq = default_inv_freq(head_dim, cfg.rope_theta);

        let Some(scaling) = &cfg.rope_scaling else {
            let (short_sin, short_cos) = sin_cos(inv_freq, max_seq_len, 1., dtype, dev)?;
            return Ok(Self {
                short_sin,
                short_cos,
                long: None,
                original_max_position_embeddings,
            });
        };

        let (short_sin, short_cos, long) = match scaling.scaling_type() {
            "default" => {
                let (sin, cos) = sin_cos(inv_freq, max_seq_len, 1., dtype, dev)?;
                (sin, cos, None)
            }
            // Dynamic NTK only changes the table past `max_position_embeddings`.
            "dynamic" => {
                debug!("Dynamic NTK RoPE scaling is applied as unscaled RoPE.");
                let (sin, cos) = sin_cos(inv_freq, max_seq_len, 1., dtype, dev)?;
                (sin, cos, None)
            }
            "linear" => {
                let factor = scaling.factor.unwrap_or(1.) as f32;
                let inv_freq = inv_freq.into_iter().map(|f| f / factor).collect();
                let (sin, cos) = sin_cos(inv_freq, max_seq_len, 1., dtype, dev)?;
                (sin, cos, None)
            }
            "llama3" => {
                let (Some(factor), Some(low_freq_factor), Some(high_freq_factor), Some(orig)) = (
                    scaling.factor,
                    scaling.low_freq_factor,
                    scaling.high_freq_factor,
                    scaling.original_max_position_embeddings,
                ) else {
                    candle_core::bail!(
                        "`llama3` RoPE scaling needs factor, low_freq_factor, high_freq_factor and original_max_position_embeddings."
                    );
                };
                let (factor, low, high) =
                    (factor as f32, low_freq_factor as f32, high_freq_factor as f32);
                let low_freq_wavelen = orig as f32 / low;
                let high_freq_wavelen = orig as f32 / high;
                let inv_freq = inv_freq
                    .into_iter()
                    .map(|freq| {
                        let wavelen = 2. * PI / freq;
                        if wavelen < high_freq_wavelen {
                            freq
                        } else if wavelen > low_freq_wavelen {
                            freq / factor
                        } else {
                            let smooth = (orig as f32 / wavelen - low) / (high - low);
                            (1. - smooth) * freq / factor + smooth * freq
                        }
                    })
                    .collect();
                let (sin, cos) = sin_cos(inv_freq, max_seq_len, 1., dtype, dev)?;
                (sin, cos, None)
            }
            "su" | "longrope" => {
                let (Some(short_factor), Some(long_factor)) =
                    (&scaling.short_factor, &scaling.long_factor)
                else {
                    candle_core::bail!(
                        "`su`/`longrope` RoPE scaling needs short and long factors."
                    );
                };
                for (name, factors) in [("short", short_factor), ("long", long_factor)] {
                    if factors.len() != head_dim / 2 {
                        candle_core::bail!(
                            "Misaligned length {}, expected {} for `su`/`longrope` {name} rescale factors",
                            factors.len(),
                            head_dim / 2
                        );
                    }
                }
                let scale = max_seq_len as f64 / original_max_position_embeddings as f64;
                let default_mscale = if scale <= 1. {
                    1.
                } else {
                    (1. + scale.ln() / (original_max_position_embeddings as f64).ln()).sqrt()
                };
                let rescaled = |factors: &[f64]| {
                    (0..head_dim)
                        .step_by(2)
                        .enumerate()
                        .map(|(k, i)| {
                            (1f64 / (factors[k] * cfg.rope_theta.powf(i as f64 / head_dim as f64)))
                                as f32
                        })
                        .collect::<Vec<_>>()
                };
                let (short_sin, short_cos) = sin_cos(
                    rescaled(short_factor),
                    max_seq_len,
                    scaling.short_mscale.unwrap_or(default_mscale),
                    dtype,
                    dev,
                )?;
                let long = sin_cos(
                    rescaled(long_factor),
                    max_seq_len,
                    scaling.long_mscale.unwrap_or(default_mscale),
                    dtype,
                    dev,
                )?;
                (short_sin, short_cos, Some(long))
            }
            other => candle_core::bail!("Unsupported RoPE scaling type `{other}`."),
        };

        Ok(Self {
            short_sin,
            short_cos,
            long,
            original_max_position_embeddings,
        })
    }

    /// `q` and `k` are (b, heads, seq_len, head_dim).
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        seqlen_offset: usize,
    ) -> Result<(Tensor, Tensor)> {
        let (_b_sz, _h, seq_len, _n_embd) = q.dims4()?;
        let (sin, cos) = match &self.long {
            Some((sin, cos)) if seqlen_offset + seq_len > self.original_max_position_embeddings => {
                (sin, cos)
            }
            _ => (&self.short_sin, &self.short_cos),
        };
        let cos = cos.narrow(0, seqlen_offset, seq_len)?;
        let sin = sin.narrow(0, seqlen_offset, seq_len)?;
        let q_embed = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q_embed, k_embed))
    }
}

/// Additive causal mask of shape (1, 1, tgt_len, tgt_len + seqlen_offset), or `None` for a
/// single query position.
pub fn causal_mask(
    tgt_len: usize,
    seqlen_offset: usize,
    device: &Device,
) -> Result<Option<Tensor>> {
    if tgt_len <= 1 {
        return Ok(None);
    }
    let mask: Vec<_> = (0..tgt_len)
        .flat_map(|i| (0..tgt_len).map(move |j| if i < j { f32::NEG_INFINITY } else { 0. }))
        .collect();
    let mask = Tensor::from_slice(&mask, (tgt_len, tgt_len), device)?;
    let mask = if seqlen_offset > 0 {
        let mask0 = Tensor::zeros((tgt_len, seqlen_offset), DType::F32, device)?;
        Tensor::cat(&[&mask0, &mask], D::Minus1)?
    } else {
        mask
    };
    Ok(Some(mask.reshape((1, 1, tgt_len, tgt_len + seqlen_offset))?))
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::{causal_mask, RotaryEmbedding};
    use crate::config::{LlmConfig, RopeScaling};

    fn llm_config(rope_scaling: Option<RopeScaling>) -> LlmConfig {
        serde_json::from_value::<LlmConfig>(serde_json::json!({
            "architectures": ["Phi3ForCausalLM"],
            "vocab_size": 16,
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "max_position_embeddings": 32,
            "original_max_position_embeddings": 8,
        }))
        .map(|mut cfg| {
            cfg.rope_scaling = rope_scaling;
            cfg
        })
        .unwrap()
    }

    #[test]
    fn mask_is_causal() {
        let mask = causal_mask(3, 2, &Device::Cpu).unwrap().unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 5]);
        let rows = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][..3], [0., 0., 0.]);
        assert!(rows[0][3].is_infinite());
        assert!(rows[2].iter().all(|v| *v == 0.));
        assert!(causal_mask(1, 7, &Device::Cpu).unwrap().is_none());
    }

    #[test]
    fn rope_at_position_zero_is_identity() {
        let rope = RotaryEmbedding::new(&llm_config(None), DType::F32, &Device::Cpu).unwrap();
        let q = Tensor::ones((1, 2, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let (q_embed, _) = rope.forward(&q, &q, 0).unwrap();
        let diff = (q_embed - &q).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn longrope_switches_tables() {
        let scaling = RopeScaling {
            kind: Some("longrope".to_string()),
            short_factor: Some(vec![1., 1.]),
            long_factor: Some(vec![4., 4.]),
            ..Default::default()
        };
        let rope =
            RotaryEmbedding::new(&llm_config(Some(scaling)), DType::F32, &Device::Cpu).unwrap();
        let q = Tensor::ones((1, 2, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let (short, _) = rope.forward(&q, &q, 4).unwrap();
        let (long, _) = rope.forward(&q, &q, 20).unwrap();
        assert_eq!(short.dims(), long.dims());

        let bad = RopeScaling {
            kind: Some("su".to_string()),
            short_factor: Some(vec![1.]),
            long_factor: Some(vec![1.]),
            ..Default::default()
        };
        assert!(RotaryEmbedding::new(&llm_config(Some(bad)), DType::F32, &Device::Cpu).is_err());
    }
}
