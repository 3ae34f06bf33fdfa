#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{layer_norm, Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};

use crate::{
    config::{NormType, VisionConfig},
    layers::RmsNorm,
};

#[derive(Debug, Clone)]
enum VisionNorm {
    LayerNorm(LayerNorm),
    RmsNorm(RmsNorm),
}

impl VisionNorm {
    fn new(cfg: &VisionConfig, size: usize, vb: VarBuilder) -> Result<Self> {
        match cfg.norm_type {
            NormType::LayerNorm => Ok(Self::LayerNorm(layer_norm(size, cfg.layer_norm_eps, vb)?)),
            NormType::RmsNorm => Ok(Self::RmsNorm(RmsNorm::new(size, cfg.layer_norm_eps, vb)?)),
        }
    }
}

impl Module for VisionNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::LayerNorm(ln) => ln.forward(xs),
            Self::RmsNorm(rms) => rms.forward(xs),
        }
    }
}

#[derive(Debug, Clone)]
struct Embeddings {
    class_embedding: Tensor,
    patch_embedding: Conv2d,
    position_embedding: Tensor,
    grid: usize,
}

impl Embeddings {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let class_embedding = vb.get((1, 1, cfg.hidden_size), "class_embedding")?;
        let patch_embedding = candle_nn::conv2d(
            3,
            cfg.hidden_size,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                ..Default::default()
            },
            vb.pp("patch_embedding"),
        )?;
        let position_embedding =
            vb.get((1, cfg.num_patches() + 1, cfg.hidden_size), "position_embedding")?;
        Ok(Self {
            class_embedding,
            patch_embedding,
            position_embedding,
            grid: cfg.image_size / cfg.patch_size,
        })
    }
}

impl Module for Embeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let patch_embeds = self.patch_embedding.forward(pixel_values)?;
        let (b, c, h, w) = patch_embeds.dims4()?;
        if h != self.grid || w != self.grid {
            candle_core::bail!(
                "Expected a {0}x{0} patch grid, got {h}x{w}. Tiles must be resized to the encoder's image size.",
                self.grid
            );
        }
        let patch_embeds = patch_embeds.flatten_from(2)?.transpose(1, 2)?;
        let class_embeds = self.class_embedding.expand((b, 1, c))?;
        Tensor::cat(&[&class_embeds, &patch_embeds], 1)?.broadcast_add(&self.position_embedding)
    }
}

#[derive(Debug, Clone)]
struct Attention {
    qkv: Linear,
    proj: Linear,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let embed_dim = cfg.hidden_size;
        let qkv = candle_nn::linear_b(embed_dim, 3 * embed_dim, cfg.qkv_bias, vb.pp("qkv"))?;
        let proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("proj"))?;
        // The norms see all heads at once.
        let (q_norm, k_norm) = if cfg.qk_normalization {
            (
                Some(RmsNorm::new(embed_dim, cfg.layer_norm_eps, vb.pp("q_norm"))?),
                Some(RmsNorm::new(embed_dim, cfg.layer_norm_eps, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            qkv,
            proj,
            q_norm,
            k_norm,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
            scale: 1. / (cfg.head_dim() as f64).sqrt(),
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let qkv = self.qkv.forward(xs)?;
        let mut q = qkv.narrow(2, 0, c)?;
        let mut k = qkv.narrow(2, c, c)?;
        let v = qkv.narrow(2, 2 * c, c)?;
        if let Some(q_norm) = &self.q_norm {
            q = q_norm.forward(&q)?;
        }
        if let Some(k_norm) = &self.k_norm {
            k = k_norm.forward(&k)?;
        }
        let heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((b, n, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?
                .to_dtype(DType::F32)
        };
        let (q, k, v) = (heads(q)?, heads(k)?, heads(v)?);

        let attn = (q.matmul(&k.t()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        attn.matmul(&v)?
            .to_dtype(xs.dtype())?
            .transpose(1, 2)?
            .reshape((b, n, c))?
            .apply(&self.proj)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?,
            fc2: candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?.gelu_erf()?.apply(&self.fc2)
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    norm1: VisionNorm,
    attn: Attention,
    norm2: VisionNorm,
    mlp: Mlp,
    ls1: Tensor,
    ls2: Tensor,
}

impl EncoderLayer {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: VisionNorm::new(cfg, cfg.hidden_size, vb.pp("norm1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            norm2: VisionNorm::new(cfg, cfg.hidden_size, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            ls1: vb.get(cfg.hidden_size, "ls1")?,
            ls2: vb.get(cfg.hidden_size, "ls2")?,
        })
    }
}

impl Module for EncoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self
            .attn
            .forward(&self.norm1.forward(xs)?)?
            .broadcast_mul(&self.ls1)?;
        let xs = (residual + xs)?;
        let residual = &xs;
        let mlp_out = self
            .mlp
            .forward(&self.norm2.forward(&xs)?)?
            .broadcast_mul(&self.ls2)?;
        residual + mlp_out
    }
}

/// InternViT encoder. Only the layers up to the selected hidden state are loaded.
#[derive(Debug, Clone)]
pub struct InternVisionModel {
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
}

impl InternVisionModel {
    /// `select_layer` indexes the hidden states `[embeddings, layer_1, .., layer_n]`; negative
    /// values count from the end.
    pub fn new(cfg: &VisionConfig, select_layer: i64, vb: VarBuilder) -> Result<Self> {
        let depth = Self::depth_for(cfg.num_hidden_layers, select_layer)?;
        let embeddings = Embeddings::new(cfg, vb.pp("embeddings"))?;
        let vb_l = vb.pp("encoder").pp("layers");
        let layers = (0..depth)
            .map(|i| EncoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { embeddings, layers })
    }

    /// Number of encoder layers run to reach the selected hidden state.
    pub(crate) fn depth_for(num_hidden_layers: usize, select_layer: i64) -> Result<usize> {
        let num_states = num_hidden_layers as i64 + 1;
        let idx = if select_layer < 0 {
            num_states + select_layer
        } else {
            select_layer
        };
        if !(0..num_states).contains(&idx) {
            candle_core::bail!(
                "select_layer {select_layer} is out of range for {num_hidden_layers} encoder layers"
            );
        }
        Ok(idx as usize)
    }
}

impl Module for InternVisionModel {
    /// (b, 3, h, w) -> (b, 1 + num_patches, hidden_size)
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut xs = self.embeddings.forward(pixel_values)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Module, Tensor};
    use candle_nn::VarBuilder;

    use super::InternVisionModel;
    use crate::config::VisionConfig;

    fn config(norm_type: &str, qk_normalization: bool) -> VisionConfig {
        serde_json::from_value(serde_json::json!({
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_attention_heads": 2,
            "num_hidden_layers": 3,
            "image_size": 28,
            "patch_size": 14,
            "norm_type": norm_type,
            "qk_normalization": qk_normalization,
        }))
        .unwrap()
    }

    #[test]
    fn select_layer_depth() {
        assert_eq!(InternVisionModel::depth_for(24, -1).unwrap(), 24);
        assert_eq!(InternVisionModel::depth_for(24, -4).unwrap(), 21);
        assert_eq!(InternVisionModel::depth_for(24, 0).unwrap(), 0);
        assert!(InternVisionModel::depth_for(24, 25).is_err());
        assert!(InternVisionModel::depth_for(24, -26).is_err());
    }

    #[test]
    fn forward_shapes() {
        let dev = Device::Cpu;
        for (norm, qk) in [("layer_norm", false), ("rms_norm", true)] {
            let vb = VarBuilder::zeros(DType::F32, &dev);
            let model = InternVisionModel::new(&config(norm, qk), -1, vb).unwrap();
            let pixels = Tensor::zeros((2, 3, 28, 28), DType::F32, &dev).unwrap();
            let out = model.forward(&pixels).unwrap();
            assert_eq!(out.dims(), &[2, 5, 8]);
        }
    }

    #[test]
    fn rejects_wrong_tile_size() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let model = InternVisionModel::new(&config("layer_norm", false), -1, vb).unwrap();
        let pixels = Tensor::zeros((1, 3, 42, 42), DType::F32, &dev).unwrap();
        assert!(model.forward(&pixels).is_err());
    }
}
