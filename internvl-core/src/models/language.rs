#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::Arc;

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Activation, Embedding, Linear, VarBuilder};
use candle_transformers::utils::repeat_kv;

use crate::{
    config::{LlmArchitecture, LlmConfig},
    layers::{causal_mask, RmsNorm, RotaryEmbedding},
};

/// Checkpoint tensor names, which differ between backbones.
struct WeightNames {
    embed_tokens: &'static str,
    lm_head: &'static str,
    attn: &'static str,
    o_proj: &'static str,
    mlp: &'static str,
    attn_norm: &'static str,
    mlp_norm: &'static str,
}

impl WeightNames {
    fn for_arch(arch: LlmArchitecture) -> Self {
        match arch {
            LlmArchitecture::InternLM2 => Self {
                embed_tokens: "tok_embeddings",
                lm_head: "output",
                attn: "attention",
                o_proj: "wo",
                mlp: "feed_forward",
                attn_norm: "attention_norm",
                mlp_norm: "ffn_norm",
            },
            LlmArchitecture::Qwen2 | LlmArchitecture::Llama | LlmArchitecture::Phi3 => Self {
                embed_tokens: "embed_tokens",
                lm_head: "lm_head",
                attn: "self_attn",
                o_proj: "o_proj",
                mlp: "mlp",
                attn_norm: "input_layernorm",
                mlp_norm: "post_attention_layernorm",
            },
        }
    }
}

#[derive(Debug, Clone)]
enum QkvProj {
    Separate { q: Linear, k: Linear, v: Linear },
    /// InternLM2 `wqkv`: for each kv head, its query heads, then one key and one value head.
    Grouped(Linear),
    /// Phi-3 `qkv_proj`: all query heads, then all key heads, then all value heads.
    Packed(Linear),
}

#[derive(Debug, Clone)]
struct Attention {
    qkv: QkvProj,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    num_kv_groups: usize,
    head_dim: usize,
    rotary_emb: Arc<RotaryEmbedding>,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn new(
        arch: LlmArchitecture,
        rotary_emb: Arc<RotaryEmbedding>,
        cfg: &LlmConfig,
        names: &WeightNames,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_kv_heads();
        let head_dim = cfg.head_dim();
        let bias = arch.attention_bias(cfg);
        let hidden = cfg.hidden_size;
        let qkv_size = (num_heads + 2 * num_kv_heads) * head_dim;
        let qkv = match arch {
            LlmArchitecture::InternLM2 => {
                QkvProj::Grouped(candle_nn::linear_b(hidden, qkv_size, bias, vb.pp("wqkv"))?)
            }
            LlmArchitecture::Phi3 => {
                QkvProj::Packed(candle_nn::linear_b(hidden, qkv_size, bias, vb.pp("qkv_proj"))?)
            }
            LlmArchitecture::Qwen2 | LlmArchitecture::Llama => QkvProj::Separate {
                q: candle_nn::linear_b(hidden, num_heads * head_dim, bias, vb.pp("q_proj"))?,
                k: candle_nn::linear_b(hidden, num_kv_heads * head_dim, bias, vb.pp("k_proj"))?,
                v: candle_nn::linear_b(hidden, num_kv_heads * head_dim, bias, vb.pp("v_proj"))?,
            },
        };
        let o_bias = match arch {
            LlmArchitecture::InternLM2 | LlmArchitecture::Llama => bias,
            LlmArchitecture::Qwen2 | LlmArchitecture::Phi3 => false,
        };
        let o_proj =
            candle_nn::linear_b(num_heads * head_dim, hidden, o_bias, vb.pp(names.o_proj))?;
        Ok(Self {
            qkv,
            o_proj,
            num_heads,
            num_kv_heads,
            num_kv_groups: num_heads / num_kv_heads,
            head_dim,
            rotary_emb,
            kv_cache: None,
        })
    }

    /// Returns q, k, v as (b, heads, seq_len, head_dim).
    fn project(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b_sz, q_len, _) = xs.dims3()?;
        let (q, k, v) = match &self.qkv {
            QkvProj::Separate { q, k, v } => (
                q.forward(xs)?
                    .reshape((b_sz, q_len, self.num_heads, self.head_dim))?,
                k.forward(xs)?
                    .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?,
                v.forward(xs)?
                    .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?,
            ),
            QkvProj::Grouped(wqkv) => {
                let groups = self.num_kv_groups;
                let qkv = wqkv.forward(xs)?.reshape((
                    b_sz,
                    q_len,
                    self.num_kv_heads,
                    groups + 2,
                    self.head_dim,
                ))?;
                (
                    qkv.narrow(3, 0, groups)?
                        .reshape((b_sz, q_len, self.num_heads, self.head_dim))?,
                    qkv.narrow(3, groups, 1)?.squeeze(3)?,
                    qkv.narrow(3, groups + 1, 1)?.squeeze(3)?,
                )
            }
            QkvProj::Packed(qkv_proj) => {
                let qkv = qkv_proj.forward(xs)?;
                let query_pos = self.num_heads * self.head_dim;
                let kv_size = self.num_kv_heads * self.head_dim;
                (
                    qkv.narrow(D::Minus1, 0, query_pos)?
                        .reshape((b_sz, q_len, self.num_heads, self.head_dim))?,
                    qkv.narrow(D::Minus1, query_pos, kv_size)?
                        .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?,
                    qkv.narrow(D::Minus1, query_pos + kv_size, kv_size)?
                        .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?,
                )
            }
        };
        Ok((
            q.transpose(1, 2)?.contiguous()?,
            k.transpose(1, 2)?.contiguous()?,
            v.transpose(1, 2)?.contiguous()?,
        ))
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
    ) -> Result<Tensor> {
        let (b_sz, q_len, _) = xs.dims3()?;
        let (q, k, v) = self.project(xs)?;
        let (q, k) = self.rotary_emb.forward(&q, &k, seqlen_offset)?;

        let (k, v) = match &self.kv_cache {
            None => (k, v),
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let k = repeat_kv(k, self.num_kv_groups)?.contiguous()?;
        let v = repeat_kv(v, self.num_kv_groups)?.contiguous()?;

        let dtype = q.dtype();
        let (q, k, v) = (
            q.to_dtype(DType::F32)?,
            k.to_dtype(DType::F32)?,
            v.to_dtype(DType::F32)?,
        );
        let scale = 1f64 / f64::sqrt(self.head_dim as f64);
        let attn_weights = (q.matmul(&k.t()?)? * scale)?;
        let attn_weights = match attention_mask {
            None => attn_weights,
            Some(mask) => attn_weights.broadcast_add(mask)?,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        attn_weights
            .matmul(&v)?
            .to_dtype(dtype)?
            .transpose(1, 2)?
            .reshape((b_sz, q_len, ()))?
            .apply(&self.o_proj)
    }
}

#[derive(Debug, Clone)]
enum Mlp {
    Split {
        gate: Linear,
        up: Linear,
        down: Linear,
        act_fn: Activation,
    },
    /// Phi-3 `gate_up_proj`: gate rows, then up rows.
    Packed {
        gate_up: Linear,
        down: Linear,
        act_fn: Activation,
        i_size: usize,
    },
}

impl Mlp {
    fn new(arch: LlmArchitecture, cfg: &LlmConfig, vb: VarBuilder) -> Result<Self> {
        let (h, i) = (cfg.hidden_size, cfg.intermediate_size);
        let act_fn = cfg.hidden_act;
        Ok(match arch {
            LlmArchitecture::InternLM2 => Self::Split {
                gate: candle_nn::linear_no_bias(h, i, vb.pp("w1"))?,
                up: candle_nn::linear_no_bias(h, i, vb.pp("w3"))?,
                down: candle_nn::linear_no_bias(i, h, vb.pp("w2"))?,
                act_fn,
            },
            LlmArchitecture::Phi3 => Self::Packed {
                gate_up: candle_nn::linear_no_bias(h, 2 * i, vb.pp("gate_up_proj"))?,
                down: candle_nn::linear_no_bias(i, h, vb.pp("down_proj"))?,
                act_fn,
                i_size: i,
            },
            LlmArchitecture::Qwen2 | LlmArchitecture::Llama => Self::Split {
                gate: candle_nn::linear_no_bias(h, i, vb.pp("gate_proj"))?,
                up: candle_nn::linear_no_bias(h, i, vb.pp("up_proj"))?,
                down: candle_nn::linear_no_bias(i, h, vb.pp("down_proj"))?,
                act_fn,
            },
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Split {
                gate,
                up,
                down,
                act_fn,
            } => {
                let lhs = xs.apply(gate)?.apply(act_fn)?;
                let rhs = xs.apply(up)?;
                (lhs * rhs)?.apply(down)
            }
            Self::Packed {
                gate_up,
                down,
                act_fn,
                i_size,
            } => {
                let up_states = xs.apply(gate_up)?;
                let gate = up_states.narrow(D::Minus1, 0, *i_size)?;
                let up_states = up_states.narrow(D::Minus1, *i_size, *i_size)?;
                (up_states * gate.apply(act_fn)?)?.apply(down)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    attn: Attention,
    mlp: Mlp,
    attn_norm: RmsNorm,
    mlp_norm: RmsNorm,
}

impl DecoderLayer {
    fn new(
        arch: LlmArchitecture,
        rotary_emb: Arc<RotaryEmbedding>,
        cfg: &LlmConfig,
        names: &WeightNames,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            attn: Attention::new(arch, rotary_emb, cfg, names, vb.pp(names.attn))?,
            mlp: Mlp::new(arch, cfg, vb.pp(names.mlp))?,
            attn_norm: RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp(names.attn_norm))?,
            mlp_norm: RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp(names.mlp_norm))?,
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.attn_norm.forward(xs)?;
        let xs = self.attn.forward(&xs, attention_mask, seqlen_offset)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = xs.apply(&self.mlp_norm)?.apply(&self.mlp)?;
        residual + xs
    }
}

/// Decoder-only language backbone driven by input embeddings, so image features can be
/// spliced in before the first step.
#[derive(Debug, Clone)]
pub struct LanguageModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    device: Device,
    arch: LlmArchitecture,
}

impl LanguageModel {
    pub fn new(cfg: &LlmConfig, vb: VarBuilder) -> Result<Self> {
        let arch = cfg.architecture()?;
        let names = WeightNames::for_arch(arch);
        let vb_m = vb.pp("model");
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp(names.embed_tokens))?;
        let rotary_emb = Arc::new(RotaryEmbedding::new(cfg, vb.dtype(), vb.device())?);
        let vb_l = vb_m.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|layer_idx| {
                DecoderLayer::new(arch, rotary_emb.clone(), cfg, &names, vb_l.pp(layer_idx))
            })
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;
        let lm_head_weight = format!("{}.weight", names.lm_head);
        let lm_head = if !cfg.tie_word_embeddings && vb.contains_tensor(&lm_head_weight) {
            candle_nn::linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp(names.lm_head))?
        } else {
            Linear::new(embed_tokens.embeddings().clone(), None)
        };
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            device: vb.device().clone(),
            arch,
        })
    }

    pub fn architecture(&self) -> LlmArchitecture {
        self.arch
    }

    /// (b, seq_len) token ids -> (b, seq_len, hidden_size)
    pub fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    /// Run the decoder over `input_embeds` placed at `seqlen_offset` and return the F32 logits
    /// of the last position, shape (b, vocab_size).
    pub fn forward_embeds(
        &mut self,
        input_embeds: &Tensor,
        seqlen_offset: usize,
    ) -> Result<Tensor> {
        let (_b_sz, seq_len, _) = input_embeds.dims3()?;
        let mask = causal_mask(seq_len, seqlen_offset, &self.device)?;
        let mut xs = input_embeds.clone();
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, mask.as_ref(), seqlen_offset)?;
        }
        xs.narrow(1, seq_len - 1, 1)?
            .squeeze(1)?
            .apply(&self.norm)?
            .apply(&self.lm_head)?
            .to_dtype(DType::F32)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.attn.kv_cache = None;
        }
    }
}
