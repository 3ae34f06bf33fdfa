#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::str::FromStr;

use candle_nn::Activation;
use serde::Deserialize;

use crate::serde_default_fn;

serde_default_fn!(f64, default_downsample_ratio, 0.5);
serde_default_fn!(i64, default_select_layer, -1);
serde_default_fn!(String, default_template, "internlm2-chat".to_string());
serde_default_fn!(usize, default_image_size, 448);
serde_default_fn!(usize, default_patch_size, 14);
serde_default_fn!(bool, default_qkv_bias, true);
serde_default_fn!(f64, default_vision_eps, 1e-6);
serde_default_fn!(f64, default_rms_norm_eps, 1e-6);
serde_default_fn!(f64, default_rope_theta, 10000.);
serde_default_fn!(usize, default_max_position_embeddings, 4096);
serde_default_fn!(Activation, default_hidden_act, Activation::Silu);

/// Top level `config.json` of an InternVL chat checkpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct InternVLChatConfig {
    pub vision_config: VisionConfig,
    pub llm_config: LlmConfig,
    #[serde(default = "default_downsample_ratio")]
    pub downsample_ratio: f64,
    #[serde(default = "default_select_layer")]
    pub select_layer: i64,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub ps_version: PixelShuffleVersion,
    pub force_image_size: Option<usize>,
}

impl InternVLChatConfig {
    pub fn image_size(&self) -> usize {
        self.force_image_size
            .unwrap_or(self.vision_config.image_size)
    }

    /// Tokens each tile contributes to the prompt after pixel shuffle.
    pub fn num_image_token(&self) -> usize {
        let grid = self.image_size() / self.vision_config.patch_size;
        ((grid * grid) as f64 * self.downsample_ratio * self.downsample_ratio) as usize
    }

    /// Spatial factor removed by the pixel shuffle, e.g. 2 for a ratio of 0.5.
    pub fn downsample_factor(&self) -> usize {
        (1. / self.downsample_ratio).round() as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelShuffleVersion {
    #[default]
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum NormType {
    #[serde(rename = "layer_norm")]
    LayerNorm,
    #[default]
    #[serde(rename = "rms_norm")]
    RmsNorm,
}

/// InternViT encoder settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,
    #[serde(default)]
    pub qk_normalization: bool,
    #[serde(default = "default_vision_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub norm_type: NormType,
}

impl VisionConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }
}

/// Rotary scaling block. Checkpoints name the kind either `type` or `rope_type`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RopeScaling {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub rope_type: Option<String>,
    pub factor: Option<f64>,
    pub low_freq_factor: Option<f64>,
    pub high_freq_factor: Option<f64>,
    pub original_max_position_embeddings: Option<usize>,
    pub short_factor: Option<Vec<f64>>,
    pub long_factor: Option<Vec<f64>>,
    pub short_mscale: Option<f64>,
    pub long_mscale: Option<f64>,
}

impl RopeScaling {
    pub fn scaling_type(&self) -> &str {
        self.rope_type
            .as_deref()
            .or(self.kind.as_deref())
            .unwrap_or("default")
    }
}

/// Language backbone settings. The field set is the union of the supported architectures;
/// fields a given backbone does not use are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    pub original_max_position_embeddings: Option<usize>,
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: Activation,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// InternLM2 attention bias.
    #[serde(default)]
    pub bias: bool,
    /// Llama attention bias.
    #[serde(default)]
    pub attention_bias: bool,
}

impl LlmConfig {
    pub fn architecture(&self) -> candle_core::Result<LlmArchitecture> {
        match self.architectures.first() {
            Some(arch) => arch.parse(),
            None => candle_core::bail!("`llm_config.architectures` is empty."),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmArchitecture {
    Qwen2,
    Llama,
    InternLM2,
    Phi3,
}

impl LlmArchitecture {
    /// Whether the q/k/v projections carry a bias.
    pub fn attention_bias(&self, cfg: &LlmConfig) -> bool {
        match self {
            Self::Qwen2 => true,
            Self::Llama => cfg.attention_bias,
            Self::InternLM2 => cfg.bias,
            Self::Phi3 => false,
        }
    }
}

impl FromStr for LlmArchitecture {
    type Err = candle_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Qwen2ForCausalLM" => Ok(Self::Qwen2),
            "LlamaForCausalLM" => Ok(Self::Llama),
            "InternLM2ForCausalLM" => Ok(Self::InternLM2),
            "Phi3ForCausalLM" => Ok(Self::Phi3),
            other => Err(candle_core::Error::Msg(format!(
                "Unsupported language backbone `{other}`, expected one of Qwen2ForCausalLM, LlamaForCausalLM, InternLM2ForCausalLM, Phi3ForCausalLM."
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{InternVLChatConfig, LlmArchitecture, NormType, PixelShuffleVersion};

    const INTERNVL2_8B: &str = r#"{
        "architectures": ["InternVLChatModel"],
        "downsample_ratio": 0.5,
        "force_image_size": 448,
        "max_dynamic_patch": 12,
        "ps_version": "v2",
        "select_layer": -1,
        "template": "internlm2-chat",
        "use_thumbnail": true,
        "llm_config": {
            "architectures": ["InternLM2ForCausalLM"],
            "bias": false,
            "hidden_act": "silu",
            "hidden_size": 4096,
            "intermediate_size": 14336,
            "max_position_embeddings": 32768,
            "num_attention_heads": 32,
            "num_hidden_layers": 32,
            "num_key_value_heads": 8,
            "rms_norm_eps": 1e-05,
            "rope_scaling": {"factor": 2.0, "type": "dynamic"},
            "rope_theta": 1000000,
            "vocab_size": 92553
        },
        "vision_config": {
            "hidden_size": 1024,
            "image_size": 448,
            "intermediate_size": 4096,
            "layer_norm_eps": 1e-06,
            "norm_type": "layer_norm",
            "num_attention_heads": 16,
            "num_hidden_layers": 24,
            "patch_size": 14,
            "qk_normalization": false,
            "qkv_bias": true
        }
    }"#;

    #[test]
    fn parses_checkpoint_config() {
        let cfg: InternVLChatConfig = serde_json::from_str(INTERNVL2_8B).unwrap();
        assert_eq!(cfg.num_image_token(), 256);
        assert_eq!(cfg.downsample_factor(), 2);
        assert_eq!(cfg.ps_version, PixelShuffleVersion::V2);
        assert_eq!(cfg.vision_config.norm_type, NormType::LayerNorm);
        assert_eq!(cfg.llm_config.architecture().unwrap(), LlmArchitecture::InternLM2);
        assert_eq!(cfg.llm_config.num_kv_heads(), 8);
        assert_eq!(cfg.llm_config.head_dim(), 128);
        assert_eq!(
            cfg.llm_config.rope_scaling.as_ref().unwrap().scaling_type(),
            "dynamic"
        );
    }

    #[test]
    fn defaults_apply() {
        let cfg: InternVLChatConfig = serde_json::from_str(
            r#"{
                "llm_config": {"architectures": ["Qwen2ForCausalLM"], "vocab_size": 10, "hidden_size": 8,
                               "intermediate_size": 16, "num_hidden_layers": 1, "num_attention_heads": 2},
                "vision_config": {"hidden_size": 8, "intermediate_size": 16, "num_attention_heads": 2,
                                  "num_hidden_layers": 1}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.select_layer, -1);
        assert_eq!(cfg.template, "internlm2-chat");
        assert_eq!(cfg.ps_version, PixelShuffleVersion::V1);
        assert_eq!(cfg.vision_config.norm_type, NormType::RmsNorm);
        assert!(cfg.vision_config.qkv_bias);
        assert_eq!(cfg.image_size(), 448);
        assert_eq!(cfg.llm_config.num_kv_heads(), 2);
        assert!(LlmArchitecture::Qwen2.attention_bias(&cfg.llm_config));
    }

    #[test]
    fn unknown_backbone() {
        assert!("MistralForCausalLM".parse::<LlmArchitecture>().is_err());
    }
}
