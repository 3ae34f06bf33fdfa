use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::tokenizer::TokenizerFamily;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModelSizeError {
    #[error("Unsupported model size `{0}`, expected one of 1B, 2B, 4B, 8B, 26B, 40B, 76B.")]
    Unsupported(String),
}

/// Parameter scale of an InternVL2 checkpoint. Selects the tokenizer family and the added
/// token table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelSize {
    B1,
    B2,
    B4,
    B8,
    B26,
    B40,
    B76,
}

impl ModelSize {
    pub const ALL: [ModelSize; 7] = [
        ModelSize::B1,
        ModelSize::B2,
        ModelSize::B4,
        ModelSize::B8,
        ModelSize::B26,
        ModelSize::B40,
        ModelSize::B76,
    ];

    /// The size tag is the last `-` separated component of the checkpoint path, e.g.
    /// `OpenGVLab/InternVL2-8B` is `8B`. No other normalization is applied.
    pub fn from_model_path(model_path: &str) -> Result<Self, ModelSizeError> {
        let tag = model_path.rsplit('-').next().unwrap_or(model_path);
        tag.parse()
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::B1 => "1B",
            Self::B2 => "2B",
            Self::B4 => "4B",
            Self::B8 => "8B",
            Self::B26 => "26B",
            Self::B40 => "40B",
            Self::B76 => "76B",
        }
    }

    pub fn tokenizer_family(&self) -> TokenizerFamily {
        match self {
            Self::B1 => TokenizerFamily::Qwen2,
            Self::B2 | Self::B8 | Self::B26 => TokenizerFamily::InternLM2,
            Self::B4 | Self::B40 => TokenizerFamily::Llama,
            Self::B76 => TokenizerFamily::Llama3,
        }
    }
}

impl FromStr for ModelSize {
    type Err = ModelSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1B" => Ok(Self::B1),
            "2B" => Ok(Self::B2),
            "4B" => Ok(Self::B4),
            "8B" => Ok(Self::B8),
            "26B" => Ok(Self::B26),
            "40B" => Ok(Self::B40),
            "76B" => Ok(Self::B76),
            other => Err(ModelSizeError::Unsupported(other.to_string())),
        }
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}
