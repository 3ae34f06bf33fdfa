#![deny(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::atomic::AtomicBool;

mod config;
mod conversation;
mod generation;
mod image_loader;
mod layers;
mod model_size;
mod models;
mod paths;
mod sampler;
mod tokenizer;
mod utils;

pub use config::{
    InternVLChatConfig, LlmArchitecture, LlmConfig, NormType, PixelShuffleVersion, RopeScaling,
    VisionConfig,
};
pub use conversation::{Conversation, INTERNVL_SYSTEM_MESSAGE};
pub use generation::GenerationConfig;
pub use image_loader::{
    load_image, prompt_for, resolve_image_path, DEFAULT_INPUT_SIZE, DEFAULT_MAX_NUM,
};
pub use model_size::{ModelSize, ModelSizeError};
pub use models::{ChatResponse, History, InternVLChatModel, InternVisionModel, LanguageModel};
pub use paths::{api_dir_list, api_get_file, HFError, ModelRepo};
pub use sampler::Sampler;
pub use tokenizer::{load_tokenizer, ChatTokenizer, TokenizerError, TokenizerFamily};
pub use utils::dtype::{parse_dtype, DTypeConversionError};

/// `true` if `INTERNVL_DEBUG` is set.
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);

/// Install the `tracing` subscriber used by the binaries. Safe to call more than once.
pub fn initialize_logging() {
    utils::debug::setup_logger_and_debug();
}

pub(crate) const IMG_START_TOKEN: &str = "<img>";
pub(crate) const IMG_END_TOKEN: &str = "</img>";
pub(crate) const IMG_CONTEXT_TOKEN: &str = "<IMG_CONTEXT>";
pub(crate) const IMAGE_PLACEHOLDER: &str = "<image>";
