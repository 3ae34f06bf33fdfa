#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::{fs, sync::atomic::Ordering};

use anyhow::Context;
use candle_core::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{layer_norm, LayerNorm, Linear, VarBuilder};
use tracing::{debug, info, warn};

use super::{InternVisionModel, LanguageModel};
use crate::{
    config::{InternVLChatConfig, PixelShuffleVersion},
    conversation::Conversation,
    generation::GenerationConfig,
    paths::ModelRepo,
    tokenizer::ChatTokenizer,
    DEBUG, IMAGE_PLACEHOLDER, IMG_CONTEXT_TOKEN, IMG_END_TOKEN, IMG_START_TOKEN,
};

/// Prior (question, answer) turns.
pub type History = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub response: String,
    /// Present when the caller asked for it.
    pub history: Option<History>,
}

/// `mlp1`: LayerNorm, Linear, GELU, Linear.
#[derive(Debug, Clone)]
struct Projector {
    norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl Projector {
    fn new(in_dim: usize, llm_hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: layer_norm(in_dim, 1e-5, vb.pp(0))?,
            fc1: candle_nn::linear(in_dim, llm_hidden, vb.pp(1))?,
            fc2: candle_nn::linear(llm_hidden, llm_hidden, vb.pp(3))?,
        })
    }
}

impl Module for Projector {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.norm)?
            .apply(&self.fc1)?
            .gelu_erf()?
            .apply(&self.fc2)
    }
}

/// Fold `factor x factor` neighbourhoods of a (n, w, h, c) grid into the channel dimension,
/// giving (n, h / factor, w / factor, c * factor^2) for `V2`. `V1` keeps the transposed layout
/// the first checkpoints were trained with.
pub(crate) fn pixel_shuffle(
    xs: &Tensor,
    factor: usize,
    version: PixelShuffleVersion,
) -> Result<Tensor> {
    let (n, w, h, c) = xs.dims4()?;
    if h % factor != 0 || w % factor != 0 {
        candle_core::bail!("pixel shuffle factor {factor} does not divide the {w}x{h} patch grid");
    }
    let xs = xs
        .reshape((n, w, h / factor, c * factor))?
        .permute((0, 2, 1, 3))?
        .contiguous()?
        .reshape((n, h / factor, w / factor, c * factor * factor))?;
    match version {
        PixelShuffleVersion::V1 => Ok(xs),
        PixelShuffleVersion::V2 => xs.permute((0, 2, 1, 3))?.contiguous(),
    }
}

/// Replace the embeddings at `image_token_id` positions, in order, by the rows of
/// `vit_embeds`. `input_embeds` is (1, seq_len, hidden), `vit_embeds` is (tokens, hidden).
pub(crate) fn merge_image_embeddings(
    input_ids: &[u32],
    input_embeds: &Tensor,
    vit_embeds: &Tensor,
    image_token_id: u32,
) -> Result<Tensor> {
    let positions = input_ids
        .iter()
        .enumerate()
        .filter(|(_, id)| **id == image_token_id)
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    let (n_vit, _) = vit_embeds.dims2()?;
    if positions.len() != n_vit {
        candle_core::bail!(
            "The prompt has {} image context tokens but the vision encoder produced {n_vit} embeddings.",
            positions.len()
        );
    }
    if positions.is_empty() {
        return Ok(input_embeds.clone());
    }

    let text = input_embeds.i(0)?;
    let vit_embeds = vit_embeds.to_dtype(text.dtype())?;
    let mut pieces = Vec::new();
    let mut cursor = 0;
    let mut vit_cursor = 0;
    let mut i = 0;
    while i < positions.len() {
        // Contiguous run of image positions.
        let start = positions[i];
        let mut len = 1;
        while i + len < positions.len() && positions[i + len] == start + len {
            len += 1;
        }
        if start > cursor {
            pieces.push(text.narrow(0, cursor, start - cursor)?);
        }
        pieces.push(vit_embeds.narrow(0, vit_cursor, len)?);
        vit_cursor += len;
        cursor = start + len;
        i += len;
    }
    if cursor < input_ids.len() {
        pieces.push(text.narrow(0, cursor, input_ids.len() - cursor)?);
    }
    Tensor::cat(&pieces, 0)?.unsqueeze(0)
}

/// Replay `history` as closed turns, open a turn for `question`, and expand the first
/// `<image>` into `context_tokens` image context tokens between `<img>` and `</img>`.
pub(crate) fn build_query(
    mut template: Conversation,
    history: &[(String, String)],
    question: &str,
    context_tokens: Option<usize>,
) -> String {
    for (old_question, old_answer) in history {
        template.append_user(old_question.clone());
        template.append_assistant(Some(old_answer.clone()));
    }
    template.append_user(question);
    template.append_assistant(None);
    let query = template.get_prompt();
    match context_tokens {
        Some(n) => {
            let image_tokens = format!(
                "{IMG_START_TOKEN}{}{IMG_END_TOKEN}",
                IMG_CONTEXT_TOKEN.repeat(n)
            );
            query.replacen(IMAGE_PLACEHOLDER, &image_tokens, 1)
        }
        None => query,
    }
}

/// The decoded text up to the first separator, trimmed.
pub(crate) fn clean_response(decoded: &str, eos_token: &str) -> String {
    decoded
        .split(eos_token)
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// InternViT encoder, pixel-shuffle projector and language backbone.
pub struct InternVLChatModel {
    vision_model: InternVisionModel,
    mlp1: Projector,
    language_model: LanguageModel,
    config: InternVLChatConfig,
    template: Conversation,
    dtype: DType,
    device: Device,
}

impl InternVLChatModel {
    pub fn new(config: &InternVLChatConfig, vb: VarBuilder) -> Result<Self> {
        let Some(template) = Conversation::from_template(&config.template) else {
            candle_core::bail!("Unknown conversation template `{}`.", config.template);
        };
        if config.ps_version == PixelShuffleVersion::V1 {
            warn!("In ps_version 'v1', the height and width have not been swapped back, which results in a transposed image.");
        }
        let vision_model = InternVisionModel::new(
            &config.vision_config,
            config.select_layer,
            vb.pp("vision_model"),
        )?;
        let factor = config.downsample_factor();
        let mlp1 = Projector::new(
            config.vision_config.hidden_size * factor * factor,
            config.llm_config.hidden_size,
            vb.pp("mlp1"),
        )?;
        let language_model = LanguageModel::new(&config.llm_config, vb.pp("language_model"))?;
        Ok(Self {
            vision_model,
            mlp1,
            language_model,
            config: config.clone(),
            template,
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    /// Load `config.json` and every safetensors shard from a local directory or Hub id.
    pub fn from_pretrained(model_id: &str, dtype: DType, device: &Device) -> anyhow::Result<Self> {
        let repo = ModelRepo::new(model_id)?;
        let config_path = repo.get("config.json")?;
        let config: InternVLChatConfig = serde_json::from_str(
            &fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?,
        )
        .with_context(|| format!("parsing {}", config_path.display()))?;
        let shards = repo.safetensors()?;
        info!(
            "Loading {} safetensors shard(s) from `{model_id}` as {dtype:?} on {device:?}.",
            shards.len()
        );
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&shards, dtype, device)? };
        let model = Self::new(&config, vb)?;
        info!(
            "Model loaded: template `{}`, {} image tokens per tile, backbone {:?}.",
            config.template,
            model.num_image_token(),
            model.language_model.architecture()
        );
        Ok(model)
    }

    pub fn num_image_token(&self) -> usize {
        self.config.num_image_token()
    }

    /// (tiles, 3, s, s) pixels -> (tiles * num_image_token, llm_hidden) embeddings.
    pub fn extract_feature(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let vit_embeds = self.vision_model.forward(pixel_values)?;
        let (n, seq_len, c) = vit_embeds.dims3()?;
        // Drop CLS.
        let vit_embeds = vit_embeds.narrow(1, 1, seq_len - 1)?;
        let hw = ((seq_len - 1) as f64).sqrt() as usize;
        if hw * hw != seq_len - 1 {
            candle_core::bail!("{} patches do not form a square grid", seq_len - 1);
        }
        let vit_embeds = vit_embeds.reshape((n, hw, hw, c))?;
        let vit_embeds = pixel_shuffle(
            &vit_embeds,
            self.config.downsample_factor(),
            self.config.ps_version,
        )?;
        let last = vit_embeds.dim(3)?;
        let vit_embeds = vit_embeds.reshape((n, (), last))?.apply(&self.mlp1)?;
        let (n, t, hidden) = vit_embeds.dims3()?;
        vit_embeds.reshape((n * t, hidden))
    }

    /// Greedy or sampled decoding from a prompt whose image context tokens are filled with
    /// the features of `pixel_values`. Returns the generated ids, EOS excluded.
    pub fn generate(
        &mut self,
        input_ids: &[u32],
        pixel_values: Option<&Tensor>,
        image_token_id: u32,
        eos_token_id: Option<u32>,
        generation_config: &GenerationConfig,
    ) -> Result<Vec<u32>> {
        self.language_model.clear_kv_cache();
        let mut sampler = generation_config.sampler();

        let ids = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let mut input_embeds = self.language_model.embed_tokens(&ids)?;
        if let Some(pixel_values) = pixel_values {
            let pixel_values = pixel_values.to_device(&self.device)?.to_dtype(self.dtype)?;
            let vit_embeds = self.extract_feature(&pixel_values)?;
            input_embeds =
                merge_image_embeddings(input_ids, &input_embeds, &vit_embeds, image_token_id)?;
        }

        let mut generated = Vec::new();
        let mut logits = self.language_model.forward_embeds(&input_embeds, 0)?;
        let mut offset = input_ids.len();
        while generated.len() < generation_config.max_new_tokens {
            let next = sampler.sample(&logits.squeeze(0)?)?;
            if Some(next) == eos_token_id {
                break;
            }
            generated.push(next);
            if generated.len() == generation_config.max_new_tokens {
                break;
            }
            let next = Tensor::new(&[[next]], &self.device)?;
            let embeds = self.language_model.embed_tokens(&next)?;
            logits = self.language_model.forward_embeds(&embeds, offset)?;
            offset += 1;
        }
        Ok(generated)
    }

    /// One chat turn. When `pixel_values` is given and there is no prior history, a missing
    /// `<image>` placeholder is prepended to the question.
    pub fn chat(
        &mut self,
        tokenizer: &ChatTokenizer,
        pixel_values: Option<&Tensor>,
        question: &str,
        generation_config: &GenerationConfig,
        history: Option<History>,
        return_history: bool,
    ) -> anyhow::Result<ChatResponse> {
        let mut history = history.unwrap_or_default();
        let question = if history.is_empty()
            && pixel_values.is_some()
            && !question.contains(IMAGE_PLACEHOLDER)
        {
            format!("{IMAGE_PLACEHOLDER}\n{question}")
        } else {
            question.to_string()
        };

        let image_token_id = tokenizer
            .convert_token_to_id(IMG_CONTEXT_TOKEN)
            .with_context(|| format!("`{IMG_CONTEXT_TOKEN}` is not in the tokenizer"))?;

        let eos_token = self.template.sep().trim().to_string();
        let eos_token_id = tokenizer.convert_token_to_id(&eos_token);
        if eos_token_id.is_none() {
            warn!("Separator `{eos_token}` is not a known token, decoding stops at max_new_tokens.");
        }
        let context_tokens = match pixel_values {
            Some(pixel_values) => Some(self.num_image_token() * pixel_values.dim(0)?),
            None => None,
        };
        let query = build_query(self.template.clone(), &history, &question, context_tokens);

        if DEBUG.load(Ordering::Relaxed) {
            debug!("Query: {}", query.replace(IMG_CONTEXT_TOKEN, ""));
        }
        let input_ids = tokenizer.encode(&query, true)?;
        info!("Prompt is {} tokens.", input_ids.len());
        let output = self.generate(
            &input_ids,
            pixel_values,
            image_token_id,
            eos_token_id,
            generation_config,
        )?;
        info!("Generated {} tokens.", output.len());

        let response = clean_response(&tokenizer.decode(&output, true)?, &eos_token);
        history.push((question, response.clone()));
        Ok(ChatResponse {
            response,
            history: return_history.then_some(history),
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::{build_query, clean_response, merge_image_embeddings, pixel_shuffle};
    use crate::{config::PixelShuffleVersion, conversation::Conversation};

    fn hermes() -> Conversation {
        let mut conv = Conversation::from_template("Hermes-2").unwrap();
        conv.set_system_message("sys");
        conv
    }

    #[test]
    fn query_replays_history_as_closed_turns() {
        let history = vec![("<image>\nwhat is it".to_string(), "a cat".to_string())];
        let query = build_query(hermes(), &history, "and its color", None);
        assert_eq!(
            query,
            "<|im_start|>system\nsys<|im_end|>\
             <|im_start|>user\n<image>\nwhat is it<|im_end|>\
             <|im_start|>assistant\na cat<|im_end|>\
             <|im_start|>user\nand its color<|im_end|>\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn query_expands_only_the_first_placeholder() {
        let history = vec![("<image>\nwhat is it".to_string(), "a cat".to_string())];
        let query = build_query(hermes(), &history, "<image>\nand this", Some(2));
        assert!(query.contains(
            "user\n<img><IMG_CONTEXT><IMG_CONTEXT></img>\nwhat is it<|im_end|>"
        ));
        assert!(query.contains("user\n<image>\nand this<|im_end|>"));
        assert_eq!(query.matches("<IMG_CONTEXT>").count(), 2);
    }

    #[test]
    fn response_is_cut_at_the_separator() {
        assert_eq!(clean_response(" a cat <|im_end|>more", "<|im_end|>"), "a cat");
        assert_eq!(clean_response("no separator\n", "<|im_end|>"), "no separator");
        assert_eq!(clean_response("<|end|>", "<|end|>"), "");
    }

    #[test]
    fn pixel_shuffle_folds_neighbourhoods() {
        let dev = Device::Cpu;
        let xs = Tensor::arange(0f32, 2. * 4. * 4. * 3., &dev)
            .unwrap()
            .reshape((2, 4, 4, 3))
            .unwrap();
        for version in [PixelShuffleVersion::V1, PixelShuffleVersion::V2] {
            let out = pixel_shuffle(&xs, 2, version).unwrap();
            assert_eq!(out.dims(), &[2, 2, 2, 12]);
        }
        assert!(pixel_shuffle(&xs, 3, PixelShuffleVersion::V2).is_err());
    }

    #[test]
    fn pixel_shuffle_v2_keeps_orientation() {
        // (1, w=2, h=2, c=1) with values w*2+h
        let xs = Tensor::new(&[0f32, 1., 2., 3.], &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 2, 1))
            .unwrap();
        let v2 = pixel_shuffle(&xs, 2, PixelShuffleVersion::V2).unwrap();
        let v2: Vec<f32> = v2.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v2, vec![0., 1., 2., 3.]);
        let v1 = pixel_shuffle(&xs, 2, PixelShuffleVersion::V1).unwrap();
        assert_eq!(v1.dims(), &[1, 1, 1, 4]);
    }

    #[test]
    fn merge_replaces_image_positions_in_order() {
        let dev = Device::Cpu;
        let ids = [5u32, 9, 9, 6, 9];
        let text = Tensor::zeros((1, 5, 2), DType::F32, &dev).unwrap();
        let vit = Tensor::new(&[[1f32, 1.], [2., 2.], [3., 3.]], &dev).unwrap();
        let merged = merge_image_embeddings(&ids, &text, &vit, 9).unwrap();
        assert_eq!(merged.dims(), &[1, 5, 2]);
        let rows: Vec<Vec<f32>> = merged.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(
            rows,
            vec![
                vec![0., 0.],
                vec![1., 1.],
                vec![2., 2.],
                vec![0., 0.],
                vec![3., 3.]
            ]
        );
    }

    #[test]
    fn merge_rejects_count_mismatch() {
        let dev = Device::Cpu;
        let text = Tensor::zeros((1, 3, 2), DType::F32, &dev).unwrap();
        let vit = Tensor::zeros((2, 2), DType::F32, &dev).unwrap();
        assert!(merge_image_embeddings(&[9, 1, 2], &text, &vit, 9).is_err());
        let empty = vit.narrow(0, 0, 0).unwrap();
        let no_images = merge_image_embeddings(&[1, 2, 3], &text, &empty, 9);
        assert_eq!(no_images.unwrap().dims(), &[1, 3, 2]);
    }
}
