use std::collections::HashMap;

use crate::ModelSize;

const QWEN2_ADDED_TOKENS: &[(&str, u32)] = &[
    ("<|endoftext|>", 151643),
    ("<|im_start|>", 151644),
    ("<|im_end|>", 151645),
    ("<img>", 151646),
    ("</img>", 151647),
    ("<IMG_CONTEXT>", 151648),
    ("<quad>", 151649),
    ("</quad>", 151650),
    ("<ref>", 151651),
    ("</ref>", 151652),
    ("<box>", 151653),
    ("</box>", 151654),
];

const INTERNLM2_ADDED_TOKENS: &[(&str, u32)] = &[
    ("<unk>", 0),
    ("<s>", 1),
    ("</s>", 2),
    ("<|plugin|>", 92538),
    ("<|interpreter|>", 92539),
    ("<|action_end|>", 92540),
    ("<|action_start|>", 92541),
    ("<|im_end|>", 92542),
    ("<|im_start|>", 92543),
    ("<img>", 92544),
    ("</img>", 92545),
    ("<IMG_CONTEXT>", 92546),
    ("<quad>", 92547),
    ("</quad>", 92548),
    ("<ref>", 92549),
    ("</ref>", 92550),
    ("<box>", 92551),
    ("</box>", 92552),
];

const PHI3_ADDED_TOKENS: &[(&str, u32)] = &[
    ("<unk>", 0),
    ("<s>", 1),
    ("</s>", 2),
    ("<|endoftext|>", 32000),
    ("<|assistant|>", 32001),
    ("<|placeholder1|>", 32002),
    ("<|placeholder2|>", 32003),
    ("<|placeholder3|>", 32004),
    ("<|placeholder4|>", 32005),
    ("<|system|>", 32006),
    ("<|end|>", 32007),
    ("<|placeholder5|>", 32008),
    ("<|placeholder6|>", 32009),
    ("<|user|>", 32010),
    ("<img>", 32011),
    ("</img>", 32012),
    ("<IMG_CONTEXT>", 32013),
    ("<quad>", 32014),
    ("</quad>", 32015),
    ("<ref>", 32016),
    ("</ref>", 32017),
    ("<box>", 32018),
    ("</box>", 32019),
];

const YI_ADDED_TOKENS: &[(&str, u32)] = &[
    ("<unk>", 0),
    ("<|startoftext|>", 1),
    ("<|endoftext|>", 2),
    ("<|im_start|>", 6),
    ("<|im_end|>", 7),
    ("<img>", 68),
    ("</img>", 70),
    ("<IMG_CONTEXT>", 64000),
    ("<quad>", 64001),
    ("</quad>", 64002),
    ("<ref>", 64003),
    ("</ref>", 64004),
    ("<box>", 64005),
    ("</box>", 64006),
];

const LLAMA3_ADDED_TOKENS: &[(&str, u32)] = &[
    ("<img>", 128256),
    ("</img>", 128257),
    ("<IMG_CONTEXT>", 128258),
    ("<quad>", 128259),
    ("</quad>", 128260),
    ("<ref>", 128261),
    ("</ref>", 128262),
    ("<box>", 128263),
    ("</box>", 128264),
];

/// Multimodal marker tokens that the base checkpoints' tokenizer configs do not define, with
/// their fixed ids. The decoder is always derived from the encoder.
#[derive(Debug, Clone)]
pub(crate) struct AddedTokens {
    encoder: HashMap<String, u32>,
    decoder: HashMap<u32, String>,
    // Longest first, for greedy matching.
    by_length: Vec<(String, u32)>,
}

impl AddedTokens {
    pub fn for_size(size: ModelSize) -> Self {
        let table = match size {
            ModelSize::B1 => QWEN2_ADDED_TOKENS,
            ModelSize::B2 | ModelSize::B8 | ModelSize::B26 => INTERNLM2_ADDED_TOKENS,
            ModelSize::B4 => PHI3_ADDED_TOKENS,
            ModelSize::B40 => YI_ADDED_TOKENS,
            ModelSize::B76 => LLAMA3_ADDED_TOKENS,
        };
        Self::from_pairs(table.iter().map(|(tok, id)| (tok.to_string(), *id)))
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, u32)>) -> Self {
        let encoder: HashMap<String, u32> = pairs.into_iter().collect();
        let decoder = encoder.iter().map(|(k, v)| (*v, k.clone())).collect();
        let mut by_length = encoder
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect::<Vec<_>>();
        by_length.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self {
            encoder,
            decoder,
            by_length,
        }
    }

    pub fn encoder(&self) -> &HashMap<String, u32> {
        &self.encoder
    }

    pub fn decoder(&self) -> &HashMap<u32, String> {
        &self.decoder
    }

    pub fn id(&self, token: &str) -> Option<u32> {
        self.encoder.get(token).copied()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.decoder.get(&id).map(String::as_str)
    }

    /// The longest added token that `text` starts with.
    pub(crate) fn match_prefix(&self, text: &str) -> Option<(&str, u32)> {
        self.by_length
            .iter()
            .find(|(tok, _)| text.starts_with(tok.as_str()))
            .map(|(tok, id)| (tok.as_str(), *id))
    }
}

#[cfg(test)]
mod tests {
    use super::AddedTokens;
    use crate::ModelSize;

    #[test]
    fn decoder_is_inverse_of_encoder() {
        for size in ModelSize::ALL {
            let added = AddedTokens::for_size(size);
            assert_eq!(added.encoder().len(), added.decoder().len(), "{size}");
            for (tok, id) in added.encoder() {
                assert_eq!(added.token(*id), Some(tok.as_str()), "{size}");
            }
            for (id, tok) in added.decoder() {
                assert_eq!(added.id(tok), Some(*id), "{size}");
            }
        }
    }

    #[test]
    fn every_table_has_image_markers() {
        for size in ModelSize::ALL {
            let added = AddedTokens::for_size(size);
            for marker in ["<img>", "</img>", "<IMG_CONTEXT>", "<box>", "</box>", "<ref>"] {
                assert!(added.id(marker).is_some(), "{size} is missing {marker}");
            }
        }
    }

    #[test]
    fn known_ids() {
        assert_eq!(AddedTokens::for_size(ModelSize::B1).id("<IMG_CONTEXT>"), Some(151648));
        assert_eq!(AddedTokens::for_size(ModelSize::B8).id("<IMG_CONTEXT>"), Some(92546));
        assert_eq!(AddedTokens::for_size(ModelSize::B4).id("<|end|>"), Some(32007));
        assert_eq!(AddedTokens::for_size(ModelSize::B40).id("</img>"), Some(70));
        assert_eq!(AddedTokens::for_size(ModelSize::B76).encoder().len(), 9);
    }

    #[test]
    fn longest_prefix_wins() {
        let added = AddedTokens::from_pairs([("<a>".to_string(), 1), ("<a><b>".to_string(), 2)]);
        assert_eq!(added.match_prefix("<a><b>rest"), Some(("<a><b>", 2)));
        assert_eq!(added.match_prefix("<a>rest"), Some(("<a>", 1)));
        assert_eq!(added.match_prefix("rest"), None);
    }
}
