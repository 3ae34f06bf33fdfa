mod added_tokens;
mod sentencepiece;

use std::{collections::HashSet, fmt, path::Path};

use thiserror::Error;
use tokenizers::{
    decoders::byte_level::ByteLevel as ByteLevelDecoder,
    models::bpe::BPE,
    pre_tokenizers::{
        byte_level::ByteLevel,
        sequence::Sequence,
        split::{Split, SplitPattern},
        PreTokenizerWrapper,
    },
    tokenizer::normalizer::SplitDelimiterBehavior,
    Tokenizer,
};
use tracing::{info, warn};

pub(crate) use added_tokens::AddedTokens;

use crate::{paths::HFError, ModelRepo, ModelSize};

const QWEN2_SPLIT_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// The base tokenizer implementation a checkpoint ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerFamily {
    Qwen2,
    InternLM2,
    Llama,
    Llama3,
}

impl fmt::Display for TokenizerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Qwen2 => "Qwen2Tokenizer",
            Self::InternLM2 => "InternLM2Tokenizer",
            Self::Llama => "LlamaTokenizer",
            Self::Llama3 => "PreTrainedTokenizerFast",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("{family} needs `{file}` in `{model_id}`, which is missing.")]
    MissingFile {
        family: TokenizerFamily,
        file: &'static str,
        model_id: String,
    },

    #[error("Tokenizer error: {0}")]
    Tokenizers(String),

    #[error("Invalid `tokenizer.model`: {0}")]
    SentencePiece(#[from] prost::DecodeError),

    #[error(transparent)]
    HFError(#[from] HFError),
}

impl TokenizerError {
    fn wrap(e: tokenizers::Error) -> Self {
        Self::Tokenizers(e.to_string())
    }
}

/// A base tokenizer plus the fixed multimodal token table for one model size.
///
/// Added tokens are matched in the raw text before the base tokenizer sees it, so they always
/// map to their fixed ids regardless of the base vocabulary.
pub struct ChatTokenizer {
    base: Tokenizer,
    size: ModelSize,
    added: AddedTokens,
    bos: Option<u32>,
    name_or_path: String,
}

impl ChatTokenizer {
    pub fn new(base: Tokenizer, size: ModelSize, name_or_path: impl Into<String>) -> Self {
        let added = AddedTokens::for_size(size);
        let bos = bos_token(size).and_then(|tok| {
            let id = added.id(tok).or_else(|| base.token_to_id(tok));
            if id.is_none() {
                warn!("BOS token `{tok}` is not in the vocabulary, it will not be prepended.");
            }
            id
        });
        Self {
            base,
            size,
            added,
            bos,
            name_or_path: name_or_path.into(),
        }
    }

    /// Load the base tokenizer for `size` from a checkpoint: `tokenizer.json` when present,
    /// then the Qwen2 `vocab.json`/`merges.txt` pair, then a sentencepiece `tokenizer.model`.
    pub fn from_repo(size: ModelSize, repo: &ModelRepo) -> Result<Self, TokenizerError> {
        let family = size.tokenizer_family();
        let missing = |file| TokenizerError::MissingFile {
            family,
            file,
            model_id: repo.model_id().to_string(),
        };
        let base = if repo.contains("tokenizer.json") {
            let path = repo.get("tokenizer.json")?;
            Tokenizer::from_file(path).map_err(TokenizerError::wrap)?
        } else {
            match family {
                TokenizerFamily::Qwen2 => {
                    if !repo.contains("vocab.json") || !repo.contains("merges.txt") {
                        return Err(missing("vocab.json"));
                    }
                    let vocab = repo.get("vocab.json")?;
                    let merges = repo.get("merges.txt")?;
                    build_qwen2_bpe(&vocab, &merges)?
                }
                TokenizerFamily::Llama3 => return Err(missing("tokenizer.json")),
                TokenizerFamily::InternLM2 | TokenizerFamily::Llama => {
                    if !repo.contains("tokenizer.model") {
                        return Err(missing("tokenizer.model"));
                    }
                    sentencepiece::from_model_file(&repo.get("tokenizer.model")?)?
                }
            }
        };
        info!("Loaded {family} for InternVL2-{size}.");
        Ok(Self::new(base, size, repo.model_id()))
    }

    pub fn family(&self) -> TokenizerFamily {
        self.size.tokenizer_family()
    }

    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos
    }

    /// Look a token up in the added table first, then in the base vocabulary.
    pub fn convert_token_to_id(&self, token: &str) -> Option<u32> {
        self.added.id(token).or_else(|| self.base.token_to_id(token))
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, TokenizerError> {
        let mut ids = Vec::new();
        if add_special_tokens {
            ids.extend(self.bos);
        }
        let mut pending = 0;
        let mut i = 0;
        while i < text.len() {
            if let Some((tok, id)) = self.added.match_prefix(&text[i..]) {
                self.encode_base(&text[pending..i], &mut ids)?;
                ids.push(id);
                i += tok.len();
                pending = i;
            } else {
                i += text[i..].chars().next().map_or(1, char::len_utf8);
            }
        }
        self.encode_base(&text[pending..], &mut ids)?;
        Ok(ids)
    }

    fn encode_base(&self, text: &str, ids: &mut Vec<u32>) -> Result<(), TokenizerError> {
        if text.is_empty() {
            return Ok(());
        }
        let encoding = self.base.encode(text, false).map_err(TokenizerError::wrap)?;
        ids.extend_from_slice(encoding.get_ids());
        Ok(())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TokenizerError> {
        let mut out = String::new();
        let mut run: Vec<u32> = Vec::new();
        for id in ids {
            match self.added.token(*id) {
                Some(tok) => {
                    self.flush_run(&mut run, &mut out, skip_special_tokens)?;
                    if !skip_special_tokens {
                        out.push_str(tok);
                    }
                }
                None => run.push(*id),
            }
        }
        self.flush_run(&mut run, &mut out, skip_special_tokens)?;
        Ok(out)
    }

    fn flush_run(
        &self,
        run: &mut Vec<u32>,
        out: &mut String,
        skip_special_tokens: bool,
    ) -> Result<(), TokenizerError> {
        if run.is_empty() {
            return Ok(());
        }
        let text = self
            .base
            .decode(run, skip_special_tokens)
            .map_err(TokenizerError::wrap)?;
        out.push_str(&text);
        run.clear();
        Ok(())
    }

    /// Number of distinct tokens across the base vocabulary and the added table.
    pub fn len(&self) -> usize {
        let vocab = self.base.get_vocab(true);
        let mut tokens: HashSet<&str> = vocab.keys().map(String::as_str).collect();
        tokens.extend(self.added.encoder().keys().map(String::as_str));
        tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ChatTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut added = self
            .added
            .decoder()
            .iter()
            .map(|(id, tok)| (*id, tok.as_str()))
            .collect::<Vec<_>>();
        added.sort_unstable();
        writeln!(
            f,
            "{}(name_or_path='{}', vocab_size={}, added_tokens={}, bos_token_id={:?}, added_tokens_decoder={{",
            self.family(),
            self.name_or_path,
            self.base.get_vocab_size(false),
            added.len(),
            self.bos,
        )?;
        for (id, tok) in added {
            writeln!(f, "\t{id}: {tok:?},")?;
        }
        write!(f, "}})")
    }
}

fn bos_token(size: ModelSize) -> Option<&'static str> {
    match size {
        ModelSize::B1 => None,
        ModelSize::B2 | ModelSize::B8 | ModelSize::B26 | ModelSize::B4 => Some("<s>"),
        ModelSize::B40 => Some("<|startoftext|>"),
        ModelSize::B76 => Some("<|begin_of_text|>"),
    }
}

fn build_qwen2_bpe(vocab: &Path, merges: &Path) -> Result<Tokenizer, TokenizerError> {
    let (Some(vocab), Some(merges)) = (vocab.to_str(), merges.to_str()) else {
        return Err(TokenizerError::Tokenizers(
            "Tokenizer paths must be valid UTF-8.".to_string(),
        ));
    };
    let bpe = BPE::from_file(vocab, merges)
        .build()
        .map_err(TokenizerError::wrap)?;
    let split = Split::new(
        SplitPattern::Regex(QWEN2_SPLIT_PATTERN.to_string()),
        SplitDelimiterBehavior::Isolated,
        false,
    )
    .map_err(TokenizerError::wrap)?;
    let pre_tokenizer = Sequence::new(vec![
        PreTokenizerWrapper::Split(split),
        PreTokenizerWrapper::ByteLevel(ByteLevel::new(false, false, false)),
    ]);
    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer
        .with_pre_tokenizer(Some(pre_tokenizer))
        .with_decoder(Some(ByteLevelDecoder::new(false, false, false)));
    Ok(tokenizer)
}

/// Resolve the size's tokenizer for a local directory or Hub id.
pub fn load_tokenizer(size: ModelSize, model_id: &str) -> anyhow::Result<ChatTokenizer> {
    let repo = ModelRepo::new(model_id)?;
    Ok(ChatTokenizer::from_repo(size, &repo)?)
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use prost::Message;
    use tokenizers::{
        models::wordlevel::WordLevel, pre_tokenizers::whitespace::Whitespace, Tokenizer,
    };

    use super::{load_tokenizer, sentencepiece, ChatTokenizer, TokenizerError, TokenizerFamily};
    use crate::{ModelRepo, ModelSize};

    /// Word-level tokenizer over a handful of words, for tests that need a real `Tokenizer`.
    pub(crate) fn tiny_base_tokenizer() -> Tokenizer {
        let words = [
            "[UNK]", "<s>", "hello", "world", "user", "assistant", "system", "describe", "the",
            "image", "a", "cat", "\n",
        ];
        let vocab: HashMap<String, u32> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer
    }

    #[test]
    fn added_tokens_keep_fixed_ids() {
        let tok = ChatTokenizer::new(tiny_base_tokenizer(), ModelSize::B1, "test");
        let ids = tok.encode("<img><IMG_CONTEXT><IMG_CONTEXT></img>hello", true).unwrap();
        assert_eq!(ids, vec![151646, 151648, 151648, 151647, 2]);
    }

    #[test]
    fn bos_is_prepended_per_family() {
        let qwen = ChatTokenizer::new(tiny_base_tokenizer(), ModelSize::B1, "test");
        assert_eq!(qwen.bos_token_id(), None);
        let internlm = ChatTokenizer::new(tiny_base_tokenizer(), ModelSize::B8, "test");
        assert_eq!(internlm.bos_token_id(), Some(1));
        assert_eq!(internlm.encode("hello world", true).unwrap(), vec![1, 2, 3]);
        assert_eq!(internlm.encode("hello world", false).unwrap(), vec![2, 3]);
        let yi = ChatTokenizer::new(tiny_base_tokenizer(), ModelSize::B40, "test");
        assert_eq!(yi.bos_token_id(), Some(1));
        // `<|begin_of_text|>` is neither added nor in the tiny vocabulary.
        let llama3 = ChatTokenizer::new(tiny_base_tokenizer(), ModelSize::B76, "test");
        assert_eq!(llama3.bos_token_id(), None);
    }

    #[test]
    fn decode_skips_added_tokens() {
        let tok = ChatTokenizer::new(tiny_base_tokenizer(), ModelSize::B8, "test");
        let ids = tok.encode("hello<|im_end|>", false).unwrap();
        assert_eq!(ids, vec![2, 92542]);
        assert_eq!(tok.decode(&ids, true).unwrap(), "hello");
        assert_eq!(tok.decode(&ids, false).unwrap(), "hello<|im_end|>");
    }

    #[test]
    fn len_is_union_of_vocab_and_added() {
        let tok = ChatTokenizer::new(tiny_base_tokenizer(), ModelSize::B8, "test");
        // `<s>` is in both tables.
        assert_eq!(tok.len(), 13 + 18 - 1);
        assert_eq!(tok.family(), TokenizerFamily::InternLM2);
        assert_eq!(tok.convert_token_to_id("<IMG_CONTEXT>"), Some(92546));
        assert_eq!(tok.convert_token_to_id("cat"), Some(11));
    }

    #[test]
    fn loads_sentencepiece_only_checkpoint() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("InternVL2-8B");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join("tokenizer.model"),
            sentencepiece::tests::tiny_model().encode_to_vec(),
        )
        .unwrap();

        let path = dir.to_str().unwrap();
        let tok = load_tokenizer(ModelSize::from_model_path(path).unwrap(), path).unwrap();
        assert_eq!(tok.family(), TokenizerFamily::InternLM2);
        let ids = tok.encode("hello world<|im_end|>", true).unwrap();
        assert_eq!(ids, vec![1, 3, 4, 92542]);
        assert_eq!(tok.decode(&ids, true).unwrap(), "hello world");
    }

    #[test]
    fn missing_tokenizer_files_are_named() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ModelRepo::new(dir.path().to_str().unwrap()).unwrap();
        for (size, family, file) in [
            (ModelSize::B8, TokenizerFamily::InternLM2, "tokenizer.model"),
            (ModelSize::B1, TokenizerFamily::Qwen2, "vocab.json"),
            (ModelSize::B76, TokenizerFamily::Llama3, "tokenizer.json"),
        ] {
            let err = ChatTokenizer::from_repo(size, &repo).err().unwrap();
            match err {
                TokenizerError::MissingFile {
                    family: f,
                    file: missing,
                    ..
                } => assert_eq!((f, missing), (family, file)),
                other => panic!("unexpected error {other}"),
            }
        }
    }

    #[test]
    fn corrupt_sentencepiece_model_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tokenizer.model"), b"").unwrap();
        let repo = ModelRepo::new(dir.path().to_str().unwrap()).unwrap();
        assert!(ChatTokenizer::from_repo(ModelSize::B8, &repo).is_err());
    }

    #[test]
    fn qwen2_bpe_from_vocab_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = serde_json::json!({
            "h": 0, "e": 1, "l": 2, "o": 3, "Ġ": 4, "w": 5, "r": 6, "d": 7, "Ċ": 8,
            "he": 9, "ll": 10, "hell": 11, "hello": 12,
        });
        std::fs::write(dir.path().join("vocab.json"), vocab.to_string()).unwrap();
        std::fs::write(
            dir.path().join("merges.txt"),
            "#version: 0.2\nh e\nl l\nhe ll\nhell o\n",
        )
        .unwrap();
        let repo = ModelRepo::new(dir.path().to_str().unwrap()).unwrap();
        let tok = ChatTokenizer::from_repo(ModelSize::B1, &repo).unwrap();

        let text = "hello world<img>\nhe";
        let ids = tok.encode(text, true).unwrap();
        assert_eq!(ids, vec![12, 4, 5, 3, 6, 2, 7, 151646, 8, 9]);
        assert_eq!(tok.decode(&ids, false).unwrap(), text);
        assert_eq!(tok.decode(&ids, true).unwrap(), "hello world\nhe");
    }

    #[test]
    fn loads_tokenizer_json_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        tiny_base_tokenizer()
            .save(dir.path().join("tokenizer.json"), false)
            .unwrap();
        let repo = ModelRepo::new(dir.path().to_str().unwrap()).unwrap();
        let tok = ChatTokenizer::from_repo(ModelSize::B2, &repo).unwrap();
        assert_eq!(tok.encode("describe the image", true).unwrap(), vec![1, 7, 8, 9]);
        assert!(format!("{tok:?}").starts_with("InternLM2Tokenizer("));
    }
}
