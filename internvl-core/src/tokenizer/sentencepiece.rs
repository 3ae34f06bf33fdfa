use std::path::Path;

use prost::Message;
use tokenizers::{
    decoders::{self, byte_fallback::ByteFallback, fuse::Fuse, strip::Strip},
    models::unigram::Unigram,
    normalizers::{self, Prepend, Replace},
    AddedToken, DecoderWrapper, ModelWrapper, NormalizerWrapper, Tokenizer,
};
use tracing::info;

use super::TokenizerError;

/// The subset of sentencepiece's `ModelProto` needed to rebuild the vocabulary. Other fields
/// are skipped by the decoder.
#[derive(Clone, PartialEq, Message)]
pub(crate) struct ModelProto {
    #[prost(message, repeated, tag = "1")]
    pub pieces: Vec<SentencePiece>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct SentencePiece {
    #[prost(string, optional, tag = "1")]
    pub piece: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub score: Option<f32>,
    #[prost(int32, optional, tag = "3")]
    pub kind: Option<i32>,
}

/// `SentencePiece.Type` values.
pub(crate) const PIECE_NORMAL: i32 = 1;
pub(crate) const PIECE_UNKNOWN: i32 = 2;
pub(crate) const PIECE_CONTROL: i32 = 3;
pub(crate) const PIECE_BYTE: i32 = 6;

/// Build a unigram tokenizer from a sentencepiece `tokenizer.model`.
pub(crate) fn from_model_file(path: &Path) -> Result<Tokenizer, TokenizerError> {
    let bytes = std::fs::read(path).map_err(|e| {
        TokenizerError::Tokenizers(format!("reading {}: {e}", path.display()))
    })?;
    let proto = ModelProto::decode(bytes.as_slice())?;
    build_unigram(&proto)
}

pub(crate) fn build_unigram(proto: &ModelProto) -> Result<Tokenizer, TokenizerError> {
    if proto.pieces.is_empty() {
        return Err(TokenizerError::Tokenizers(
            "sentencepiece model has no pieces".to_string(),
        ));
    }
    let kind = |p: &SentencePiece| p.kind.unwrap_or(PIECE_NORMAL);
    let vocab = proto
        .pieces
        .iter()
        .map(|p| (p.piece.clone().unwrap_or_default(), f64::from(p.score.unwrap_or(0.))))
        .collect::<Vec<_>>();
    let unk = proto
        .pieces
        .iter()
        .position(|p| kind(p) == PIECE_UNKNOWN)
        .unwrap_or(0);
    let byte_fallback = proto.pieces.iter().any(|p| kind(p) == PIECE_BYTE);

    let unigram = Unigram::from(vocab, Some(unk), byte_fallback).map_err(TokenizerError::wrap)?;
    let mut tokenizer = Tokenizer::new(ModelWrapper::Unigram(unigram));
    tokenizer.with_decoder(Some(decoders::sequence::Sequence::new(vec![
        DecoderWrapper::Replace(Replace::new("▁", " ").map_err(TokenizerError::wrap)?),
        DecoderWrapper::ByteFallback(ByteFallback::new()),
        DecoderWrapper::Fuse(Fuse::new()),
        DecoderWrapper::Strip(Strip::new(' ', 1, 0)),
    ])));
    tokenizer.with_normalizer(Some(normalizers::Sequence::new(vec![
        NormalizerWrapper::Prepend(Prepend::new("▁".to_string())),
        NormalizerWrapper::Replace(Replace::new(" ", "▁").map_err(TokenizerError::wrap)?),
    ])));

    let special = proto
        .pieces
        .iter()
        .filter(|p| matches!(kind(p), PIECE_UNKNOWN | PIECE_CONTROL))
        .filter_map(|p| p.piece.clone())
        .map(|p| AddedToken::from(p, true))
        .collect::<Vec<_>>();
    tokenizer.add_special_tokens(&special);

    info!(
        "SentencePiece unigram model: {} pieces, unk id {unk}, byte fallback {byte_fallback}.",
        proto.pieces.len()
    );
    Ok(tokenizer)
}
