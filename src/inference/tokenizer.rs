//! SentencePiece vocabulary from GGUF `tokenizer.ggml.*` metadata, encoded
//! with a byte-fallback BPE model from the `tokenizers` crate.
//!
//! GGUF llama vocabularies ship scores instead of merges. Every split of a
//! piece into two vocabulary pieces becomes a merge ranked by the score of the
//! merged piece, which reproduces highest-score-first pair merging.

use crate::error::{BackendError, EmberError, Result};
use crate::inference::gguf::{self, Metadata};
use std::collections::HashMap;
use std::fmt;
use tokenizers::models::bpe::BPE;
use tokenizers::normalizers::{NormalizerWrapper, Prepend, Replace, Sequence};

pub use crate::inference::types::TokenId;

const SPACE_MARKER: char = '\u{2581}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenKind {
    const fn from_gguf(value: i64) -> Self {
        match value {
            2 => Self::Unknown,
            3 => Self::Control,
            4 => Self::UserDefined,
            5 => Self::Unused,
            6 => Self::Byte,
            _ => Self::Normal,
        }
    }

    const fn merges(self) -> bool {
        matches!(self, Self::Normal | Self::UserDefined)
    }
}

#[derive(Clone)]
pub struct Tokenizer {
    inner: tokenizers::Tokenizer,
    kinds: Vec<TokenKind>,
    bos: Option<TokenId>,
    unk: Option<TokenId>,
    end_of_generation: Vec<TokenId>,
    add_bos: bool,
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.kinds.len())
            .field("bos", &self.bos)
            .field("unk", &self.unk)
            .field("end_of_generation", &self.end_of_generation)
            .field("add_bos", &self.add_bos)
            .finish_non_exhaustive()
    }
}

impl Tokenizer {
    /// Build the vocabulary from parsed model metadata
    pub fn from_metadata(metadata: &Metadata) -> Result<Self> {
        match gguf::get_str(metadata, "tokenizer.ggml.model") {
            None | Some("llama") => {}
            Some(other) => {
                return Err(invalid(format!("unsupported tokenizer model '{other}'")));
            }
        }

        let pieces: Vec<&str> = gguf::get_array(metadata, "tokenizer.ggml.tokens")
            .ok_or_else(|| invalid("missing tokenizer.ggml.tokens"))?
            .iter()
            .map(gguf::as_str)
            .collect::<Option<_>>()
            .ok_or_else(|| invalid("tokenizer.ggml.tokens must hold strings"))?;
        if pieces.is_empty() {
            return Err(invalid("empty vocabulary"));
        }
        if u32::try_from(pieces.len()).is_err() {
            return Err(invalid("vocabulary too large"));
        }

        let scores: Vec<f32> = match gguf::get_array(metadata, "tokenizer.ggml.scores") {
            None => vec![0.0; pieces.len()],
            Some(values) if values.len() == pieces.len() => values
                .iter()
                .map(gguf::as_f32)
                .collect::<Option<_>>()
                .ok_or_else(|| invalid("tokenizer.ggml.scores must hold floats"))?,
            Some(_) => return Err(invalid("token score count does not match vocabulary")),
        };

        let kinds: Vec<TokenKind> = match gguf::get_array(metadata, "tokenizer.ggml.token_type") {
            None => vec![TokenKind::Normal; pieces.len()],
            Some(values) if values.len() == pieces.len() => values
                .iter()
                .map(|v| gguf::as_i64(v).map(TokenKind::from_gguf))
                .collect::<Option<_>>()
                .ok_or_else(|| invalid("tokenizer.ggml.token_type must hold integers"))?,
            Some(_) => return Err(invalid("token type count does not match vocabulary")),
        };

        let special = |key: &str| -> Result<Option<TokenId>> {
            match gguf::get_u64(metadata, key) {
                None => Ok(None),
                Some(id) if usize::try_from(id).is_ok_and(|i| i < pieces.len()) => {
                    Ok(u32::try_from(id).ok())
                }
                Some(id) => Err(invalid(format!("{key} {id} is outside the vocabulary"))),
            }
        };
        let bos = special("tokenizer.ggml.bos_token_id")?;
        let eos = special("tokenizer.ggml.eos_token_id")?;
        let eot = special("tokenizer.ggml.eot_token_id")?;
        let unk = special("tokenizer.ggml.unknown_token_id")?.or_else(|| {
            kinds
                .iter()
                .position(|k| *k == TokenKind::Unknown)
                .and_then(|i| u32::try_from(i).ok())
        });

        let mut vocab: HashMap<String, TokenId> = HashMap::with_capacity(pieces.len());
        for (id, piece) in (0u32..).zip(&pieces) {
            // Keep the lowest id for duplicated pieces
            vocab.entry((*piece).to_string()).or_insert(id);
        }
        let merges = merges_from_scores(&pieces, &scores, &kinds, &vocab);

        let mut builder = BPE::builder()
            .vocab_and_merges(vocab, merges)
            .byte_fallback(true)
            .fuse_unk(true);
        if let Some(id) = unk {
            builder = builder.unk_token(pieces[id as usize].to_string());
        }
        let model = builder
            .build()
            .map_err(|e| invalid(format!("cannot build vocabulary: {e}")))?;

        let mut inner = tokenizers::Tokenizer::new(model);
        let space = Replace::new(" ", SPACE_MARKER.to_string())
            .map_err(|e| invalid(format!("cannot build normalizer: {e}")))?;
        let mut normalizers: Vec<NormalizerWrapper> = Vec::with_capacity(2);
        if gguf::get_bool(metadata, "tokenizer.ggml.add_space_prefix").unwrap_or(true) {
            normalizers.push(Prepend::new(SPACE_MARKER.to_string()).into());
        }
        normalizers.push(space.into());
        inner.with_normalizer(Sequence::new(normalizers));

        let end_of_generation: Vec<TokenId> = eos.into_iter().chain(eot).collect();

        Ok(Self {
            inner,
            kinds,
            bos,
            unk,
            end_of_generation,
            add_bos: gguf::get_bool(metadata, "tokenizer.ggml.add_bos_token").unwrap_or(true),
        })
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub const fn bos_id(&self) -> Option<TokenId> {
        self.bos
    }

    #[must_use]
    pub fn is_end_of_generation(&self, id: TokenId) -> bool {
        self.end_of_generation.contains(&id)
    }

    /// Encode `text`, prefixing BOS when the vocabulary asks for it
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if self.add_bos {
            tokens.extend(self.bos);
        }
        if text.is_empty() {
            return Ok(tokens);
        }

        // Without an unknown piece the BPE model silently drops what it
        // cannot represent
        if self.unk.is_none() {
            self.check_encodable(text)?;
        }

        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EmberError::from(BackendError::Tokenize(e.to_string())))?;
        tokens.extend_from_slice(encoding.get_ids());
        Ok(tokens)
    }

    fn check_encodable(&self, text: &str) -> Result<()> {
        let mut buf = [0u8; 4];
        for c in text.chars() {
            let c = if c == ' ' { SPACE_MARKER } else { c };
            let piece = c.encode_utf8(&mut buf);
            if self.inner.token_to_id(piece).is_some() {
                continue;
            }
            let bytes_known = piece
                .bytes()
                .all(|b| self.inner.token_to_id(&format!("<0x{b:02X}>")).is_some());
            if !bytes_known {
                return Err(BackendError::Tokenize(format!(
                    "no token for {c:?} and the vocabulary has no byte fallback"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Raw bytes a token contributes to the output text
    fn piece_bytes(&self, id: TokenId) -> Vec<u8> {
        let Some(piece) = self.inner.id_to_token(id) else {
            return Vec::new();
        };
        match self.kinds.get(id as usize) {
            None | Some(TokenKind::Control | TokenKind::Unknown | TokenKind::Unused) => Vec::new(),
            Some(TokenKind::Byte) => parse_byte_piece(&piece).map(|b| vec![b]).unwrap_or_default(),
            Some(TokenKind::Normal | TokenKind::UserDefined) => {
                if Some(id) == self.bos || self.is_end_of_generation(id) {
                    return Vec::new();
                }
                piece.replace(SPACE_MARKER, " ").into_bytes()
            }
        }
    }

    /// Decode a whole sequence at once
    #[must_use]
    pub fn decode(&self, tokens: &[TokenId]) -> String {
        let mut decoder = StreamDecoder::default();
        let mut text: String = tokens.iter().map(|t| decoder.push(self, *t)).collect();
        text.push_str(&decoder.finish());
        text
    }
}

/// Merges ordered by the score of the merged piece, best first
fn merges_from_scores(
    pieces: &[&str],
    scores: &[f32],
    kinds: &[TokenKind],
    vocab: &HashMap<String, TokenId>,
) -> Vec<(String, String)> {
    let mut ranked: Vec<(f32, TokenId, String, String)> = Vec::new();
    for (id, piece) in (0u32..).zip(pieces) {
        let index = id as usize;
        if !kinds[index].merges() || vocab.get(*piece) != Some(&id) {
            continue;
        }
        for (split, _) in piece.char_indices().skip(1) {
            let (left, right) = piece.split_at(split);
            if vocab.contains_key(left) && vocab.contains_key(right) {
                ranked.push((scores[index], id, left.to_string(), right.to_string()));
            }
        }
    }

    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    ranked
        .into_iter()
        .map(|(_, _, left, right)| (left, right))
        .collect()
}

/// `<0x41>` style byte-fallback pieces
fn parse_byte_piece(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

fn invalid(message: impl Into<String>) -> EmberError {
    BackendError::InvalidContainer(message.into()).into()
}

/// Incremental detokenizer that never splits a UTF-8 sequence across pieces
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    /// Text completed by `id`; incomplete multi-byte sequences are held back
    pub fn push(&mut self, tokenizer: &Tokenizer, id: TokenId) -> String {
        self.pending.extend(tokenizer.piece_bytes(id));

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Sequence may still be completed by the next piece
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Flush bytes still held back at the end of generation
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
