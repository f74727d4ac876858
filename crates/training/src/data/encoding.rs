use tokenizers::{
    models::bpe::BPE, normalizers::Lowercase, pre_tokenizers::byte_level::ByteLevel, Tokenizer,
};

use crate::{
    config::TokenizerConfig,
    data::dataset::{EncodedSample, SpanDataset, SpanRow},
    TrainingError,
};

/// Tokens placed before the text: `<s> sentiment </s> </s>`.
pub const PREFIX_TOKENS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub cls: u32,
    pub sep: u32,
    pub pad: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            cls: 0,
            pad: 1,
            sep: 2,
        }
    }
}

/// Turns CSV rows into fixed-length model inputs with span targets and offsets.
pub struct SpanEncoder {
    tokenizer: Tokenizer,
    special: SpecialTokens,
    max_len: usize,
}

impl SpanEncoder {
    pub fn new(tokenizer: Tokenizer, max_len: usize) -> Result<Self, TrainingError> {
        if max_len <= PREFIX_TOKENS + 1 {
            return Err(TrainingError::initialization(format!(
                "max_len {} leaves no room for text tokens",
                max_len
            )));
        }
        let defaults = SpecialTokens::default();
        let special = SpecialTokens {
            cls: tokenizer.token_to_id("<s>").unwrap_or(defaults.cls),
            sep: tokenizer.token_to_id("</s>").unwrap_or(defaults.sep),
            pad: tokenizer.token_to_id("<pad>").unwrap_or(defaults.pad),
        };
        Ok(Self {
            tokenizer,
            special,
            max_len,
        })
    }

    /// Loads a serialized tokenizer, or a byte-level BPE from `vocab` + `merges`.
    pub fn from_config(cfg: &TokenizerConfig, max_len: usize) -> Result<Self, TrainingError> {
        let tokenizer = if let Some(path) = &cfg.tokenizer_json {
            Tokenizer::from_file(path).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to load tokenizer json {}: {}",
                    path.display(),
                    err
                ))
            })?
        } else {
            let (Some(vocab), Some(merges)) = (&cfg.vocab, &cfg.merges) else {
                return Err(TrainingError::initialization(
                    "tokenizer requires `vocab` and `merges` when `tokenizer_json` is absent",
                ));
            };
            let bpe = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy())
                .build()
                .map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to load byte-level BPE from {} and {}: {}",
                        vocab.display(),
                        merges.display(),
                        err
                    ))
                })?;
            let mut tokenizer = Tokenizer::new(bpe);
            if cfg.lowercase {
                tokenizer.with_normalizer(Some(Lowercase));
            }
            tokenizer.with_pre_tokenizer(Some(ByteLevel::new(cfg.add_prefix_space, false, true)));
            tokenizer.with_decoder(Some(ByteLevel::default()));
            tokenizer
        };
        Self::new(tokenizer, max_len)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn encode_rows(&self, rows: &[SpanRow]) -> Result<SpanDataset, TrainingError> {
        let samples = rows
            .iter()
            .map(|row| self.encode(row))
            .collect::<Result<Vec<_>, _>>()?;
        SpanDataset::from_samples(samples)
    }

    pub fn encode(&self, row: &SpanRow) -> Result<EncodedSample, TrainingError> {
        let text = normalize_whitespace(&row.text);
        let target = normalize_whitespace(&row.selected_text);
        let text_chars: Vec<char> = text.chars().collect();
        let target_chars: Vec<char> = target.chars().collect();

        let mut char_targets = vec![false; text_chars.len()];
        if let Some((from, to)) = locate_target(&text_chars, &target_chars) {
            char_targets[from..to].iter_mut().for_each(|flag| *flag = true);
        }

        let encoding = self
            .tokenizer
            .encode_char_offsets(text.as_str(), false)
            .map_err(|err| TrainingError::data(format!("failed to tokenize '{}': {}", text, err)))?;

        let max_text_tokens = self.max_len - PREFIX_TOKENS - 1;
        let text_ids: Vec<u32> = encoding.get_ids().iter().copied().take(max_text_tokens).collect();
        let text_offsets: Vec<(usize, usize)> = encoding
            .get_offsets()
            .iter()
            .copied()
            .take(max_text_tokens)
            .collect();

        let covered: Vec<usize> = text_offsets
            .iter()
            .enumerate()
            .filter(|(_, (from, to))| {
                let to = (*to).min(char_targets.len());
                let from = (*from).min(to);
                char_targets[from..to].iter().any(|flag| *flag)
            })
            .map(|(index, _)| index)
            .collect();
        let (target_start, target_end) = match (covered.first(), covered.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => (0, 0),
        };

        let sentiment_id = self.sentiment_token(&row.sentiment)?;
        let mut input_ids = vec![self.special.cls, sentiment_id, self.special.sep, self.special.sep];
        input_ids.extend_from_slice(&text_ids);
        input_ids.push(self.special.sep);

        let mut offsets = vec![(0, 0); PREFIX_TOKENS];
        offsets.extend_from_slice(&text_offsets);
        offsets.push((0, 0));

        let used = input_ids.len();
        let mut attention_mask = vec![1u32; used];
        let token_type_ids = vec![0u32; self.max_len];

        let padding = self.max_len - used;
        input_ids.extend(std::iter::repeat(self.special.pad).take(padding));
        attention_mask.extend(std::iter::repeat(0).take(padding));
        offsets.extend(std::iter::repeat((0, 0)).take(padding));

        Ok(EncodedSample {
            input_ids,
            attention_mask,
            token_type_ids,
            start_position: (target_start + PREFIX_TOKENS) as u32,
            end_position: (target_end + PREFIX_TOKENS) as u32,
            offsets,
            text,
            target,
            sentiment: row.sentiment.clone(),
        })
    }

    fn sentiment_token(&self, sentiment: &str) -> Result<u32, TrainingError> {
        let encoding = self
            .tokenizer
            .encode(sentiment.trim(), false)
            .map_err(|err| {
                TrainingError::data(format!("failed to tokenize sentiment '{}': {}", sentiment, err))
            })?;
        encoding.get_ids().first().copied().ok_or_else(|| {
            TrainingError::data(format!("sentiment '{}' produced no tokens", sentiment))
        })
    }
}

/// Collapses whitespace runs to single spaces and prefixes one space.
pub fn normalize_whitespace(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len() + 1);
    for word in raw.split_whitespace() {
        normalized.push(' ');
        normalized.push_str(word);
    }
    if normalized.is_empty() {
        normalized.push(' ');
    }
    normalized
}

/// Character range `[from, to)` of the first occurrence of `target` (without its
/// leading space) in `text`.
fn locate_target(text: &[char], target: &[char]) -> Option<(usize, usize)> {
    let needle = target.get(1..).filter(|needle| !needle.is_empty())?;
    if needle.len() > text.len() {
        return None;
    }
    (0..=text.len() - needle.len())
        .find(|&start| &text[start..start + needle.len()] == needle)
        .map(|start| (start, start + needle.len()))
}
