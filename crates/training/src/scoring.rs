use std::collections::HashSet;

/// Token positions chosen by independent arg-max over the start and end scores.
///
/// `end` may precede `start`; [`extract_span_text`] clamps it when the span is
/// turned back into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanPrediction {
    pub start: usize,
    pub end: usize,
}

impl SpanPrediction {
    /// The prediction with `end` raised to `start` when it points before it.
    pub fn clamped(self) -> Self {
        Self {
            start: self.start,
            end: self.end.max(self.start),
        }
    }
}

/// Picks the first maximum of each probability vector.
pub fn predict_span(start_probs: &[f32], end_probs: &[f32]) -> SpanPrediction {
    SpanPrediction {
        start: first_argmax(start_probs),
        end: first_argmax(end_probs),
    }
}

fn first_argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (idx, value) in values.iter().enumerate() {
        if *value > values[best] {
            best = idx;
        }
    }
    best
}

/// Concatenates the characters covered by the offsets of tokens `start..=end`.
///
/// `end < start` is treated as `end == start`. Offsets are character positions in
/// `text`; zero-width pairs (special and padding tokens) and positions outside the
/// offset table contribute nothing.
pub fn extract_span_text(text: &str, start: usize, end: usize, offsets: &[(usize, usize)]) -> String {
    let end = end.max(start);
    let chars: Vec<char> = text.chars().collect();
    let mut output = String::new();

    for &(from, to) in offsets.iter().skip(start).take(end - start + 1) {
        let from = from.min(chars.len());
        let to = to.min(chars.len());
        if from < to {
            output.extend(&chars[from..to]);
        }
    }

    output
}

/// Jaccard similarity of the whitespace-separated token sets of two strings.
///
/// Two strings without any tokens are a perfect match.
pub fn character_overlap_score(predicted: &str, target: &str) -> f64 {
    let a: HashSet<&str> = predicted.split_whitespace().collect();
    let b: HashSet<&str> = target.split_whitespace().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Scores one sample from its start/end probabilities.
pub fn score_sample(
    text: &str,
    target: &str,
    start_probs: &[f32],
    end_probs: &[f32],
    offsets: &[(usize, usize)],
) -> f64 {
    let prediction = predict_span(start_probs, end_probs);
    let predicted = extract_span_text(text, prediction.start, prediction.end, offsets);
    character_overlap_score(&predicted, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = " my day was great";
    const OFFSETS: [(usize, usize); 8] = [
        (0, 0),
        (0, 0),
        (0, 0),
        (0, 0),
        (0, 3),
        (3, 7),
        (7, 11),
        (11, 17),
    ];

    #[test]
    fn jaccard_is_one_for_two_empty_strings() {
        assert_eq!(character_overlap_score("", ""), 1.0);
        assert_eq!(character_overlap_score("   ", "\t"), 1.0);
    }

    #[test]
    fn jaccard_is_zero_when_only_one_side_is_empty() {
        assert_eq!(character_overlap_score("", "happy"), 0.0);
        assert_eq!(character_overlap_score("happy", ""), 0.0);
    }

    #[test]
    fn jaccard_is_symmetric_and_bounded() {
        let pairs = [
            ("so happy today", "happy"),
            ("not bad at all", "bad at"),
            ("a a a b", "b c"),
            ("Happy", "happy"),
        ];
        for (a, b) in pairs {
            let forward = character_overlap_score(a, b);
            let backward = character_overlap_score(b, a);
            assert_eq!(forward, backward);
            assert!((0.0..=1.0).contains(&forward));
        }
        assert!((character_overlap_score("so happy today", "happy") - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(character_overlap_score("a a a b", "b c"), 1.0 / 3.0);
    }

    #[test]
    fn extracts_characters_covered_by_token_range() {
        assert_eq!(extract_span_text(TEXT, 6, 7, &OFFSETS), " was great");
        assert_eq!(extract_span_text(TEXT, 4, 4, &OFFSETS), " my");
    }

    #[test]
    fn reversed_range_collapses_to_start_token() {
        assert_eq!(
            extract_span_text(TEXT, 7, 2, &OFFSETS),
            extract_span_text(TEXT, 7, 7, &OFFSETS)
        );
        assert_eq!(extract_span_text(TEXT, 5, 4, &OFFSETS), " day");
    }

    #[test]
    fn special_tokens_and_out_of_range_positions_yield_nothing() {
        assert_eq!(extract_span_text(TEXT, 0, 3, &OFFSETS), "");
        assert_eq!(extract_span_text(TEXT, 7, 20, &OFFSETS), " great");
        assert_eq!(extract_span_text(TEXT, 30, 31, &OFFSETS), "");
    }

    #[test]
    fn offsets_are_character_positions() {
        let text = " café au lait";
        let offsets = [(0, 5), (5, 8), (8, 13)];
        assert_eq!(extract_span_text(text, 0, 0, &offsets), " café");
        assert_eq!(extract_span_text(text, 1, 2, &offsets), " au lait");
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        let prediction = predict_span(&[0.1, 0.4, 0.4, 0.1], &[0.7, 0.1, 0.1, 0.1]);
        assert_eq!(prediction, SpanPrediction { start: 1, end: 0 });
        assert_eq!(prediction.clamped(), SpanPrediction { start: 1, end: 1 });
    }

    #[test]
    fn scores_sample_from_probabilities() {
        let mut start = vec![0.0f32; 8];
        let mut end = vec![0.0f32; 8];
        start[6] = 1.0;
        end[7] = 1.0;
        assert_eq!(score_sample(TEXT, "was great", &start, &end, &OFFSETS), 1.0);

        end = vec![0.0f32; 8];
        end[4] = 1.0;
        // reversed span keeps only " was"
        assert_eq!(score_sample(TEXT, "was great", &start, &end, &OFFSETS), 0.5);
    }
}
