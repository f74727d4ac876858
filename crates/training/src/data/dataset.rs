use std::{collections::BTreeSet, path::Path};

use serde::Deserialize;

use crate::TrainingError;

/// One labelled example as stored in the folds CSV.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpanRow {
    #[serde(default)]
    pub text: String,
    pub sentiment: String,
    #[serde(default)]
    pub selected_text: String,
    pub kfold: usize,
}

/// Reads every row of a CSV with `text`, `sentiment`, `selected_text` and `kfold`
/// columns; other columns are ignored.
pub fn load_rows(path: impl AsRef<Path>) -> Result<Vec<SpanRow>, TrainingError> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path).map_err(|err| {
        TrainingError::data(format!("failed to open {}: {}", path.display(), err))
    })?;

    let mut rows = Vec::new();
    for (line, record) in reader.deserialize::<SpanRow>().enumerate() {
        let row = record.map_err(|err| {
            TrainingError::data(format!(
                "{} row {}: {}",
                path.display(),
                line + 1,
                err
            ))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Splits rows into the training subset (`kfold != fold`) and the validation subset
/// (`kfold == fold`), preserving file order in both.
pub fn partition_fold(rows: &[SpanRow], fold: usize) -> (Vec<SpanRow>, Vec<SpanRow>) {
    rows.iter().cloned().partition(|row| row.kfold != fold)
}

/// Distinct fold ids present in `rows`.
pub fn fold_ids(rows: &[SpanRow]) -> BTreeSet<usize> {
    rows.iter().map(|row| row.kfold).collect()
}

/// A tokenized sample with fixed-length sequence fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedSample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub token_type_ids: Vec<u32>,
    pub start_position: u32,
    pub end_position: u32,
    /// Character offsets into `text`, one pair per position.
    pub offsets: Vec<(usize, usize)>,
    pub text: String,
    pub target: String,
    pub sentiment: String,
}

impl EncodedSample {
    pub fn seq_len(&self) -> usize {
        self.input_ids.len()
    }
}

/// In-memory collection of encoded samples sharing one sequence length.
#[derive(Debug, Clone, Default)]
pub struct SpanDataset {
    samples: Vec<EncodedSample>,
    seq_len: usize,
}

impl SpanDataset {
    pub fn from_samples(samples: Vec<EncodedSample>) -> Result<Self, TrainingError> {
        let seq_len = samples.first().map(EncodedSample::seq_len).unwrap_or(0);
        for (index, sample) in samples.iter().enumerate() {
            let lengths = [
                sample.input_ids.len(),
                sample.attention_mask.len(),
                sample.token_type_ids.len(),
                sample.offsets.len(),
            ];
            if lengths.iter().any(|len| *len != seq_len) {
                return Err(TrainingError::data(format!(
                    "sample {} has sequence fields of lengths {:?}, expected {}",
                    index, lengths, seq_len
                )));
            }
            if sample.start_position as usize >= seq_len || sample.end_position as usize >= seq_len
            {
                return Err(TrainingError::data(format!(
                    "sample {} targets ({}, {}) fall outside length {}",
                    index, sample.start_position, sample.end_position, seq_len
                )));
            }
        }
        Ok(Self { samples, seq_len })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn get(&self, index: usize) -> Option<&EncodedSample> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[EncodedSample] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn row(text: &str, kfold: usize) -> SpanRow {
        SpanRow {
            text: text.to_string(),
            sentiment: "neutral".to_string(),
            selected_text: text.to_string(),
            kfold,
        }
    }

    #[test]
    fn loads_rows_and_ignores_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folds.csv");
        fs::write(
            &path,
            "textID,text,selected_text,sentiment,kfold\n\
             a1,i love it,love,positive,0\n\
             b2,,,neutral,1\n",
        )
        .unwrap();

        let rows = load_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].selected_text, "love");
        assert_eq!(rows[0].sentiment, "positive");
        assert_eq!(rows[1].text, "");
        assert_eq!(rows[1].kfold, 1);
    }

    #[test]
    fn malformed_fold_is_a_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folds.csv");
        fs::write(&path, "text,selected_text,sentiment,kfold\nhi,hi,neutral,x\n").unwrap();

        assert!(matches!(load_rows(&path), Err(TrainingError::Data(_))));
    }

    #[test]
    fn partitions_by_fold_column() {
        let rows = vec![row("a", 0), row("b", 1), row("c", 0), row("d", 2)];
        let (train, valid) = partition_fold(&rows, 0);
        assert_eq!(train, vec![row("b", 1), row("d", 2)]);
        assert_eq!(valid, vec![row("a", 0), row("c", 0)]);
        assert_eq!(fold_ids(&rows).into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn dataset_rejects_ragged_samples() {
        let sample = EncodedSample {
            input_ids: vec![0, 1, 2],
            attention_mask: vec![1, 1, 1],
            token_type_ids: vec![0, 0, 0],
            start_position: 1,
            end_position: 2,
            offsets: vec![(0, 0); 3],
            text: String::new(),
            target: String::new(),
            sentiment: String::new(),
        };
        let mut ragged = sample.clone();
        ragged.attention_mask.pop();

        assert!(SpanDataset::from_samples(vec![sample.clone()]).is_ok());
        assert!(SpanDataset::from_samples(vec![sample, ragged]).is_err());
    }
}
