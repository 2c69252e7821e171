//! The word table shared by the questions and the answers.
//!
//! The table is read from a json file with the following layout, `vectors` being optional:
//!
//! ```json
//! {
//!   "words": ["<pad>", "what", "color", "red"],
//!   "frequencies": [0.0, 0.4, 0.3, 0.3],
//!   "vectors": [[0.0, 0.0], [0.1, 0.2], [0.3, 0.1], [0.2, 0.5]]
//! }
//! ```
use std::collections::HashMap;

use candle::{DType, Device, Result, Tensor};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
struct WordTableFile {
    words: Vec<String>,
    #[serde(default)]
    frequencies: Vec<f64>,
    #[serde(default)]
    vectors: Option<Vec<Vec<f32>>>,
}

#[derive(Debug, Clone)]
pub struct WordTable {
    words: Vec<String>,
    index: HashMap<String, u32>,
    frequencies: Vec<f64>,
    vectors: Option<Vec<Vec<f32>>>,
}

/// A tokenized question, padded to a fixed length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokenized {
    pub tokens: Vec<u32>,
    pub len: u32,
}

impl WordTable {
    /// Builds a table, missing frequencies are set to zero.
    pub fn new(
        words: Vec<String>,
        frequencies: Vec<f64>,
        vectors: Option<Vec<Vec<f32>>>,
    ) -> Result<Self> {
        if words.is_empty() {
            candle::bail!("the word table cannot be empty")
        }
        let frequencies = if frequencies.is_empty() {
            vec![0.; words.len()]
        } else if frequencies.len() == words.len() {
            frequencies
        } else {
            candle::bail!(
                "got {} frequencies for {} words",
                frequencies.len(),
                words.len()
            )
        };
        if let Some(vectors) = vectors.as_ref() {
            if vectors.len() != words.len() {
                candle::bail!("got {} vectors for {} words", vectors.len(), words.len())
            }
            let dim = vectors[0].len();
            if let Some(v) = vectors.iter().find(|v| v.len() != dim) {
                candle::bail!("inconsistent vector sizes in word table {} <> {dim}", v.len())
            }
        }
        let mut index = HashMap::with_capacity(words.len());
        for (i, word) in words.iter().enumerate() {
            if index.insert(word.clone(), i as u32).is_some() {
                candle::bail!("duplicate word in word table {word}")
            }
        }
        Ok(Self {
            words,
            index,
            frequencies,
            vectors,
        })
    }

    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path)?;
        let file: WordTableFile = serde_json::from_slice(&content)
            .map_err(|err| candle::Error::Msg(format!("invalid word table {path:?}: {err}")))?;
        Self::new(file.words, file.frequencies, file.vectors)
    }

    pub fn to_json_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let file = WordTableFile {
            words: self.words.clone(),
            frequencies: self.frequencies.clone(),
            vectors: self.vectors.clone(),
        };
        let content = serde_json::to_vec(&file)
            .map_err(|err| candle::Error::Msg(format!("cannot serialize word table: {err}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn word(&self, index: u32) -> Option<&str> {
        self.words.get(index as usize).map(|w| w.as_str())
    }

    pub fn index(&self, word: &str) -> Option<u32> {
        self.index.get(word).copied()
    }

    /// Splits a question in lowercase words and maps them to their indexes. Words missing from
    /// the table are skipped, the result is truncated or padded with index 0 to `max_len`.
    pub fn tokenize(&self, question: &str, max_len: usize) -> Result<Tokenized> {
        let mut tokens = question
            .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
            .filter(|w| !w.is_empty())
            .filter_map(|w| self.index(&w.to_lowercase()))
            .take(max_len)
            .collect::<Vec<_>>();
        if tokens.is_empty() {
            candle::bail!("no known word in question {question:?}")
        }
        let len = tokens.len() as u32;
        tokens.resize(max_len, 0);
        Ok(Tokenized { tokens, len })
    }

    /// `exp(-frequency * factor)` for each word, a factor of zero disables the balancing.
    pub fn class_weights(&self, factor: f64) -> Vec<f32> {
        self.frequencies
            .iter()
            .map(|f| (-f * factor).exp() as f32)
            .collect()
    }

    /// The class weights of a batch of answers.
    pub fn answer_weights(&self, answers: &[u32], factor: f64) -> Result<Vec<f32>> {
        answers
            .iter()
            .map(|&a| match self.frequencies.get(a as usize) {
                Some(f) => Ok((-f * factor).exp() as f32),
                None => candle::bail!("answer {a} is out of the word table"),
            })
            .collect()
    }

    /// The `(num_words, dim)` pretrained vectors if the table has some.
    pub fn embeddings(&self, dim: usize, dtype: DType, device: &Device) -> Result<Option<Tensor>> {
        let vectors = match self.vectors.as_ref() {
            None => return Ok(None),
            Some(vectors) => vectors,
        };
        if vectors[0].len() != dim {
            candle::bail!(
                "word vectors have {} dimensions, expected {dim}",
                vectors[0].len()
            )
        }
        let data = vectors.iter().flatten().copied().collect::<Vec<_>>();
        let tensor = Tensor::from_vec(data, (vectors.len(), dim), device)?.to_dtype(dtype)?;
        Ok(Some(tensor))
    }
}
