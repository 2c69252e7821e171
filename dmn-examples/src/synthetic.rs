//! A toy question answering task used to exercise the model without a dataset.
//!
//! Each question asks for one of three attributes, the answer is one of the two values of this
//! attribute and is selected by the sign of the visual input: shifted up for the first value,
//! down for the second one. Solving the task requires both the question and the image.
use candle::{Device, Result, Tensor};
use dmn_vqa::config::Config;
use dmn_vqa::model::{Batch, Visual};
use dmn_vqa::word_table::WordTable;
use rand::{rngs::StdRng, Rng, SeedableRng};

const FILLERS: [&str; 4] = ["<pad>", "what", "is", "the"];
const ATTRIBUTES: [(&str, [&str; 2]); 3] = [
    ("color", ["red", "blue"]),
    ("shape", ["round", "square"]),
    ("size", ["big", "small"]),
];
const SHIFT: f32 = 0.5;

/// The vocabulary of the task, answers are equally frequent.
pub fn word_table() -> Result<WordTable> {
    let mut words = FILLERS.iter().map(|w| w.to_string()).collect::<Vec<_>>();
    for (attribute, values) in ATTRIBUTES.iter() {
        words.push(attribute.to_string());
        words.extend(values.iter().map(|v| v.to_string()));
    }
    let num_answers = (ATTRIBUTES.len() * 2) as f64;
    let frequencies = words
        .iter()
        .map(|w| {
            let is_answer = ATTRIBUTES.iter().any(|(_, vs)| vs.contains(&w.as_str()));
            if is_answer {
                1. / num_answers
            } else {
                0.
            }
        })
        .collect();
    WordTable::new(words, frequencies, None)
}

/// A sampled batch together with the plain text of its questions.
#[derive(Debug, Clone)]
pub struct Sample {
    pub batch: Batch,
    pub questions: Vec<String>,
}

#[derive(Debug)]
pub struct SyntheticVqa {
    words: WordTable,
    rng: StdRng,
    device: Device,
}

impl SyntheticVqa {
    pub fn new(seed: u64, device: &Device) -> Result<Self> {
        Ok(Self {
            words: word_table()?,
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        })
    }

    pub fn word_table(&self) -> &WordTable {
        &self.words
    }

    /// Samples a batch shaped for `cfg`: images when the backbone is trained, region
    /// features otherwise.
    pub fn sample(&mut self, cfg: &Config, batch_size: usize) -> Result<Sample> {
        if cfg.num_words != self.words.num_words() {
            candle::bail!(
                "the config expects {} words, the synthetic task has {}",
                cfg.num_words,
                self.words.num_words()
            )
        }
        let visual_dims = if cfg.train_cnn {
            vec![3, cfg.image_size, cfg.image_size]
        } else {
            let grid = cfg.feature_grid()?;
            vec![grid.len(), grid.channels]
        };
        let elem_count = visual_dims.iter().product::<usize>();

        let mut visual = Vec::with_capacity(batch_size * elem_count);
        let mut tokens = Vec::with_capacity(batch_size * cfg.max_ques_len);
        let mut lens = Vec::with_capacity(batch_size);
        let mut answers = Vec::with_capacity(batch_size);
        let mut questions = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let (attribute, values) = ATTRIBUTES[self.rng.random_range(0..ATTRIBUTES.len())];
            let value = self.rng.random_range(0..2);
            let shift = if value == 0 { SHIFT } else { -SHIFT };
            visual.extend((0..elem_count).map(|_| self.rng.random_range(-1f32..1.) + shift));

            let question = format!("what is the {attribute}?");
            let tokenized = self.words.tokenize(&question, cfg.max_ques_len)?;
            tokens.extend(tokenized.tokens);
            lens.push(tokenized.len);
            match self.words.index(values[value]) {
                Some(answer) => answers.push(answer),
                None => candle::bail!("unknown answer {}", values[value]),
            }
            questions.push(question);
        }
        let answer_weights = self
            .words
            .answer_weights(&answers, cfg.class_balancing_factor)?;

        let mut shape = vec![batch_size];
        shape.extend(visual_dims);
        let visual = Tensor::from_vec(visual, shape, &self.device)?;
        let visual = if cfg.train_cnn {
            Visual::Images(visual)
        } else {
            Visual::Features(visual)
        };
        let batch = Batch {
            visual,
            questions: Tensor::from_vec(tokens, (batch_size, cfg.max_ques_len), &self.device)?,
            question_lens: Tensor::new(lens.as_slice(), &self.device)?,
            answers: Some(Tensor::new(answers.as_slice(), &self.device)?),
            answer_weights: Some(Tensor::new(answer_weights.as_slice(), &self.device)?),
        };
        tracing::debug!(batch_size, train_cnn = cfg.train_cnn, "synthetic batch");
        Ok(Sample { batch, questions })
    }
}
