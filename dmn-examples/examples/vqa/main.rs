#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use clap::Parser;

use candle::{DType, D};
use dmn_examples::synthetic::SyntheticVqa;
use dmn_vqa::config::Config;
use dmn_vqa::params::Group;
use dmn_vqa::train::Trainer;
use dmn_vqa::QuestionAnswerer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// A json model config, a small config is used when not set.
    #[arg(long)]
    config: Option<String>,

    /// Train the backbone on raw images rather than using region features.
    #[arg(long)]
    train_cnn: bool,

    #[arg(long, default_value_t = 200)]
    steps: usize,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Evaluate on a fresh batch every n steps.
    #[arg(long, default_value_t = 50)]
    eval_every: usize,

    /// The seed to use when generating the synthetic data.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// Restore the full model from this file before training.
    #[arg(long)]
    load: Option<String>,

    /// Restore only the backbone weights from this file.
    #[arg(long)]
    load_backbone: Option<String>,

    /// The file where to save the trained weights, in safetensors format. The config is
    /// written next to it.
    #[arg(long)]
    save: Option<String>,
}

fn accuracy(model: &QuestionAnswerer, data: &mut SyntheticVqa, batch_size: usize) -> Result<f32> {
    let sample = data.sample(model.config(), batch_size)?;
    let output = model.forward(&sample.batch, false)?;
    let answers = match sample.batch.answers.as_ref() {
        Some(answers) => answers,
        None => anyhow::bail!("the synthetic batch has no answers"),
    };
    let accuracy = output
        .predicted
        .eq(answers)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?;
    Ok(accuracy)
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    let device = dmn_examples::device(args.cpu)?;
    let mut data = SyntheticVqa::new(args.seed, &device)?;
    let num_words = data.word_table().num_words();
    let mut config = match args.config.as_ref() {
        Some(path) => Config::from_json_file(path)?,
        None => Config {
            dim_hidden: 32,
            dim_embed: 16,
            max_ques_len: 8,
            memory_step: 3,
            memory_dropout: 0.1,
            ..Config::tiny(num_words)
        },
    };
    config.train_cnn |= args.train_cnn;
    if let Some(lr) = args.learning_rate {
        config.learning_rate = lr;
    }
    config.validate()?;

    let model = QuestionAnswerer::new(config.clone(), Some(data.word_table()), &device)?;
    let params = model.params();
    if let Some(path) = args.load.as_ref() {
        params.load(path)?;
        println!("loaded weights from {path}");
    }
    if let Some(path) = args.load_backbone.as_ref() {
        params.load_backbone(path)?;
        println!("loaded backbone weights from {path}");
    }
    println!(
        "model: {} backbone params, {} reasoning params, {} regions",
        params.num_parameters(Group::Backbone, "")?,
        params.num_parameters(Group::Reasoning, "")?,
        model.grid().len()
    );

    let mut trainer = Trainer::for_model(&model)?;
    let start = std::time::Instant::now();
    for step in 1..=args.steps {
        let sample = data.sample(&config, args.batch_size)?;
        let stats = trainer.train_step(&model, &sample.batch)?;
        if step % args.eval_every == 0 || step == args.steps {
            let accuracy = accuracy(&model, &mut data, args.batch_size)?;
            println!(
                "{step:5} loss: {:8.5} ce: {:8.5} grad norm: {:7.3} eval acc: {:5.2}% ({:.1}s)",
                stats.loss,
                stats.cross_entropy,
                stats.grad_norm,
                100. * accuracy,
                start.elapsed().as_secs_f32()
            );
        }
    }

    let sample = data.sample(&config, 4)?;
    let output = model.forward(&sample.batch, false)?;
    let predicted = output.predicted.to_vec1::<u32>()?;
    let confidence = output.confidence.to_vec1::<f32>()?;
    let gates = model.reason(&sample.batch, false)?.1.gates;
    let focus = match gates.last() {
        Some(gates) => gates.argmax(D::Minus1)?.to_vec1::<u32>()?,
        None => vec![0; predicted.len()],
    };
    let words = data.word_table();
    for (i, question) in sample.questions.iter().enumerate() {
        let answer = words.word(predicted[i]).unwrap_or("<unk>");
        println!(
            "{question} -> {answer} ({:.2}, last hop attends to region {})",
            confidence[i], focus[i]
        );
    }

    if let Some(save) = args.save {
        println!("saving trained weights in {save}");
        params.save(&save)?;
        let config_path = std::path::Path::new(&save).with_extension("json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;
    }
    Ok(())
}
