use anyhow::Result;
use tch::Device;

mod config;
mod dataset;
mod generate;
mod model;
mod tokenizer;
mod train;

use config::{ModelConfig, TrainConfig};
use dataset::Corpus;
use generate::SequenceStream;
use tokenizer::Tokenizer;
use train::{ConsoleSink, Trainer};

/// Path to the preprocessed corpus: one fixed-width DNA window per line,
/// produced by the upstream chunking stage.
const CORPUS_PATH: &str = "data/genome_windows.txt";

fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    let device = Device::cuda_if_available();
    log::info!("training on {:?}", device);

    let model_config = ModelConfig::default();
    let train_config = TrainConfig::default();
    let tokenizer = Tokenizer::new();
    let corpus = Corpus::from_file(CORPUS_PATH, &tokenizer, train_config.train_ratio)?;
    log::info!(
        "corpus: {} windows ({} train / {} validation)",
        corpus.len(),
        corpus.train_lines(),
        corpus.validation_lines()
    );

    let mut trainer = Trainer::new(device, corpus, model_config, train_config)?;
    let mut sink = ConsoleSink;
    trainer.train(&mut sink)?;
    let (test_loss, test_acc) = trainer.test(&mut sink);
    log::info!("held-out test: loss {:.4}, accuracy {:.4}", test_loss, test_acc);

    // Print a sampled fragment as a smoke check on the trained model.
    let stream = SequenceStream::new(trainer.model(), &tokenizer, "ACGT", trainer.device(), 1.0, 256)?;
    let sampled: String = stream.collect();
    log::info!("sampled fragment: {}", sampled);

    Ok(())
}
