//! Stream a wave file through the recognizer and print hypotheses as they
//! arrive.
//!
//! The acoustic stage here forwards the processed features to the decoder
//! unchanged (optionally through softmax/log); plug a real network in
//! through the `brook_core::estimator` API when embedding the library.

mod config;

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use color_eyre::eyre::{eyre, Context, Result};
use ndarray::Array2;
use tracing_subscriber::EnvFilter;

use brook_core::chain::Chain;
use brook_core::decoder::{DecoderOptions, WfstDecoder};
use brook_core::dsp::WindowKind;
use brook_core::estimator::{AcousticEstimator, EstimatorOptions};
use brook_core::feature::{
    shared, FeatureProcessor, FrameTraits, MfccExtractor, MfccOptions, ProcessorOptions,
    SlidingCmvn,
};
use brook_core::matio;
use brook_core::pipe::PipeState;
use brook_core::stream::{CutterOptions, ElementFrameCutter, ReaderOptions, StreamReader};

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Streaming speech recognizer", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Wave file to decode (overrides the config)
    #[arg(short, long)]
    wav: Option<PathBuf>,

    /// Enable verbose diagnostic output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = CliConfig::from_file(&args.config)?;
    let wave_file = args
        .wav
        .or_else(|| config.wave_file.clone())
        .ok_or_else(|| eyre!("no wave file given (use --wav or set wave_file in the config)"))?;

    let runtime = config.runtime.clone().validated()?;

    let reader = StreamReader::new(
        &wave_file,
        ReaderOptions {
            chunk_size: Some(config.reader.chunk_size),
            simulate: config.reader.simulate,
            ..Default::default()
        },
        runtime.clone(),
    )?;

    let cutter = ElementFrameCutter::new(
        CutterOptions {
            batch_size: config.frame.batch_size,
            width: config.frame.width,
            shift: config.frame.shift,
            ..Default::default()
        },
        runtime.clone(),
    )?;

    let window = WindowKind::from_str(&config.mfcc.window)?;
    let mfcc = MfccExtractor::new(
        MfccOptions {
            frame: FrameTraits {
                frame_dim: config.frame.width,
                batch_size: config.frame.batch_size,
                dither: config.mfcc.dither,
                dither_seed: config.mfcc.dither_seed,
                preemph_coeff: config.mfcc.preemph_coeff,
                remove_dc: config.mfcc.remove_dc,
                window,
                ..Default::default()
            },
            num_bins: config.mfcc.num_bins,
            num_ceps: config.mfcc.num_ceps,
            low_freq: config.mfcc.low_freq,
            high_freq: config.mfcc.high_freq,
            cepstral_lifter: config.mfcc.cepstral_lifter,
            use_energy: config.mfcc.use_energy,
            ..Default::default()
        },
        runtime.clone(),
    )?;

    let mut cmvns = Vec::new();
    if config.processor.cmvn_width > 0 {
        let mut cmvn =
            SlidingCmvn::new(config.processor.cmvn_width, config.processor.cmvn_std, None);
        if let Some(stats_path) = &config.processor.global_stats {
            let stats = matio::load_global_stats(stats_path, None)
                .wrap_err("loading global CMVN statistics")?;
            cmvn = cmvn.with_global_stats(stats)?;
        }
        cmvns.push(shared(cmvn));
    }
    let lda = match &config.processor.lda {
        Some(path) => {
            Some(matio::load_lda_matrix(path).wrap_err("loading the LDA transform")?)
        }
        None => None,
    };
    let processor = FeatureProcessor::new(
        ProcessorOptions {
            batch_size: config.processor.batch_size,
            delta: config.processor.delta,
            delta_window: config.processor.delta_window,
            splice_left: config.processor.splice_left,
            splice_right: config.processor.splice_right,
            lda,
            cmvns,
            okey: "feat".to_string(),
            ..Default::default()
        },
        runtime.clone(),
    )?;

    let estimator = AcousticEstimator::new(
        Box::new(|feats: &Array2<f32>| Ok(feats.clone())),
        EstimatorOptions {
            left_context: config.estimator.left_context,
            right_context: config.estimator.right_context,
            apply_softmax: config.estimator.apply_softmax,
            apply_log: config.estimator.apply_log,
            ..Default::default()
        },
        runtime.clone(),
    );

    let decoder = WfstDecoder::new(
        DecoderOptions {
            cmd_root: config.decoder.cmd_root.clone(),
            symbol_table: config.decoder.symbol_table.clone(),
            silence_phones: config.decoder.silence_phones.clone(),
            frame_shift_sec: config.decoder.frame_shift_sec,
            tmodel: config.decoder.tmodel.clone(),
            graph: config.decoder.graph.clone(),
            word_boundary: config.decoder.word_boundary.clone(),
            n_bests: config.decoder.n_bests,
            beam: config.decoder.beam,
            max_active: config.decoder.max_active,
            min_active: config.decoder.min_active,
            lattice_beam: config.decoder.lattice_beam,
            prune_interval: config.decoder.prune_interval,
            acoustic_scale: config.decoder.acoustic_scale,
            lm_scale: config.decoder.lm_scale,
            allow_partial: config.decoder.allow_partial,
            max_batch_size: config.decoder.max_batch_size,
            pdf_dim: config.decoder.pdf_dim,
            ..Default::default()
        },
        runtime.clone(),
    )?;

    let mut chain = Chain::new("decode");
    chain.add(reader, false)?;
    chain.add(cutter, false)?;
    chain.add(mfcc, false)?;
    chain.add(processor, false)?;
    chain.add(estimator, false)?;
    chain.add(decoder, false)?;

    chain.start(None)?;
    let tail = chain.out_pipe()?;

    // Print hypotheses as they appear; an endpoint finishes the line.
    loop {
        match tail.state() {
            PipeState::Wrong => break,
            PipeState::Terminated if tail.is_empty() => break,
            _ => {}
        }
        match tail.try_get() {
            Ok(Some(packet)) => {
                if packet.is_endpoint() {
                    if let Some(text) = packet.main().and_then(|p| p.as_text()) {
                        println!("\r{text}");
                    } else {
                        println!();
                    }
                } else if let Some(text) = packet.main().and_then(|p| p.as_text()) {
                    print!("\r{text}");
                    use std::io::Write as _;
                    std::io::stdout().flush().ok();
                }
            }
            Ok(None) => std::thread::sleep(runtime.timescale()),
            Err(_) => break,
        }
    }

    chain.wait()?;
    Ok(())
}
