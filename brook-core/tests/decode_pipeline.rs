//! End-to-end decode: wave file -> frames -> MFCC -> context processing ->
//! acoustic estimation -> WFST decoder child (stubbed) -> transcript.

use std::io::Write;
use std::path::{Path, PathBuf};

use brook_core::chain::Chain;
use brook_core::config::RuntimeConfig;
use brook_core::decoder::{dump_text_pipe, DecoderOptions, WfstDecoder};
use brook_core::estimator::{AcousticEstimator, EstimatorOptions};
use brook_core::feature::{FrameTraits, MfccExtractor, MfccOptions};
use brook_core::feature::{FeatureProcessor, ProcessorOptions};
use brook_core::stream::{write_wave, CutterOptions, ElementFrameCutter, ReaderOptions, StreamReader};
use ndarray::Array2;

fn write_stub(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("exkaldi-online-decoder");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    file.write_all(body.as_bytes()).unwrap();
    drop(file);
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[test]
fn test_single_file_decode_happy_path() {
    let dir = tempfile::tempdir().unwrap();

    // An utterance worth exactly 20 whole frames at 400/160.
    let samples: Vec<i16> = (0..400 + 160 * 19)
        .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
        .collect();
    let wav_path = dir.path().join("utterance.wav");
    write_wave(&samples, &wav_path, 16000, 1).unwrap();

    // The stubbed beam search answers one partial per probability chunk,
    // then the n-best block and the final marker.
    write_stub(
        dir.path(),
        "echo '-1 3 4 5 6'\necho '-2 3 4 5 6'\necho '-3'\ncat >/dev/null\n",
    );
    let words_path = dir.path().join("words.txt");
    std::fs::write(
        &words_path,
        "<eps> 0\n<UNK> 1\nTHE 3\nQUICK 4\nBROWN 5\nFOX 6\n",
    )
    .unwrap();

    let config = RuntimeConfig {
        timeout_secs: 10,
        ..Default::default()
    };

    let reader = StreamReader::new(
        &wav_path,
        ReaderOptions {
            chunk_size: Some(480),
            simulate: false,
            ..Default::default()
        },
        config.clone(),
    )
    .unwrap();
    let cutter = ElementFrameCutter::new(
        CutterOptions {
            batch_size: 10,
            width: 400,
            shift: 160,
            ..Default::default()
        },
        config.clone(),
    )
    .unwrap();
    let mfcc = MfccExtractor::new(
        MfccOptions {
            frame: FrameTraits {
                dither: 0.0,
                batch_size: 10,
                ..Default::default()
            },
            ..Default::default()
        },
        config.clone(),
    )
    .unwrap();
    // MFCC(13) + delta + delta-delta with a 10-frame symmetric splice.
    let processor = FeatureProcessor::new(
        ProcessorOptions {
            batch_size: 8,
            delta: 2,
            splice_left: 10,
            splice_right: 10,
            okey: "feat".to_string(),
            ..Default::default()
        },
        config.clone(),
    )
    .unwrap();
    let estimator = AcousticEstimator::new(
        Box::new(|feats: &Array2<f32>| Ok(feats.clone())),
        EstimatorOptions {
            apply_log: false,
            ..Default::default()
        },
        config.clone(),
    );
    let decoder = WfstDecoder::new(
        DecoderOptions {
            cmd_root: dir.path().to_path_buf(),
            symbol_table: words_path,
            tmodel: dir.path().join("final.mdl"),
            graph: dir.path().join("HCLG.fst"),
            ..Default::default()
        },
        config.clone(),
    )
    .unwrap();

    let mut chain = Chain::new("decode");
    chain.add(reader, false).unwrap();
    chain.add(cutter, false).unwrap();
    chain.add(mfcc, false).unwrap();
    chain.add(processor, false).unwrap();
    chain.add(estimator, false).unwrap();
    chain.add(decoder, false).unwrap();

    chain.start(None).unwrap();
    chain.wait().unwrap();

    let tail = chain.out_pipe().unwrap();
    let transcript = dump_text_pipe(&tail, None, false, "\n").unwrap();
    assert_eq!(transcript, "THE QUICK BROWN FOX");
}
