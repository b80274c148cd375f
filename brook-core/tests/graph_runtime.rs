//! Graph-level behavior: shutdown, backpressure, error propagation.

use std::thread;
use std::time::Duration;

use brook_core::chain::Chain;
use brook_core::component::{Node, NodeState};
use brook_core::config::RuntimeConfig;
use brook_core::packet::{Packet, Payload, Scalar};
use brook_core::pipe::{Pipe, PipeState};
use brook_core::stream::{
    CutterOptions, ElementFrameCutter, FrameDissolver, ReaderOptions, StreamReader, write_wave,
};

fn cfg() -> RuntimeConfig {
    RuntimeConfig {
        timeout_secs: 5,
        ..Default::default()
    }
}

#[test]
fn test_graceful_shutdown_terminates_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("long.wav");
    write_wave(&vec![1000i16; 16000 * 30], &path, 16000, 1).unwrap();

    let config = cfg();
    let reader = StreamReader::new(
        &path,
        ReaderOptions {
            chunk_size: Some(480),
            // Real-time pacing keeps the stream alive until we stop it.
            simulate: true,
            ..Default::default()
        },
        config.clone(),
    )
    .unwrap();
    let cutter = ElementFrameCutter::new(
        CutterOptions {
            batch_size: 1,
            ..Default::default()
        },
        config.clone(),
    )
    .unwrap();
    let dissolver = FrameDissolver::new(None, "data", config.clone());

    let mut chain = Chain::new("shutdown");
    chain.add(reader, false).unwrap();
    chain.add(cutter, false).unwrap();
    chain.add(dissolver, false).unwrap();
    chain.start(None).unwrap();

    thread::sleep(Duration::from_millis(300));
    chain.stop().unwrap();
    chain.wait().unwrap();

    assert!(chain.is_terminated());
    for i in 0..chain.len() {
        assert_eq!(chain.node(i).unwrap().state(), NodeState::Terminated);
    }
}

#[test]
fn test_failure_propagates_downstream() {
    let config = cfg();
    let input = Pipe::new("source", &config);
    input
        .put(Packet::new(
            "data",
            Payload::Vector(ndarray::arr1(&[1.0f32, 2.0])),
            0,
            0,
        ))
        .unwrap();

    let mut first = FrameDissolver::new(None, "data", config.clone());
    let mut second = ElementFrameCutter::new(
        CutterOptions {
            batch_size: 1,
            width: 4,
            shift: 4,
            ..Default::default()
        },
        config.clone(),
    )
    .unwrap();

    first.start(vec![input.clone()]).unwrap();
    second.start(vec![first.out_pipe()]).unwrap();
    thread::sleep(Duration::from_millis(100));

    // Simulate an upstream failure.
    input.kill();

    first.wait().unwrap();
    second.wait().unwrap();
    assert_eq!(first.state(), NodeState::Wrong);
    assert_eq!(second.state(), NodeState::Wrong);
    assert_eq!(second.out_pipe().state(), PipeState::Wrong);
}

#[test]
fn test_backpressure_stalls_the_producer() {
    let config = RuntimeConfig {
        timeout_secs: 10,
        capacity: 8,
        ..Default::default()
    };
    let input = Pipe::new("source", &config);

    let mut dissolver = FrameDissolver::new(None, "data", config.clone());
    // Strand the output: the stage must retry-later instead of emitting, so
    // its bounded input eventually refuses more data.
    dissolver.out_pipe().block();
    dissolver.start(vec![input.clone()]).unwrap();

    let producer = {
        let input = input.clone();
        thread::spawn(move || {
            for cid in 0..64u64 {
                input
                    .put(Packet::new(
                        "data",
                        Payload::Element(Scalar::F32(cid as f32)),
                        cid,
                        0,
                    ))
                    .unwrap();
            }
            input.stop();
        })
    };

    thread::sleep(Duration::from_millis(300));
    // The producer is stuck behind the full input queue.
    assert!(!producer.is_finished());
    assert!(input.is_full());

    dissolver.out_pipe().unblock();
    producer.join().unwrap();
    dissolver.wait().unwrap();

    let groups = dissolver.out_pipe().to_list().unwrap();
    assert_eq!(groups[0].len(), 64);
}

#[test]
fn test_endpoint_positions_survive_a_chain() {
    let config = cfg();
    let input = Pipe::new("source", &config);
    for cid in 0..8u64 {
        input
            .put(Packet::new(
                "data",
                Payload::Element(Scalar::I16(cid as i16)),
                cid,
                0,
            ))
            .unwrap();
        if cid == 3 {
            input.put(Packet::endpoint(cid, 0)).unwrap();
        }
    }
    input.stop();

    let mut chain = Chain::new("endpoints");
    chain
        .add(
            ElementFrameCutter::new(
                CutterOptions {
                    batch_size: 1,
                    width: 2,
                    shift: 2,
                    ..Default::default()
                },
                config.clone(),
            )
            .unwrap(),
            false,
        )
        .unwrap();
    chain
        .add(FrameDissolver::new(None, "data", config.clone()), false)
        .unwrap();
    chain.start(Some(input)).unwrap();
    chain.wait().unwrap();

    let groups = chain.out_pipe().unwrap().to_list().unwrap();
    // Elements 0..4 before the endpoint, 4..8 after; both utterances are
    // whole frames of two samples.
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].len(), 4);
    assert_eq!(groups[1].len(), 4);
}
