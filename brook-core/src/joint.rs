//! Joints: nodes that split, replicate, combine or merge packet streams.
//!
//! Multi-input joints re-align their inputs by chunk id before producing:
//! packets older than the frontier are dropped, a missing chunk id means
//! retry-later, and an endpoint counts as an aligned element that is emitted
//! once it has been seen on every input.

use std::time::Duration;

use crate::component::{InputArity, Node, StageCore, StageContext, Worker};
use crate::config::RuntimeConfig;
use crate::errors::{BrookError, GraphError, Result};
use crate::packet::{Packet, Payload};
use crate::pipe::PipeState;

/// The slot list of one packet, as seen by joint rules.
pub type Slots = Vec<(String, Payload)>;

/// Rule mapping one slot list to another (1 -> 1).
pub type MapFn = dyn FnMut(Slots) -> Result<Slots> + Send;
/// Rule splitting one slot list into one list per output (1 -> N).
pub type SplitFn = dyn FnMut(Slots) -> Result<Vec<Slots>> + Send;
/// Rule combining one slot list per input into a single output (N -> 1).
pub type CombineFn = dyn FnMut(Vec<Slots>) -> Result<Slots> + Send;

/// A routing node. Construct with one of [`Joint::mapper`],
/// [`Joint::splitter`], [`Joint::replicator`], [`Joint::combiner`] or
/// [`Joint::merger`].
pub struct Joint {
    core: StageCore,
}

impl Joint {
    /// 1 -> 1: apply a transformation to each packet's slots, preserving
    /// chunk id and producer id.
    pub fn mapper(config: RuntimeConfig, map: Box<MapFn>) -> Self {
        let core = StageCore::new(
            "Mapper",
            config,
            None,
            Vec::new(),
            InputArity::Exactly(1),
            1,
            MapWorker { map },
        );
        Self { core }
    }

    /// 1 -> N: split each packet into one packet per output by rule.
    pub fn splitter(config: RuntimeConfig, out_nums: usize, split: Box<SplitFn>) -> Self {
        assert!(out_nums > 1, "a splitter needs at least two outputs");
        let core = StageCore::new(
            "Splitter",
            config,
            None,
            Vec::new(),
            InputArity::Exactly(1),
            out_nums,
            FanoutWorker {
                split: Some(split),
                out_nums,
            },
        );
        Self { core }
    }

    /// 1 -> N: deep-copy each packet to every output.
    pub fn replicator(config: RuntimeConfig, out_nums: usize) -> Self {
        assert!(out_nums > 1, "a replicator needs at least two outputs");
        let core = StageCore::new(
            "Replicator",
            config,
            None,
            Vec::new(),
            InputArity::Exactly(1),
            out_nums,
            FanoutWorker {
                split: None,
                out_nums,
            },
        );
        Self { core }
    }

    /// N -> 1: align inputs by chunk id and combine with a rule.
    pub fn combiner(config: RuntimeConfig, combine: Box<CombineFn>) -> Self {
        let core = StageCore::new(
            "Combiner",
            config,
            None,
            Vec::new(),
            InputArity::AtLeast(2),
            1,
            AlignWorker {
                combine: Some(combine),
            },
        );
        Self { core }
    }

    /// N -> 1: align inputs by chunk id and take the union of their keys.
    /// Fails with `KeyCollision` if any key appears on more than one input.
    pub fn merger(config: RuntimeConfig) -> Self {
        let core = StageCore::new(
            "Merger",
            config,
            None,
            Vec::new(),
            InputArity::AtLeast(2),
            1,
            AlignWorker { combine: None },
        );
        Self { core }
    }
}

impl Node for Joint {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

struct MapWorker {
    map: Box<MapFn>,
}

impl Worker for MapWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            match ctx.decide_action()? {
                crate::component::Action::Proceed => {
                    let packet = ctx.get_packet()?;
                    if packet.is_endpoint() {
                        ctx.put_packet(packet)?;
                        continue;
                    }
                    let cid = packet.cid();
                    let producer = packet.producer();
                    let slots = (self.map)(packet.into_slots())?;
                    ctx.put_packet(Packet::from_slots(slots, cid, producer))?;
                }
                crate::component::Action::Final => {
                    ctx.put_packet(Packet::endpoint(u64::MAX, ctx.id()))?;
                    ctx.out_pipe().stop();
                    return Ok(());
                }
                crate::component::Action::Stopped => return Ok(()),
                crate::component::Action::RetryLater => ctx.yield_now(),
            }
        }
    }
}

struct FanoutWorker {
    // None means replicate.
    split: Option<Box<SplitFn>>,
    out_nums: usize,
}

impl FanoutWorker {
    fn outputs_writable(&self, ctx: &StageContext) -> Option<bool> {
        for out in ctx.out_pipes() {
            match out.state() {
                PipeState::Wrong | PipeState::Terminated => return None,
                PipeState::Stranded => return Some(false),
                _ => {
                    if out.is_full() {
                        return Some(false);
                    }
                }
            }
        }
        Some(true)
    }
}

impl Worker for FanoutWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            let writable = match self.outputs_writable(ctx) {
                Some(w) => w,
                None => {
                    // A dead output takes the whole fanout down.
                    for out in ctx.out_pipes() {
                        if !out.state_is(&[PipeState::Wrong, PipeState::Terminated]) {
                            out.kill();
                        }
                    }
                    return Ok(());
                }
            };
            if !writable {
                ctx.yield_now();
                continue;
            }
            match ctx.decide_action()? {
                crate::component::Action::Proceed => {
                    let packet = ctx.get_packet()?;
                    if packet.is_endpoint() {
                        for i in 0..self.out_nums {
                            ctx.put_packet_to(i, Packet::endpoint(packet.cid(), packet.producer()))?;
                        }
                        continue;
                    }
                    let cid = packet.cid();
                    let producer = packet.producer();
                    match &mut self.split {
                        Some(split) => {
                            let parts = split(packet.into_slots())?;
                            if parts.len() != self.out_nums {
                                return Err(GraphError::InputArity {
                                    name: ctx.name().to_string(),
                                    expected: self.out_nums,
                                    actual: parts.len(),
                                }
                                .into());
                            }
                            for (i, slots) in parts.into_iter().enumerate() {
                                ctx.put_packet_to(i, Packet::from_slots(slots, cid, producer))?;
                            }
                        }
                        None => {
                            for i in 0..self.out_nums {
                                ctx.put_packet_to(i, packet.clone())?;
                            }
                        }
                    }
                }
                crate::component::Action::Final => {
                    for i in 0..self.out_nums {
                        ctx.put_packet_to(i, Packet::endpoint(u64::MAX, ctx.id()))?;
                        ctx.out_pipes()[i].stop();
                    }
                    return Ok(());
                }
                crate::component::Action::Stopped => return Ok(()),
                crate::component::Action::RetryLater => ctx.yield_now(),
            }
        }
    }
}

struct AlignWorker {
    // None means merge by key union.
    combine: Option<Box<CombineFn>>,
}

impl Worker for AlignWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        let n = ctx.in_pipes().len();
        let mut held: Vec<Option<Packet>> = vec![None; n];
        let mut done = vec![false; n];
        let mut starving = Duration::ZERO;

        loop {
            match ctx.out_pipe().state() {
                PipeState::Wrong => {
                    for inp in ctx.in_pipes() {
                        if !inp.state_is(&[PipeState::Wrong, PipeState::Terminated]) {
                            inp.kill();
                        }
                    }
                    return Ok(());
                }
                PipeState::Terminated => return Ok(()),
                _ => {}
            }

            // Refill the per-input head slots.
            let mut progressed = false;
            for i in 0..n {
                if held[i].is_some() || done[i] {
                    continue;
                }
                match ctx.in_pipes()[i].try_get() {
                    Ok(Some(packet)) => {
                        held[i] = Some(packet);
                        progressed = true;
                    }
                    Ok(None) => {}
                    Err(BrookError::Graph(GraphError::NoMoreData { .. })) => {
                        done[i] = true;
                        progressed = true;
                    }
                    Err(err) => {
                        for pipe in ctx.in_pipes().iter().chain(ctx.out_pipes()) {
                            if !pipe.state_is(&[PipeState::Wrong, PipeState::Terminated]) {
                                pipe.kill();
                            }
                        }
                        match err {
                            BrookError::Graph(GraphError::Killed { .. }) => return Ok(()),
                            other => return Err(other),
                        }
                    }
                }
            }

            // An input that ran dry ends the alignment.
            if held
                .iter()
                .zip(done.iter())
                .any(|(h, d)| h.is_none() && *d)
            {
                ctx.put_packet(Packet::endpoint(u64::MAX, ctx.id()))?;
                ctx.out_pipe().stop();
                return Ok(());
            }

            if held.iter().any(|h| h.is_none()) {
                if !progressed {
                    starving += ctx.config().timescale();
                    if starving > ctx.config().timeout() {
                        for pipe in ctx.in_pipes().iter().chain(ctx.out_pipes()) {
                            pipe.kill();
                        }
                        return Err(GraphError::Timeout {
                            stage: ctx.name().to_string(),
                            timeout_secs: ctx.config().timeout_secs,
                        }
                        .into());
                    }
                    ctx.yield_now();
                }
                continue;
            }
            starving = Duration::ZERO;

            if ctx.out_pipe().is_full() || ctx.out_pipe().state() == PipeState::Stranded {
                ctx.yield_now();
                continue;
            }

            let endpoints = held
                .iter()
                .filter(|h| h.as_ref().unwrap().is_endpoint())
                .count();
            if endpoints == n {
                let cid = held
                    .iter()
                    .map(|h| h.as_ref().unwrap().cid())
                    .max()
                    .unwrap();
                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                held.iter_mut().for_each(|h| *h = None);
                continue;
            }
            if endpoints > 0 {
                // Hold the endpoints; data on the other inputs is stale until
                // every input reaches its endpoint.
                for h in held.iter_mut() {
                    if !h.as_ref().unwrap().is_endpoint() {
                        *h = None;
                    }
                }
                continue;
            }

            // Drop everything older than the frontier.
            let frontier = held
                .iter()
                .map(|h| h.as_ref().unwrap().cid())
                .max()
                .unwrap();
            let mut dropped = false;
            for h in held.iter_mut() {
                if h.as_ref().unwrap().cid() < frontier {
                    *h = None;
                    dropped = true;
                }
            }
            if dropped {
                continue;
            }

            // All heads aligned on the frontier: produce.
            let inputs: Vec<Slots> = held
                .iter_mut()
                .map(|h| h.take().unwrap().into_slots())
                .collect();
            let slots = match &mut self.combine {
                Some(combine) => combine(inputs)?,
                None => {
                    let mut union: Slots = Vec::new();
                    for slots in inputs {
                        for (key, payload) in slots {
                            if union.iter().any(|(k, _)| *k == key) {
                                return Err(GraphError::KeyCollision {
                                    stage: ctx.name().to_string(),
                                    key,
                                }
                                .into());
                            }
                            union.push((key, payload));
                        }
                    }
                    union
                }
            };
            ctx.put_packet(Packet::from_slots(slots, frontier, ctx.id()))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::Pipe;
    use ndarray::arr1;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig {
            timeout_secs: 2,
            ..Default::default()
        }
    }

    fn vector_packet(key: &str, value: f32, cid: u64, producer: u64) -> Packet {
        Packet::new(key, Payload::Vector(arr1(&[value; 13])), cid, producer)
    }

    #[test]
    fn test_replicator_fans_out_deep_copies() {
        let config = cfg();
        let input = Pipe::new("in", &config);
        for cid in 0..100 {
            input
                .put(vector_packet("data", cid as f32, cid, 7))
                .unwrap();
        }
        input.stop();

        let mut joint = Joint::replicator(config, 3);
        joint.start(vec![input]).unwrap();
        joint.wait().unwrap();

        let outs = joint.outputs();
        assert_eq!(outs.len(), 3);
        let mut groups: Vec<Vec<Packet>> = Vec::new();
        for out in &outs {
            let mut g = out.to_list().unwrap();
            assert_eq!(g.len(), 1);
            assert_eq!(g[0].len(), 100);
            groups.push(g.remove(0));
        }
        // Replicas hold their own storage.
        let a = groups[0][0].main().unwrap().as_vector().unwrap();
        let b = groups[1][0].main().unwrap().as_vector().unwrap();
        assert_eq!(a, b);
        assert!(!std::ptr::eq(a.as_ptr(), b.as_ptr()));
        // Same chunk-id sequence on every replica.
        for g in &groups {
            let cids: Vec<u64> = g.iter().map(|p| p.cid()).collect();
            assert_eq!(cids, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_combiner_aligns_by_chunk_id() {
        let config = cfg();
        let left = Pipe::new("left", &config);
        let right = Pipe::new("right", &config);
        for cid in 0..5 {
            left.put(vector_packet("mfcc", cid as f32, cid, 1)).unwrap();
        }
        for cid in 1..5 {
            right
                .put(vector_packet("fbank", cid as f32, cid, 2))
                .unwrap();
        }
        left.stop();
        right.stop();

        let mut joint = Joint::combiner(
            config,
            Box::new(|inputs: Vec<Slots>| {
                let mut out = Vec::new();
                for slots in inputs {
                    out.extend(slots);
                }
                Ok(out)
            }),
        );
        joint.start(vec![left, right]).unwrap();
        joint.wait().unwrap();

        let groups = joint.out_pipe().to_list().unwrap();
        assert_eq!(groups.len(), 1);
        let cids: Vec<u64> = groups[0].iter().map(|p| p.cid()).collect();
        assert_eq!(cids, vec![1, 2, 3, 4]);
        for packet in &groups[0] {
            assert!(packet.get("mfcc").is_some());
            assert!(packet.get("fbank").is_some());
        }
    }

    #[test]
    fn test_merger_rejects_shared_keys() {
        let config = cfg();
        let left = Pipe::new("left", &config);
        let right = Pipe::new("right", &config);
        left.put(vector_packet("data", 1.0, 0, 1)).unwrap();
        right.put(vector_packet("data", 2.0, 0, 2)).unwrap();
        left.stop();
        right.stop();

        let mut joint = Joint::merger(config);
        joint.start(vec![left, right]).unwrap();
        let err = joint.wait().unwrap_err();
        assert!(matches!(
            err,
            BrookError::Graph(GraphError::KeyCollision { .. })
        ));
    }

    #[test]
    fn test_merger_unions_distinct_keys() {
        let config = cfg();
        let left = Pipe::new("left", &config);
        let right = Pipe::new("right", &config);
        for cid in 0..3 {
            left.put(vector_packet("mfcc", 1.0, cid, 1)).unwrap();
            right.put(vector_packet("fbank", 2.0, cid, 2)).unwrap();
        }
        left.stop();
        right.stop();

        let mut joint = Joint::merger(config);
        joint.start(vec![left, right]).unwrap();
        joint.wait().unwrap();

        let groups = joint.out_pipe().to_list().unwrap();
        assert_eq!(groups[0].len(), 3);
        assert_eq!(
            groups[0][0].keys().collect::<Vec<_>>(),
            vec!["mfcc", "fbank"]
        );
    }

    #[test]
    fn test_mapper_preserves_ids() {
        let config = cfg();
        let input = Pipe::new("in", &config);
        input.put(vector_packet("data", 3.0, 42, 9)).unwrap();
        input.stop();

        let mut joint = Joint::mapper(
            config,
            Box::new(|mut slots: Slots| {
                for (_, payload) in slots.iter_mut() {
                    if let Payload::Vector(v) = payload {
                        v.mapv_inplace(|x| x * 2.0);
                    }
                }
                Ok(slots)
            }),
        );
        joint.start(vec![input]).unwrap();
        joint.wait().unwrap();

        let groups = joint.out_pipe().to_list().unwrap();
        let packet = &groups[0][0];
        assert_eq!(packet.cid(), 42);
        assert_eq!(packet.producer(), 9);
        assert_eq!(packet.main().unwrap().as_vector().unwrap()[0], 6.0);
    }
}
