//! Stage base: one worker thread per node, driven by a cooperative loop.
//!
//! Every node owns its output pipes and binds to the outputs of its
//! predecessor when started. The worker loop consults `decide_action` at each
//! iteration head and at every suspension point, so cancellation is always
//! cooperative: `stop` marks the output pipe terminated and the worker
//! observes it on its next poll; there is no preemption mid-computation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::config::RuntimeConfig;
use crate::errors::{BrookError, GraphError, Result};
use crate::packet::Packet;
use crate::pipe::{Pipe, PipeState};

static NODE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-wide producer id, unique per constructed node.
pub fn next_node_id() -> u64 {
    NODE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// What a worker should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Input available and output writable: take a packet and work.
    Proceed,
    /// Input exhausted: emit a trailing endpoint and stop the output.
    Final,
    /// The stage was stopped or a neighbour failed: exit without emitting.
    Stopped,
    /// Nothing to do right now: sleep one timescale and poll again.
    RetryLater,
}

/// Which end of the stage decided the combined state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Input,
    Output,
}

/// Node lifecycle state, mirroring the primary output pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Silent,
    Alive,
    Terminated,
    Wrong,
}

/// The per-thread environment handed to a worker.
pub struct StageContext {
    name: String,
    id: u64,
    ikey: Option<String>,
    okeys: Vec<String>,
    in_pipes: Vec<Pipe>,
    out_pipes: Vec<Pipe>,
    config: RuntimeConfig,
    starving: Duration,
    cid_counter: u64,
}

impl StageContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producer id stamped onto packets this stage originates.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn in_pipe(&self) -> &Pipe {
        &self.in_pipes[0]
    }

    pub fn out_pipe(&self) -> &Pipe {
        &self.out_pipes[0]
    }

    pub fn in_pipes(&self) -> &[Pipe] {
        &self.in_pipes
    }

    pub fn out_pipes(&self) -> &[Pipe] {
        &self.out_pipes
    }

    /// The slot key this stage reads, falling back to the packet's main key.
    pub fn input_key<'a>(&'a self, packet: &'a Packet) -> Result<&'a str> {
        self.ikey
            .as_deref()
            .or_else(|| packet.main_key())
            .ok_or_else(|| {
                GraphError::MissingKey {
                    stage: self.name.clone(),
                    key: self.ikey.clone().unwrap_or_else(|| "<main>".to_string()),
                }
                .into()
            })
    }

    pub fn okey(&self, index: usize) -> &str {
        &self.okeys[index]
    }

    pub fn okeys(&self) -> &[String] {
        &self.okeys
    }

    /// Next chunk id for packets originated by this stage.
    pub fn next_cid(&mut self) -> u64 {
        let cid = self.cid_counter;
        self.cid_counter += 1;
        cid
    }

    /// Sleep one timescale (the cooperative yield used on RetryLater).
    pub fn yield_now(&self) {
        thread::sleep(self.config.timescale());
    }

    /// Inspect the input and output pipes and pick the next action.
    ///
    /// Starvation is accounted here: if the input stays empty for TIMEOUT,
    /// both pipes are killed and the stage aborts.
    pub fn decide_action(&mut self) -> Result<Action> {
        let out = &self.out_pipes[0];
        let inp = &self.in_pipes[0];

        match out.state() {
            PipeState::Wrong => {
                if !inp.state_is(&[PipeState::Wrong, PipeState::Terminated]) {
                    inp.kill();
                }
                return Ok(Action::Stopped);
            }
            PipeState::Terminated => return Ok(Action::Stopped),
            _ => {}
        }

        if inp.state() == PipeState::Wrong {
            for out in &self.out_pipes {
                out.kill();
            }
            return Ok(Action::Stopped);
        }

        if !inp.is_null() {
            if inp.is_exhausted() {
                return Ok(Action::Final);
            }
            if inp.state() == PipeState::Stranded {
                return Ok(Action::RetryLater);
            }
        }

        if out.state() == PipeState::Stranded || out.is_full() {
            return Ok(Action::RetryLater);
        }

        if !inp.is_null() && inp.is_empty() {
            self.starving += self.config.timescale();
            if self.starving > self.config.timeout() {
                inp.kill();
                for out in &self.out_pipes {
                    out.kill();
                }
                return Err(GraphError::Timeout {
                    stage: self.name.clone(),
                    timeout_secs: self.config.timeout_secs,
                }
                .into());
            }
            return Ok(Action::RetryLater);
        }

        self.starving = Duration::ZERO;
        Ok(Action::Proceed)
    }

    /// Combined view over both ends, for stages whose loop is not driven by
    /// packet arrival (sources, the decoder reader, the transport shim).
    pub fn decide_state(&self) -> (PipeEnd, PipeState) {
        let out = self.out_pipes[0].state();
        match out {
            PipeState::Wrong | PipeState::Terminated => return (PipeEnd::Output, out),
            _ => {}
        }
        let inp = self.in_pipes[0].state();
        match inp {
            PipeState::Wrong | PipeState::Terminated => return (PipeEnd::Input, inp),
            _ => {}
        }
        if out == PipeState::Stranded {
            return (PipeEnd::Output, PipeState::Stranded);
        }
        if inp == PipeState::Stranded {
            return (PipeEnd::Input, PipeState::Stranded);
        }
        (PipeEnd::Input, PipeState::Active)
    }

    /// Blocking pop from the input pipe.
    pub fn get_packet(&self) -> Result<Packet> {
        self.in_pipes[0].get()
    }

    /// Push to the primary output pipe.
    pub fn put_packet(&self, packet: Packet) -> Result<()> {
        self.out_pipes[0].put(packet)
    }

    /// Push to the n-th output pipe (joints).
    pub fn put_packet_to(&self, index: usize, packet: Packet) -> Result<()> {
        self.out_pipes[index].put(packet)
    }
}

/// The body of a stage, run on its own thread.
pub trait Worker: Send {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()>;

    /// Clear internal buffers so the stage can be restarted.
    fn on_reset(&mut self) {}
}

/// How many input pipes a node binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputArity {
    Exactly(usize),
    AtLeast(usize),
}

/// Shared plumbing owned by every node: identity, pipes, the worker thread.
pub struct StageCore {
    name: String,
    id: u64,
    config: RuntimeConfig,
    ikey: Option<String>,
    okeys: Vec<String>,
    in_arity: InputArity,
    in_pipes: Vec<Pipe>,
    out_pipes: Vec<Pipe>,
    worker: Arc<Mutex<dyn Worker>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl StageCore {
    pub fn new<W: Worker + 'static>(
        name: impl Into<String>,
        config: RuntimeConfig,
        ikey: Option<String>,
        okeys: Vec<String>,
        in_arity: InputArity,
        out_count: usize,
        worker: W,
    ) -> Self {
        let id = next_node_id();
        let name = format!("{}[{}]", name.into(), id);
        let out_pipes = (0..out_count)
            .map(|i| Pipe::new(format!("{name} out[{i}]"), &config))
            .collect();
        Self {
            name,
            id,
            config,
            ikey,
            okeys,
            in_arity,
            in_pipes: Vec::new(),
            out_pipes,
            worker: Arc::new(Mutex::new(worker)),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn outputs(&self) -> Vec<Pipe> {
        self.out_pipes.clone()
    }

    pub fn state(&self) -> NodeState {
        match self.out_pipes[0].state() {
            PipeState::Silent => {
                if self.handle.is_some() {
                    NodeState::Alive
                } else {
                    NodeState::Silent
                }
            }
            PipeState::Active | PipeState::Stranded => NodeState::Alive,
            PipeState::Terminated => NodeState::Terminated,
            PipeState::Wrong => NodeState::Wrong,
        }
    }

    /// Spawn the worker thread bound to the given inputs. A single-input
    /// node started with no inputs gets a null source pipe.
    pub fn start(&mut self, mut inputs: Vec<Pipe>) -> Result<()> {
        if inputs.is_empty() {
            inputs.push(Pipe::null(&self.config));
        }
        let ok = match self.in_arity {
            InputArity::Exactly(n) => inputs.len() == n,
            InputArity::AtLeast(n) => inputs.len() >= n,
        };
        if !ok {
            let expected = match self.in_arity {
                InputArity::Exactly(n) | InputArity::AtLeast(n) => n,
            };
            return Err(GraphError::InputArity {
                name: self.name.clone(),
                expected,
                actual: inputs.len(),
            }
            .into());
        }
        self.in_pipes = inputs.clone();

        let mut ctx = StageContext {
            name: self.name.clone(),
            id: self.id,
            ikey: self.ikey.clone(),
            okeys: self.okeys.clone(),
            in_pipes: inputs,
            out_pipes: self.out_pipes.clone(),
            config: self.config.clone(),
            starving: Duration::ZERO,
            cid_counter: 0,
        };
        let worker = Arc::clone(&self.worker);
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(stage = %name, "start");
                let result = worker.lock().unwrap().run(&mut ctx);
                let result = match result {
                    // A write refused because the stage was stopped mid-loop
                    // is an orderly shutdown, not a failure.
                    Err(BrookError::Graph(GraphError::ClosedForWrite { .. }))
                        if ctx.out_pipes[0].state() == PipeState::Terminated =>
                    {
                        Ok(())
                    }
                    other => other,
                };
                match &result {
                    Ok(()) => debug!(stage = %name, "stop"),
                    Err(err) => {
                        error!(stage = %name, %err, "worker failed");
                        for pipe in ctx.in_pipes.iter().chain(ctx.out_pipes.iter()) {
                            if !pipe.state_is(&[PipeState::Wrong, PipeState::Terminated]) {
                                pipe.kill();
                            }
                        }
                    }
                }
                result
            })
            .expect("failed to spawn stage thread");
        self.handle = Some(handle);
        Ok(())
    }

    /// Request an orderly stop: a trailing endpoint, then terminate the
    /// outputs. The worker observes this at its next poll.
    pub fn stop(&self) {
        for out in &self.out_pipes {
            let _ = out.put(Packet::endpoint(u64::MAX, self.id));
            out.stop();
        }
    }

    /// Mark every output wrong so the failure propagates downstream.
    pub fn kill(&self) {
        for out in &self.out_pipes {
            out.kill();
        }
    }

    /// Join the worker thread, rethrowing its error.
    pub fn wait(&mut self) -> Result<()> {
        let handle = self.handle.take().ok_or_else(|| GraphError::NotStarted {
            name: self.name.clone(),
        })?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(GraphError::WorkerPanicked {
                name: self.name.clone(),
            }
            .into()),
        }
    }

    /// Reset a finished node so it can be started again.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(handle) = &self.handle {
            if !handle.is_finished() {
                return Err(GraphError::NotSilent {
                    name: self.name.clone(),
                }
                .into());
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.worker.lock().unwrap().on_reset();
        for out in &self.out_pipes {
            out.reset();
        }
        self.in_pipes.clear();
        Ok(())
    }
}

/// The object-safe face shared by components, joints and chains.
pub trait Node: Send {
    fn core(&self) -> &StageCore;
    fn core_mut(&mut self) -> &mut StageCore;

    fn name(&self) -> String {
        self.core().name().to_string()
    }

    fn start(&mut self, inputs: Vec<Pipe>) -> Result<()> {
        self.core_mut().start(inputs)
    }

    fn stop(&self) {
        self.core().stop();
    }

    fn kill(&self) {
        self.core().kill();
    }

    fn wait(&mut self) -> Result<()> {
        self.core_mut().wait()
    }

    fn outputs(&self) -> Vec<Pipe> {
        self.core().outputs()
    }

    fn out_pipe(&self) -> Pipe {
        self.core().outputs()[0].clone()
    }

    fn state(&self) -> NodeState {
        self.core().state()
    }

    fn reset(&mut self) -> Result<()> {
        self.core_mut().reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, Payload, Scalar};

    struct Doubler;

    impl Worker for Doubler {
        fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
            loop {
                match ctx.decide_action()? {
                    Action::Proceed => {
                        let packet = ctx.get_packet()?;
                        if packet.is_endpoint() {
                            ctx.put_packet(packet)?;
                            continue;
                        }
                        let key = ctx.input_key(&packet)?.to_string();
                        let value = packet
                            .get(&key)
                            .and_then(|p| p.as_element())
                            .map(|s| s.as_f32())
                            .unwrap_or(0.0);
                        let out = Packet::new(
                            ctx.okey(0).to_string(),
                            Payload::Element(Scalar::F32(value * 2.0)),
                            packet.cid(),
                            packet.producer(),
                        );
                        ctx.put_packet(out)?;
                    }
                    Action::Final => {
                        ctx.put_packet(Packet::endpoint(u64::MAX, ctx.id()))?;
                        ctx.out_pipe().stop();
                        return Ok(());
                    }
                    Action::Stopped => return Ok(()),
                    Action::RetryLater => ctx.yield_now(),
                }
            }
        }
    }

    fn doubler(config: &RuntimeConfig) -> StageCore {
        StageCore::new(
            "Doubler",
            config.clone(),
            None,
            vec!["data".to_string()],
            InputArity::Exactly(1),
            1,
            Doubler,
        )
    }

    #[test]
    fn test_worker_drains_input_and_terminates() {
        let config = RuntimeConfig {
            timeout_secs: 2,
            ..Default::default()
        };
        let input = Pipe::new("in", &config);
        for cid in 0..5 {
            input
                .put(Packet::new(
                    "data",
                    Payload::Element(Scalar::F32(cid as f32)),
                    cid,
                    99,
                ))
                .unwrap();
        }
        input.stop();

        let mut stage = doubler(&config);
        stage.start(vec![input]).unwrap();
        stage.wait().unwrap();

        let out = stage.outputs()[0].clone();
        assert!(out.is_exhausted() || !out.is_empty());
        let groups = out.to_list().unwrap();
        assert_eq!(groups.len(), 1);
        let values: Vec<f32> = groups[0]
            .iter()
            .map(|p| p.main().unwrap().as_element().unwrap().as_f32())
            .collect();
        assert_eq!(values, vec![0.0, 2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_killed_input_propagates_to_output() {
        let config = RuntimeConfig {
            timeout_secs: 2,
            ..Default::default()
        };
        let input = Pipe::new("in", &config);
        input
            .put(Packet::new(
                "data",
                Payload::Element(Scalar::F32(1.0)),
                0,
                0,
            ))
            .unwrap();

        let mut stage = doubler(&config);
        stage.start(vec![input.clone()]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        input.kill();
        stage.wait().unwrap();
        assert_eq!(stage.state(), NodeState::Wrong);
    }

    #[test]
    fn test_stop_is_observed_cooperatively() {
        let config = RuntimeConfig {
            timeout_secs: 30,
            ..Default::default()
        };
        let input = Pipe::new("in", &config);
        input
            .put(Packet::new(
                "data",
                Payload::Element(Scalar::F32(1.0)),
                0,
                0,
            ))
            .unwrap();

        let mut stage = doubler(&config);
        stage.start(vec![input]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        stage.stop();
        stage.wait().unwrap();
        assert_eq!(stage.state(), NodeState::Terminated);
    }

    #[test]
    fn test_node_ids_are_unique() {
        let a = next_node_id();
        let b = next_node_id();
        assert_ne!(a, b);
    }
}
