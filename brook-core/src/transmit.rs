//! Transport shim: a graph can span two hosts over TCP.
//!
//! Wire frames are length-prefixed with two independent little-endian size
//! fields; a mismatch makes the receiver flush its socket buffer and request
//! retransmission. Each frame leads with a 1-byte kind tag; Active and
//! Stranded frames carry the local queue timestamp so both peers can decide
//! which side's state is newer and advance, pause, terminate or fail
//! together.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Instant;

use tracing::debug;

use crate::component::{InputArity, Node, StageCore, StageContext, Worker};
use crate::config::{RuntimeConfig, SOCKET_RETRY};
use crate::errors::{GraphError, Result, TransportError};
use crate::packet::Packet;
use crate::pipe::PipeState;

const ACTIVE_MARK: u8 = b'0';
const ENDPOINT_MARK: u8 = b'1';
const TERMINATED_MARK: u8 = b'2';
const ERROR_MARK: u8 = b'3';
const STRANDED_MARK: u8 = b'4';
const PACKET_MARK: u8 = b'5';

fn timestamp_bytes(value: f64) -> [u8; 8] {
    value.to_le_bytes()
}

fn timestamp_from(bytes: &[u8]) -> Result<f64> {
    bytes
        .try_into()
        .map(f64::from_le_bytes)
        .map_err(|_| {
            TransportError::MalformedPacket {
                reason: "short peer timestamp".to_string(),
            }
            .into()
        })
}

/// Sending half of the wire protocol.
pub struct SendProtocol {
    name: String,
    stream: TcpStream,
}

impl SendProtocol {
    /// Connect to the remote receiver, retrying until it starts listening.
    pub fn connect(host: &str, port: u16, config: &RuntimeConfig) -> Result<Self> {
        let name = format!("SendProtocol({host}:{port})");
        debug!(%name, "connecting");
        let deadline = Instant::now() + config.timeout();
        let stream = loop {
            match TcpStream::connect((host, port)) {
                Ok(stream) => break stream,
                Err(_) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::ConnectTimeout { name }.into());
                    }
                    std::thread::sleep(config.timescale());
                }
            }
        };
        stream.set_read_timeout(Some(config.timeout()))?;
        stream.set_nodelay(true)?;
        debug!(%name, "connected");
        Ok(Self { name, stream })
    }

    /// Send one frame, resending on the receiver's request. Returns the
    /// receiver's feedback message, if any.
    pub fn send(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        debug_assert!(!message.is_empty(), "can not send an empty frame");
        let size = (message.len() as u32).to_le_bytes();
        let mut retries = 0;
        loop {
            self.stream.write_all(&size)?;
            self.stream.write_all(&size)?;
            self.stream.write_all(message)?;
            self.stream.flush()?;

            let mut response = [0u8; 1];
            self.stream.read_exact(&mut response)?;
            match response[0] {
                b'0' => {
                    let mut fblen = [0u8; 1];
                    self.stream.read_exact(&mut fblen)?;
                    if fblen[0] == 0 {
                        return Ok(None);
                    }
                    let mut feedback = vec![0u8; fblen[0] as usize];
                    self.stream.read_exact(&mut feedback)?;
                    return Ok(Some(feedback));
                }
                b'1' => {
                    retries += 1;
                    if retries >= SOCKET_RETRY {
                        return Err(TransportError::RetriesExhausted {
                            name: self.name.clone(),
                            retries,
                        }
                        .into());
                    }
                }
                other => {
                    return Err(TransportError::UnknownResponse {
                        name: self.name.clone(),
                        response: other,
                    }
                    .into());
                }
            }
        }
    }
}

/// Receiving half of the wire protocol.
pub struct ReceiveProtocol {
    name: String,
    stream: TcpStream,
    max_flush: usize,
}

impl ReceiveProtocol {
    /// Accept one peer on an already-bound listener.
    pub fn accept(listener: &TcpListener, config: &RuntimeConfig) -> Result<Self> {
        let name = format!("ReceiveProtocol({})", listener.local_addr()?);
        debug!(%name, "listening");
        let (stream, peer) = listener.accept()?;
        stream.set_read_timeout(Some(config.timeout()))?;
        stream.set_nodelay(true)?;
        debug!(%name, %peer, "connected");
        Ok(Self {
            name,
            stream,
            max_flush: config.max_socket_buffer_size,
        })
    }

    /// Receive one frame, acknowledging it with optional feedback (at most
    /// 255 bytes).
    pub fn receive(&mut self, feedback: Option<&[u8]>) -> Result<Vec<u8>> {
        let feedback = feedback.unwrap_or(b"");
        debug_assert!(feedback.len() <= 255);
        loop {
            let mut sizes = [0u8; 8];
            self.stream.read_exact(&mut sizes)?;
            let size1 = u32::from_le_bytes(sizes[0..4].try_into().unwrap()) as usize;
            let size2 = u32::from_le_bytes(sizes[4..8].try_into().unwrap()) as usize;
            if size1 != size2 {
                // Out of sync: flush whatever is buffered and ask for the
                // frame again.
                let mut scratch = vec![0u8; self.max_flush];
                let _ = self.stream.read(&mut scratch)?;
                self.stream.write_all(b"1")?;
                self.stream.flush()?;
                continue;
            }
            let mut buffer = vec![0u8; size1];
            self.stream.read_exact(&mut buffer)?;
            self.stream.write_all(b"0")?;
            self.stream.write_all(&[feedback.len() as u8])?;
            self.stream.write_all(feedback)?;
            self.stream.flush()?;
            return Ok(buffer);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Sender stage
// ---------------------------------------------------------------------------

struct SenderWorker {
    host: String,
    port: u16,
}

impl SenderWorker {
    /// React to the remote state tag in a feedback message. Returns true
    /// when the local loop should keep running.
    fn absorb_feedback(
        &self,
        ctx: &StageContext,
        feedback: &[u8],
        paused_ok: bool,
    ) -> Result<FeedbackOutcome> {
        let inp = ctx.in_pipe();
        let out = ctx.out_pipe();
        match feedback.first().copied() {
            Some(ERROR_MARK) => {
                for pipe in [inp, out] {
                    if !pipe.state_is(&[PipeState::Wrong, PipeState::Terminated]) {
                        pipe.kill();
                    }
                }
                Ok(FeedbackOutcome::Finished)
            }
            Some(TERMINATED_MARK) => {
                if !inp.state_is(&[PipeState::Wrong, PipeState::Terminated]) {
                    inp.stop();
                }
                if !out.state_is(&[PipeState::Wrong, PipeState::Terminated]) {
                    out.stop();
                }
                Ok(FeedbackOutcome::Finished)
            }
            Some(STRANDED_MARK) => {
                if paused_ok {
                    let remote = timestamp_from(&feedback[1..])?;
                    if remote > inp.timestamp() {
                        inp.block();
                        out.block();
                    } else if out.state_is(&[PipeState::Silent, PipeState::Stranded]) {
                        out.activate();
                    }
                } else {
                    out.block();
                }
                Ok(FeedbackOutcome::Paused)
            }
            Some(ACTIVE_MARK) => {
                let remote = timestamp_from(&feedback[1..])?;
                if inp.state() == PipeState::Stranded && inp.timestamp() < remote {
                    inp.unblock();
                    out.activate();
                }
                Ok(FeedbackOutcome::Proceed)
            }
            _ => Err(TransportError::MalformedPacket {
                reason: "feedback frame carries no state tag".to_string(),
            }
            .into()),
        }
    }
}

enum FeedbackOutcome {
    Proceed,
    Paused,
    Finished,
}

impl Worker for SenderWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        let mut proto = SendProtocol::connect(&self.host, self.port, ctx.config())?;
        let mut starving = std::time::Duration::ZERO;

        let result: Result<()> = (|| {
            loop {
                let inp = ctx.in_pipe().clone();
                match inp.state() {
                    PipeState::Wrong => {
                        if !ctx
                            .out_pipe()
                            .state_is(&[PipeState::Wrong, PipeState::Terminated])
                        {
                            ctx.out_pipe().kill();
                        }
                        let _ = proto.send(&[ERROR_MARK]);
                        return Ok(());
                    }
                    PipeState::Stranded => {
                        let mut frame = vec![STRANDED_MARK];
                        frame.extend_from_slice(&timestamp_bytes(inp.timestamp()));
                        let feedback = proto.send(&frame)?.unwrap_or_default();
                        match self.absorb_feedback(ctx, &feedback, true)? {
                            FeedbackOutcome::Finished => return Ok(()),
                            _ => {
                                ctx.yield_now();
                                continue;
                            }
                        }
                    }
                    PipeState::Terminated if inp.is_empty() => {
                        let _ = proto.send(&[TERMINATED_MARK]);
                        if !ctx
                            .out_pipe()
                            .state_is(&[PipeState::Wrong, PipeState::Terminated])
                        {
                            ctx.out_pipe().stop();
                        }
                        return Ok(());
                    }
                    _ => {
                        if inp.is_empty() {
                            ctx.yield_now();
                            starving += ctx.config().timescale();
                            if starving > ctx.config().timeout() {
                                inp.kill();
                                ctx.out_pipe().kill();
                                let _ = proto.send(&[ERROR_MARK]);
                                return Err(GraphError::Timeout {
                                    stage: ctx.name().to_string(),
                                    timeout_secs: ctx.config().timeout_secs,
                                }
                                .into());
                            }
                            continue;
                        }
                        starving = std::time::Duration::ZERO;
                        let mut frame = vec![ACTIVE_MARK];
                        frame.extend_from_slice(&timestamp_bytes(inp.timestamp()));
                        let feedback = proto.send(&frame)?.unwrap_or_default();
                        match self.absorb_feedback(ctx, &feedback, false)? {
                            FeedbackOutcome::Finished => return Ok(()),
                            FeedbackOutcome::Paused => {
                                ctx.yield_now();
                                continue;
                            }
                            FeedbackOutcome::Proceed => {
                                let packet = inp.get()?;
                                let mark = if packet.is_endpoint() {
                                    ENDPOINT_MARK
                                } else {
                                    PACKET_MARK
                                };
                                let mut frame = vec![mark];
                                frame.extend_from_slice(&packet.encode());
                                proto.send(&frame)?;
                            }
                        }
                    }
                }
            }
        })();

        if result.is_err() {
            let _ = proto.send(&[ERROR_MARK]);
        }
        result
    }
}

/// Ship packets from the local graph to a remote receiver. The output pipe
/// only mirrors state; no packets flow through it.
pub struct PacketSender {
    core: StageCore,
}

impl PacketSender {
    pub fn new(host: impl Into<String>, port: u16, config: RuntimeConfig) -> Self {
        let worker = SenderWorker {
            host: host.into(),
            port,
        };
        let core = StageCore::new(
            "PacketSender",
            config,
            None,
            vec!["null".to_string()],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Self { core }
    }
}

impl Node for PacketSender {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

// ---------------------------------------------------------------------------
// Receiver stage
// ---------------------------------------------------------------------------

struct ReceiverWorker {
    listener: Option<TcpListener>,
}

impl Worker for ReceiverWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        let listener = self.listener.take().ok_or_else(|| GraphError::NotStarted {
            name: ctx.name().to_string(),
        })?;
        let mut proto = ReceiveProtocol::accept(&listener, ctx.config())?;

        loop {
            let out = ctx.out_pipe().clone();
            match out.state() {
                PipeState::Wrong => {
                    let _ = proto.receive(Some(&[ERROR_MARK]));
                    return Ok(());
                }
                PipeState::Terminated => {
                    let _ = proto.receive(Some(&[TERMINATED_MARK]));
                    return Ok(());
                }
                PipeState::Stranded => {
                    let mut feedback = vec![STRANDED_MARK];
                    feedback.extend_from_slice(&timestamp_bytes(out.timestamp()));
                    let message = proto.receive(Some(&feedback))?;
                    match message.first().copied() {
                        Some(ERROR_MARK) => {
                            out.kill();
                            return Ok(());
                        }
                        Some(TERMINATED_MARK) => {
                            out.stop();
                            return Ok(());
                        }
                        Some(STRANDED_MARK) => ctx.yield_now(),
                        Some(ACTIVE_MARK) => {
                            let remote = timestamp_from(&message[1..])?;
                            if out.timestamp() < remote {
                                out.unblock();
                            }
                        }
                        _ => {
                            return Err(TransportError::UnknownTag {
                                name: ctx.name().to_string(),
                                tag: message.first().copied().unwrap_or(0),
                            }
                            .into());
                        }
                    }
                }
                _ => {
                    let mut feedback = vec![ACTIVE_MARK];
                    feedback.extend_from_slice(&timestamp_bytes(out.timestamp()));
                    let message = proto.receive(Some(&feedback))?;
                    match message.first().copied() {
                        Some(ERROR_MARK) => {
                            out.kill();
                            return Ok(());
                        }
                        Some(TERMINATED_MARK) => {
                            let _ = out.put(Packet::endpoint(u64::MAX, ctx.id()));
                            out.stop();
                            return Ok(());
                        }
                        Some(STRANDED_MARK) => {
                            let remote = timestamp_from(&message[1..])?;
                            if out.timestamp() < remote {
                                out.block();
                            }
                        }
                        Some(ACTIVE_MARK) => {
                            let message = proto.receive(None)?;
                            match message.first().copied() {
                                Some(PACKET_MARK) | Some(ENDPOINT_MARK) => {
                                    let packet = Packet::decode(&message[1..])?;
                                    out.put(packet)?;
                                }
                                other => {
                                    return Err(TransportError::UnknownTag {
                                        name: ctx.name().to_string(),
                                        tag: other.unwrap_or(0),
                                    }
                                    .into());
                                }
                            }
                        }
                        other => {
                            return Err(TransportError::UnknownTag {
                                name: ctx.name().to_string(),
                                tag: other.unwrap_or(0),
                            }
                            .into());
                        }
                    }
                }
            }
        }
    }
}

/// Receive packets from a remote sender into the local graph.
pub struct PacketReceiver {
    core: StageCore,
    local_port: u16,
}

impl PacketReceiver {
    /// Bind `port` (0 picks an ephemeral port) and wait for one sender.
    pub fn new(port: u16, config: RuntimeConfig) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let local_port = listener.local_addr()?.port();
        let worker = ReceiverWorker {
            listener: Some(listener),
        };
        let core = StageCore::new(
            "PacketReceiver",
            config,
            None,
            vec!["data".to_string()],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Ok(Self { core, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Node for PacketReceiver {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Payload, Scalar};
    use crate::pipe::Pipe;
    use ndarray::arr1;
    use std::thread;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig {
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_protocol_round_trip_with_feedback() {
        let config = cfg();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = {
            let config = config.clone();
            thread::spawn(move || {
                let mut proto = ReceiveProtocol::accept(&listener, &config).unwrap();
                let first = proto.receive(Some(b"pong")).unwrap();
                let second = proto.receive(None).unwrap();
                (first, second)
            })
        };

        let mut sender = SendProtocol::connect("127.0.0.1", port, &config).unwrap();
        let feedback = sender.send(b"ping").unwrap();
        assert_eq!(feedback.as_deref(), Some(&b"pong"[..]));
        let feedback = sender.send(&[1, 2, 3, 4, 5]).unwrap();
        assert!(feedback.is_none());

        let (first, second) = server.join().unwrap();
        assert_eq!(first, b"ping");
        assert_eq!(second, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sender_receiver_stages_forward_packets() {
        let config = cfg();
        let mut receiver = PacketReceiver::new(0, config.clone()).unwrap();
        let port = receiver.local_port();
        receiver.start(Vec::new()).unwrap();

        let input = Pipe::new("local", &config);
        for cid in 0..20u64 {
            input
                .put(Packet::new(
                    "data",
                    Payload::Vector(arr1(&[cid as f32, 1.0, 2.0])),
                    cid,
                    4,
                ))
                .unwrap();
        }
        input.put(Packet::endpoint(20, 4)).unwrap();
        input.stop();

        let mut sender = PacketSender::new("127.0.0.1", port, config.clone());
        sender.start(vec![input]).unwrap();

        sender.wait().unwrap();
        receiver.wait().unwrap();

        let groups = receiver.out_pipe().to_list().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 20);
        // Packets survive the wire bit-for-bit.
        let packet = &groups[0][7];
        assert_eq!(packet.cid(), 7);
        assert_eq!(packet.producer(), 4);
        assert_eq!(
            packet.main().unwrap().as_vector().unwrap(),
            &arr1(&[7.0f32, 1.0, 2.0])
        );
    }

    #[test]
    fn test_element_packets_cross_the_wire() {
        let config = cfg();
        let mut receiver = PacketReceiver::new(0, config.clone()).unwrap();
        let port = receiver.local_port();
        receiver.start(Vec::new()).unwrap();

        let input = Pipe::new("local", &config);
        input
            .put(Packet::new(
                "data",
                Payload::Element(Scalar::I16(-32768)),
                0,
                1,
            ))
            .unwrap();
        input.stop();

        let mut sender = PacketSender::new("127.0.0.1", port, config);
        sender.start(vec![input]).unwrap();
        sender.wait().unwrap();
        receiver.wait().unwrap();

        let groups = receiver.out_pipe().to_list().unwrap();
        assert_eq!(
            groups[0][0].main().unwrap().as_element().unwrap(),
            Scalar::I16(-32768)
        );
    }
}
