//! Debug drivers for running a node or graph to completion.

use std::io::Write;

use crate::component::Node;
use crate::errors::Result;
use crate::packet::Packet;
use crate::pipe::{Pipe, PipeState};

/// A caller-selected rendering of one packet field.
pub type ItemFn = dyn Fn(&Packet) -> String;

/// Render the keys and payload kinds of a packet.
pub fn describe_packet(packet: &Packet) -> String {
    let slots: Vec<String> = packet
        .slots()
        .iter()
        .map(|(key, payload)| format!("{key}: {}", payload.kind()))
        .collect();
    format!("cid {} [{}]", packet.cid(), slots.join(", "))
}

/// Drive a started (or silent) node to completion, printing the selected
/// renderings of every packet that reaches its output. Endpoints print as a
/// separator line. This is a test/debug driver, not a production path.
pub fn dynamic_run(
    target: &mut dyn Node,
    in_pipe: Option<Pipe>,
    items: &[(&str, Box<ItemFn>)],
    mut sink: impl Write,
) -> Result<()> {
    if target.state() == crate::component::NodeState::Silent {
        target.start(in_pipe.into_iter().collect())?;
    }
    let out = target.out_pipe();
    let timescale = {
        // Poll at the shared cooperative granularity.
        std::time::Duration::from_millis(10)
    };

    loop {
        match out.state() {
            PipeState::Wrong => break,
            PipeState::Terminated if out.is_empty() => break,
            _ => {}
        }
        match out.try_get()? {
            None => std::thread::sleep(timescale),
            Some(packet) => {
                if packet.is_endpoint() {
                    writeln!(sink, "----- Endpoint -----")?;
                    continue;
                }
                for (name, render) in items {
                    writeln!(sink, "{name}: {}", render(&packet))?;
                }
                writeln!(sink)?;
            }
        }
    }

    target.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Action, InputArity, StageContext, StageCore, Worker};
    use crate::config::RuntimeConfig;
    use crate::packet::{Payload, Scalar};

    struct Forward;

    impl Worker for Forward {
        fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
            loop {
                match ctx.decide_action()? {
                    Action::Proceed => {
                        let packet = ctx.get_packet()?;
                        ctx.put_packet(packet)?;
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

    struct ForwardNode {
        core: StageCore,
    }

    impl Node for ForwardNode {
        fn core(&self) -> &StageCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut StageCore {
            &mut self.core
        }
    }

    #[test]
    fn test_dynamic_run_renders_packets_and_endpoints() {
        let config = RuntimeConfig {
            timeout_secs: 2,
            ..Default::default()
        };
        let input = Pipe::new("in", &config);
        for cid in 0..3u64 {
            input
                .put(Packet::new(
                    "data",
                    Payload::Element(Scalar::F32(cid as f32)),
                    cid,
                    0,
                ))
                .unwrap();
        }
        input.put(Packet::endpoint(3, 0)).unwrap();
        input.stop();

        let mut node = ForwardNode {
            core: StageCore::new(
                "Forward",
                config,
                None,
                vec!["data".to_string()],
                InputArity::Exactly(1),
                1,
                Forward,
            ),
        };

        let mut output = Vec::new();
        let items: Vec<(&str, Box<ItemFn>)> =
            vec![("packet", Box::new(|p: &Packet| describe_packet(p)))];
        dynamic_run(&mut node, Some(input), &items, &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        assert_eq!(text.matches("packet: cid").count(), 3);
        assert!(text.contains("----- Endpoint -----"));
    }
}
