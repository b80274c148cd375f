//! Ordered container wiring stages into a running graph.

use crate::component::{Node, NodeState};
use crate::errors::{GraphError, Result};
use crate::packet::Packet;
use crate::pipe::Pipe;

/// A chain links each node's inputs to the previous node's outputs.
///
/// Starting the chain starts every node in order; stopping it stops the head
/// and lets termination propagate through the queues; `wait` joins every
/// worker and rethrows the first captured error.
pub struct Chain {
    name: String,
    nodes: Vec<Box<dyn Node>>,
    blocked: Vec<bool>,
    started: bool,
}

impl Chain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            blocked: Vec::new(),
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node. With `block = true` the node's outputs start stranded
    /// so they can be bootstrapped elsewhere (e.g. fed to another graph).
    pub fn add(&mut self, node: impl Node + 'static, block: bool) -> Result<()> {
        if self.started {
            return Err(GraphError::NotSilent {
                name: self.name.clone(),
            }
            .into());
        }
        if block {
            for out in node.outputs() {
                out.block();
            }
        }
        self.nodes.push(Box::new(node));
        self.blocked.push(block);
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(GraphError::EmptyChain {
                name: self.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Start every node in order, each bound to its predecessor's outputs.
    pub fn start(&mut self, in_pipe: Option<Pipe>) -> Result<()> {
        self.check()?;
        let mut previous: Vec<Pipe> = in_pipe.into_iter().collect();
        for node in self.nodes.iter_mut() {
            node.start(previous)?;
            previous = node.outputs();
        }
        self.started = true;
        Ok(())
    }

    /// Stop the head node; termination propagates through the queues.
    pub fn stop(&self) -> Result<()> {
        self.check()?;
        self.nodes[0].stop();
        Ok(())
    }

    /// Kill every node.
    pub fn kill(&self) -> Result<()> {
        self.check()?;
        for node in &self.nodes {
            node.kill();
        }
        Ok(())
    }

    /// Join every worker thread; the first captured error is rethrown.
    pub fn wait(&mut self) -> Result<()> {
        self.check()?;
        let mut first_error = None;
        for node in self.nodes.iter_mut() {
            if let Err(err) = node.wait() {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Reset every node (only valid once all workers have exited).
    pub fn reset(&mut self) -> Result<()> {
        for (node, blocked) in self.nodes.iter_mut().zip(self.blocked.iter()) {
            node.reset()?;
            if *blocked {
                for out in node.outputs() {
                    out.block();
                }
            }
        }
        self.started = false;
        Ok(())
    }

    /// The tail node's primary output.
    pub fn out_pipe(&self) -> Result<Pipe> {
        self.check()?;
        Ok(self.nodes[self.nodes.len() - 1].out_pipe())
    }

    /// Pop a packet from the tail output.
    pub fn get(&self) -> Result<Packet> {
        self.out_pipe()?.get()
    }

    pub fn node(&self, index: usize) -> Option<&dyn Node> {
        self.nodes.get(index).map(|n| n.as_ref())
    }

    pub fn node_by_name(&self, name: &str) -> Option<&dyn Node> {
        self.nodes
            .iter()
            .find(|n| n.name().starts_with(name))
            .map(|n| n.as_ref())
    }

    pub fn state(&self) -> NodeState {
        if !self.started {
            return NodeState::Silent;
        }
        for node in &self.nodes {
            if node.state() == NodeState::Wrong {
                return NodeState::Wrong;
            }
        }
        self.nodes[self.nodes.len() - 1].state()
    }

    pub fn is_wrong(&self) -> bool {
        self.state() == NodeState::Wrong
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == NodeState::Terminated
    }
}

// A chain does not own a StageCore of its own, so it cannot implement Node;
// nested graphs hand their tail pipe to the outer graph instead.
impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("started", &self.started)
            .finish()
    }
}
