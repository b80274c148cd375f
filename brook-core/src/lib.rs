//! Brook core library
//!
//! A real-time streaming speech-recognition runtime: typed packets flow
//! through bounded queues between worker-thread stages, from waveform
//! samples through feature extraction and normalization to an external
//! WFST beam-search decoder. Graphs are assembled once from components and
//! joints, then driven; a transport shim lets a graph span two hosts.

pub mod chain;
pub mod component;
pub mod config;
pub mod control;
pub mod decoder;
pub mod dsp;
pub mod errors;
pub mod estimator;
pub mod feature;
pub mod joint;
pub mod matio;
pub mod packet;
pub mod pipe;
pub mod stream;
pub mod transmit;

// Re-export the graph-building surface.
pub use chain::Chain;
pub use component::{Action, InputArity, Node, NodeState, StageContext, StageCore, Worker};
pub use config::{RuntimeConfig, StreamInfo, EPSILON, SOCKET_RETRY};
pub use errors::{BrookError, Result};
pub use packet::{Packet, Payload, Scalar};
pub use pipe::{Pipe, PipeState};
