//! Bounded blocking queues connecting stages.
//!
//! A pipe owns a state machine shared by its producer and consumer:
//!
//! ```text
//! silent -> active      on first put
//! active <-> stranded   via block/unblock (pause/backpressure)
//! active -> terminated  on orderly producer completion (readers may drain)
//! any    -> wrong       on failure (cache cleared)
//! ```
//!
//! A terminated pipe that has run empty is *exhausted*: reads fail with
//! `NoMoreData`. Reads from a wrong pipe fail with `Killed`. Two consecutive
//! endpoint markers are collapsed into one, and an endpoint at the head of a
//! freshly reset pipe is dropped.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use atomic_float::AtomicF64;

use crate::config::{RuntimeConfig, StreamInfo};
use crate::errors::{GraphError, Result};
use crate::packet::Packet;

/// Queue state lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Silent,
    Active,
    Stranded,
    Terminated,
    Wrong,
}

/// Observability timers recorded by a pipe.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeTimes {
    pub first_put: Option<Instant>,
    pub last_put: Option<Instant>,
    pub first_get: Option<Instant>,
    pub last_get: Option<Instant>,
}

struct PipeInner {
    cache: VecDeque<Packet>,
    state: PipeState,
    last_was_endpoint: bool,
    extra: Option<StreamInfo>,
    times: PipeTimes,
}

struct Shared {
    name: String,
    inner: Mutex<PipeInner>,
    cond: Condvar,
    // Seconds since the process anchor, refreshed on every state transition.
    // The transport shim compares these across hosts to reconcile peers.
    timestamp: AtomicF64,
    capacity: usize,
    timeout: Duration,
    null: bool,
}

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

fn now_secs() -> f64 {
    anchor().elapsed().as_secs_f64()
}

/// A cloneable handle to a shared queue.
#[derive(Clone)]
pub struct Pipe {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}

impl Pipe {
    pub fn new(name: impl Into<String>, config: &RuntimeConfig) -> Self {
        Self::build(name.into(), config, false)
    }

    /// A placeholder input for source stages; always active and empty.
    pub fn null(config: &RuntimeConfig) -> Self {
        Self::build("null".to_string(), config, true)
    }

    fn build(name: String, config: &RuntimeConfig, null: bool) -> Self {
        let state = if null {
            PipeState::Active
        } else {
            PipeState::Silent
        };
        Self {
            shared: Arc::new(Shared {
                name,
                inner: Mutex::new(PipeInner {
                    cache: VecDeque::new(),
                    state,
                    last_was_endpoint: true,
                    extra: None,
                    times: PipeTimes::default(),
                }),
                cond: Condvar::new(),
                timestamp: AtomicF64::new(now_secs()),
                capacity: config.capacity,
                timeout: config.timeout(),
                null,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_null(&self) -> bool {
        self.shared.null
    }

    pub fn state(&self) -> PipeState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn state_is(&self, states: &[PipeState]) -> bool {
        states.contains(&self.state())
    }

    /// Seconds (process-anchored, monotonic) of the latest state transition.
    pub fn timestamp(&self) -> f64 {
        self.shared.timestamp.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.shared.inner.lock().unwrap().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.inner.lock().unwrap().cache.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.shared.inner.lock().unwrap().cache.len() >= self.shared.capacity
    }

    pub fn is_exhausted(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.state == PipeState::Terminated && inner.cache.is_empty()
    }

    pub fn set_extra_info(&self, info: StreamInfo) {
        self.shared.inner.lock().unwrap().extra = Some(info);
    }

    pub fn extra_info(&self) -> Option<StreamInfo> {
        self.shared.inner.lock().unwrap().extra
    }

    pub fn report_time(&self) -> PipeTimes {
        self.shared.inner.lock().unwrap().times
    }

    fn transition(&self, inner: &mut PipeInner, state: PipeState) {
        if inner.state != state {
            inner.state = state;
            self.shared.timestamp.store(now_secs(), Ordering::Release);
            self.shared.cond.notify_all();
        }
    }

    /// Push a packet to the tail, blocking while the queue is full.
    ///
    /// Consecutive endpoints collapse into one; an endpoint pushed into a
    /// fresh (or just-reset) pipe is dropped outright.
    pub fn put(&self, packet: Packet) -> Result<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        let deadline = Instant::now() + self.shared.timeout;
        loop {
            match inner.state {
                PipeState::Terminated | PipeState::Wrong => {
                    return Err(GraphError::ClosedForWrite {
                        pipe: self.shared.name.clone(),
                    }
                    .into());
                }
                PipeState::Silent => {
                    self.transition(&mut inner, PipeState::Active);
                }
                PipeState::Active | PipeState::Stranded => {
                    if inner.cache.len() < self.shared.capacity {
                        break;
                    }
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    if timeout.is_zero() {
                        return Err(GraphError::Timeout {
                            stage: self.shared.name.clone(),
                            timeout_secs: self.shared.timeout.as_secs(),
                        }
                        .into());
                    }
                    let (guard, _) = self.shared.cond.wait_timeout(inner, timeout).unwrap();
                    inner = guard;
                }
            }
        }

        let now = Instant::now();
        if inner.times.first_put.is_none() {
            inner.times.first_put = Some(now);
        }
        inner.times.last_put = Some(now);

        if packet.is_endpoint() {
            if inner.last_was_endpoint {
                return Ok(());
            }
            inner.last_was_endpoint = true;
        } else {
            inner.last_was_endpoint = false;
        }
        inner.cache.push_back(packet);
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Pop the head packet, blocking up to TIMEOUT while the pipe is empty
    /// or stranded.
    pub fn get(&self) -> Result<Packet> {
        let mut inner = self.shared.inner.lock().unwrap();
        let deadline = Instant::now() + self.shared.timeout;
        loop {
            match inner.state {
                PipeState::Wrong => {
                    return Err(GraphError::Killed {
                        pipe: self.shared.name.clone(),
                    }
                    .into());
                }
                PipeState::Terminated if inner.cache.is_empty() => {
                    return Err(GraphError::NoMoreData {
                        pipe: self.shared.name.clone(),
                    }
                    .into());
                }
                PipeState::Stranded => {}
                _ => {
                    if let Some(packet) = inner.cache.pop_front() {
                        let now = Instant::now();
                        if inner.times.first_get.is_none() {
                            inner.times.first_get = Some(now);
                        }
                        inner.times.last_get = Some(now);
                        self.shared.cond.notify_all();
                        return Ok(packet);
                    }
                }
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                return Err(GraphError::Timeout {
                    stage: self.shared.name.clone(),
                    timeout_secs: self.shared.timeout.as_secs(),
                }
                .into());
            }
            let (guard, _) = self.shared.cond.wait_timeout(inner, timeout).unwrap();
            inner = guard;
        }
    }

    /// Pop the head packet without blocking. Returns `Ok(None)` when the
    /// pipe is empty or stranded.
    pub fn try_get(&self) -> Result<Option<Packet>> {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.state {
            PipeState::Wrong => Err(GraphError::Killed {
                pipe: self.shared.name.clone(),
            }
            .into()),
            PipeState::Terminated if inner.cache.is_empty() => Err(GraphError::NoMoreData {
                pipe: self.shared.name.clone(),
            }
            .into()),
            PipeState::Stranded => Ok(None),
            _ => {
                let popped = inner.cache.pop_front();
                if popped.is_some() {
                    let now = Instant::now();
                    if inner.times.first_get.is_none() {
                        inner.times.first_get = Some(now);
                    }
                    inner.times.last_get = Some(now);
                    self.shared.cond.notify_all();
                }
                Ok(popped)
            }
        }
    }

    /// Mark terminated. Readers may still drain the cache.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if matches!(
            inner.state,
            PipeState::Silent | PipeState::Active | PipeState::Stranded
        ) {
            self.transition(&mut inner, PipeState::Terminated);
        }
    }

    /// Mark wrong and drop the cache.
    pub fn kill(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.cache.clear();
        inner.extra = None;
        self.transition(&mut inner, PipeState::Wrong);
    }

    /// Strand the pipe: reads (and thus the downstream stage) block until
    /// `unblock` or termination.
    pub fn block(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if matches!(inner.state, PipeState::Silent | PipeState::Active) {
            self.transition(&mut inner, PipeState::Stranded);
        }
    }

    pub fn unblock(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == PipeState::Stranded {
            self.transition(&mut inner, PipeState::Active);
        }
    }

    /// Force silent or stranded back to active (used by the transport shim
    /// after peer reconciliation).
    pub fn activate(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if matches!(inner.state, PipeState::Silent | PipeState::Stranded) {
            self.transition(&mut inner, PipeState::Active);
        }
    }

    pub fn clear(&self) {
        self.shared.inner.lock().unwrap().cache.clear();
    }

    /// Reset a drained pipe back to silent so its stage can be restarted.
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.cache.clear();
        inner.extra = None;
        inner.last_was_endpoint = true;
        inner.times = PipeTimes::default();
        self.transition(&mut inner, PipeState::Silent);
    }

    /// Drain a terminated pipe into groups of data packets split by
    /// endpoints.
    pub fn to_list(&self) -> Result<Vec<Vec<Packet>>> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state != PipeState::Terminated {
            return Err(GraphError::ClosedForWrite {
                pipe: self.shared.name.clone(),
            }
            .into());
        }
        let mut groups = Vec::new();
        let mut current = Vec::new();
        for packet in inner.cache.drain(..) {
            if packet.is_endpoint() {
                if !current.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
            } else {
                current.push(packet);
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BrookError;
    use crate::packet::{Packet, Payload, Scalar};
    use std::thread;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig {
            timeout_secs: 1,
            ..Default::default()
        }
    }

    fn element(cid: u64) -> Packet {
        Packet::new("data", Payload::Element(Scalar::I16(cid as i16)), cid, 0)
    }

    #[test]
    fn test_first_put_activates() {
        let pipe = Pipe::new("p", &cfg());
        assert_eq!(pipe.state(), PipeState::Silent);
        pipe.put(element(0)).unwrap();
        assert_eq!(pipe.state(), PipeState::Active);
    }

    #[test]
    fn test_head_endpoint_is_dropped() {
        let pipe = Pipe::new("p", &cfg());
        pipe.put(Packet::endpoint(0, 0)).unwrap();
        assert!(pipe.is_empty());
    }

    #[test]
    fn test_consecutive_endpoints_collapse() {
        let pipe = Pipe::new("p", &cfg());
        pipe.put(element(0)).unwrap();
        pipe.put(Packet::endpoint(1, 0)).unwrap();
        pipe.put(Packet::endpoint(2, 0)).unwrap();
        pipe.put(element(3)).unwrap();
        pipe.put(Packet::endpoint(4, 0)).unwrap();
        assert_eq!(pipe.size(), 4);
    }

    #[test]
    fn test_terminated_pipe_drains_then_fails() {
        let pipe = Pipe::new("p", &cfg());
        pipe.put(element(0)).unwrap();
        pipe.stop();
        assert!(pipe.put(element(1)).is_err());
        assert!(pipe.get().is_ok());
        match pipe.get() {
            Err(BrookError::Graph(GraphError::NoMoreData { .. })) => {}
            other => panic!("expected NoMoreData, got {other:?}"),
        }
        assert!(pipe.is_exhausted());
    }

    #[test]
    fn test_killed_pipe_drops_contents() {
        let pipe = Pipe::new("p", &cfg());
        pipe.put(element(0)).unwrap();
        pipe.kill();
        assert_eq!(pipe.size(), 0);
        match pipe.get() {
            Err(BrookError::Graph(GraphError::Killed { .. })) => {}
            other => panic!("expected Killed, got {other:?}"),
        }
    }

    #[test]
    fn test_stranded_reads_block_until_unblocked() {
        let pipe = Pipe::new("p", &cfg());
        pipe.put(element(0)).unwrap();
        pipe.block();
        assert_eq!(pipe.try_get().unwrap(), None);
        let reader = {
            let pipe = pipe.clone();
            thread::spawn(move || pipe.get())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!reader.is_finished());
        pipe.unblock();
        assert!(reader.join().unwrap().is_ok());
    }

    #[test]
    fn test_to_list_splits_on_endpoints() {
        let pipe = Pipe::new("p", &cfg());
        pipe.put(element(0)).unwrap();
        pipe.put(element(1)).unwrap();
        pipe.put(Packet::endpoint(2, 0)).unwrap();
        pipe.put(element(3)).unwrap();
        pipe.stop();
        let groups = pipe.to_list().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
    }

    #[test]
    fn test_reset_drops_new_head_endpoint_again() {
        let pipe = Pipe::new("p", &cfg());
        pipe.put(element(0)).unwrap();
        pipe.stop();
        pipe.reset();
        assert_eq!(pipe.state(), PipeState::Silent);
        pipe.put(Packet::endpoint(0, 0)).unwrap();
        assert!(pipe.is_empty());
    }

    #[test]
    fn test_get_times_out_on_empty_pipe() {
        let pipe = Pipe::new("p", &cfg());
        pipe.put(element(0)).unwrap();
        pipe.get().unwrap();
        match pipe.get() {
            Err(BrookError::Graph(GraphError::Timeout { .. })) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_bounded_put_blocks_until_space() {
        let config = RuntimeConfig {
            capacity: 2,
            timeout_secs: 2,
            ..Default::default()
        };
        let pipe = Pipe::new("p", &config);
        pipe.put(element(0)).unwrap();
        pipe.put(element(1)).unwrap();
        assert!(pipe.is_full());
        let writer = {
            let pipe = pipe.clone();
            thread::spawn(move || pipe.put(element(2)))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!writer.is_finished());
        pipe.get().unwrap();
        assert!(writer.join().unwrap().is_ok());
        assert_eq!(pipe.size(), 2);
    }
}
