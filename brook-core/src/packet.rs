//! Typed packets flowing through the stage graph.
//!
//! A packet carries one or more named payload slots (so a single packet can
//! hold, say, both an fbank and an mfcc matrix), a chunk id that is strictly
//! increasing per producer, and the id of the stage that produced it. An
//! endpoint packet terminates a logical utterance without terminating the
//! stream; it may still carry result slots.

use ndarray::{Array1, Array2};

use crate::errors::{Result, TransportError};

/// A single scalar sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I16(i16),
    I32(i32),
    F32(f32),
}

impl Scalar {
    pub fn as_f32(&self) -> f32 {
        match self {
            Scalar::I16(v) => f32::from(*v),
            Scalar::I32(v) => *v as f32,
            Scalar::F32(v) => *v,
        }
    }
}

impl From<i16> for Scalar {
    fn from(v: i16) -> Self {
        Scalar::I16(v)
    }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Scalar::F32(v)
    }
}

/// Payload slot of a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A single sample.
    Element(Scalar),
    /// A 1-d numeric array (one frame).
    Vector(Array1<f32>),
    /// A 2-d numeric array (a chunk of frames x features).
    Matrix(Array2<f32>),
    /// A partial or 1-best hypothesis.
    Text(String),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Element(_) => "element",
            Payload::Vector(_) => "vector",
            Payload::Matrix(_) => "matrix",
            Payload::Text(_) => "text",
        }
    }

    pub fn as_vector(&self) -> Option<&Array1<f32>> {
        match self {
            Payload::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&Array2<f32>> {
        match self {
            Payload::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_element(&self) -> Option<Scalar> {
        match self {
            Payload::Element(e) => Some(*e),
            _ => None,
        }
    }
}

/// A tagged value passed between stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    cid: u64,
    producer: u64,
    slots: Vec<(String, Payload)>,
    main: Option<usize>,
    endpoint: bool,
}

impl Packet {
    /// A data packet with a single named slot.
    pub fn new(key: impl Into<String>, payload: Payload, cid: u64, producer: u64) -> Self {
        Self {
            cid,
            producer,
            slots: vec![(key.into(), payload)],
            main: Some(0),
            endpoint: false,
        }
    }

    /// A data packet built from an existing slot list. The first slot becomes
    /// the main one.
    pub fn from_slots(slots: Vec<(String, Payload)>, cid: u64, producer: u64) -> Self {
        let main = if slots.is_empty() { None } else { Some(0) };
        Self {
            cid,
            producer,
            slots,
            main,
            endpoint: false,
        }
    }

    /// A packet with no payload at all.
    pub fn null(cid: u64, producer: u64) -> Self {
        Self {
            cid,
            producer,
            slots: Vec::new(),
            main: None,
            endpoint: false,
        }
    }

    /// An endpoint marker.
    pub fn endpoint(cid: u64, producer: u64) -> Self {
        Self {
            cid,
            producer,
            slots: Vec::new(),
            main: None,
            endpoint: true,
        }
    }

    /// Turn a data packet into an endpoint carrying the same slots and ids.
    pub fn into_endpoint(mut self) -> Self {
        self.endpoint = true;
        self
    }

    pub fn cid(&self) -> u64 {
        self.cid
    }

    pub fn producer(&self) -> u64 {
        self.producer
    }

    pub fn is_endpoint(&self) -> bool {
        self.endpoint
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.slots
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// The key designated as main, defaulting to the first slot.
    pub fn main_key(&self) -> Option<&str> {
        self.main.map(|i| self.slots[i].0.as_str())
    }

    /// The payload of the main slot.
    pub fn main(&self) -> Option<&Payload> {
        self.main.map(|i| &self.slots[i].1)
    }

    /// Insert or replace a slot, optionally designating it as main.
    pub fn add(&mut self, key: impl Into<String>, payload: Payload, as_main: bool) {
        let key = key.into();
        let idx = match self.slots.iter().position(|(k, _)| *k == key) {
            Some(i) => {
                self.slots[i].1 = payload;
                i
            }
            None => {
                self.slots.push((key, payload));
                self.slots.len() - 1
            }
        };
        if as_main || self.main.is_none() {
            self.main = Some(idx);
        }
    }

    /// Consume the packet and return its slot list.
    pub fn into_slots(self) -> Vec<(String, Payload)> {
        self.slots
    }

    pub fn slots(&self) -> &[(String, Payload)] {
        &self.slots
    }

    /// Serialize to the wire format of the transport shim.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(u8::from(self.endpoint));
        out.extend_from_slice(&self.cid.to_le_bytes());
        out.extend_from_slice(&(self.producer as u32).to_le_bytes());
        out.push(self.main.map(|i| i as u8).unwrap_or(u8::MAX));
        out.push(self.slots.len() as u8);
        for (key, payload) in &self.slots {
            out.push(key.len() as u8);
            out.extend_from_slice(key.as_bytes());
            let body = encode_payload(payload);
            out.push(payload_tag(payload));
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&body);
        }
        out
    }

    /// Deserialize from the wire format of the transport shim.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let endpoint = cur.u8()? != 0;
        let cid = u64::from_le_bytes(cur.take(8)?.try_into().unwrap());
        let producer = u64::from(u32::from_le_bytes(cur.take(4)?.try_into().unwrap()));
        let main_raw = cur.u8()?;
        let count = cur.u8()? as usize;
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let klen = cur.u8()? as usize;
            let key = String::from_utf8(cur.take(klen)?.to_vec())
                .map_err(|_| malformed("slot key is not UTF-8"))?;
            let tag = cur.u8()?;
            let blen = u32::from_le_bytes(cur.take(4)?.try_into().unwrap()) as usize;
            let body = cur.take(blen)?;
            slots.push((key, decode_payload(tag, body)?));
        }
        let main = if main_raw == u8::MAX {
            None
        } else if (main_raw as usize) < slots.len() {
            Some(main_raw as usize)
        } else {
            return Err(malformed("main slot index out of range"));
        };
        Ok(Self {
            cid,
            producer,
            slots,
            main,
            endpoint,
        })
    }
}

fn payload_tag(p: &Payload) -> u8 {
    match p {
        Payload::Element(_) => 0,
        Payload::Vector(_) => 1,
        Payload::Matrix(_) => 2,
        Payload::Text(_) => 3,
    }
}

// Numeric payloads lead with a dtype pair: b'I' or b'F' plus the element
// width in bytes. Matrices add a 4-byte row count.
fn encode_payload(p: &Payload) -> Vec<u8> {
    match p {
        Payload::Element(Scalar::I16(v)) => {
            let mut out = vec![b'I', 2];
            out.extend_from_slice(&v.to_le_bytes());
            out
        }
        Payload::Element(Scalar::I32(v)) => {
            let mut out = vec![b'I', 4];
            out.extend_from_slice(&v.to_le_bytes());
            out
        }
        Payload::Element(Scalar::F32(v)) => {
            let mut out = vec![b'F', 4];
            out.extend_from_slice(&v.to_le_bytes());
            out
        }
        Payload::Vector(v) => {
            let mut out = vec![b'F', 4];
            for x in v.iter() {
                out.extend_from_slice(&x.to_le_bytes());
            }
            out
        }
        Payload::Matrix(m) => {
            let mut out = vec![b'F', 4];
            out.extend_from_slice(&(m.nrows() as u32).to_le_bytes());
            for x in m.iter() {
                out.extend_from_slice(&x.to_le_bytes());
            }
            out
        }
        Payload::Text(t) => t.as_bytes().to_vec(),
    }
}

fn decode_payload(tag: u8, body: &[u8]) -> Result<Payload> {
    match tag {
        0 => {
            let (flag, width, rest) = split_dtype(body)?;
            match (flag, width) {
                (b'I', 2) => Ok(Payload::Element(Scalar::I16(i16::from_le_bytes(
                    rest.try_into().map_err(|_| malformed("short element"))?,
                )))),
                (b'I', 4) => Ok(Payload::Element(Scalar::I32(i32::from_le_bytes(
                    rest.try_into().map_err(|_| malformed("short element"))?,
                )))),
                (b'F', 4) => Ok(Payload::Element(Scalar::F32(f32::from_le_bytes(
                    rest.try_into().map_err(|_| malformed("short element"))?,
                )))),
                _ => Err(malformed("unsupported element dtype")),
            }
        }
        1 => {
            let (flag, width, rest) = split_dtype(body)?;
            if flag != b'F' || width != 4 {
                return Err(malformed("unsupported vector dtype"));
            }
            Ok(Payload::Vector(Array1::from_vec(read_f32s(rest)?)))
        }
        2 => {
            let (flag, width, rest) = split_dtype(body)?;
            if flag != b'F' || width != 4 {
                return Err(malformed("unsupported matrix dtype"));
            }
            if rest.len() < 4 {
                return Err(malformed("matrix body too short"));
            }
            let rows = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
            let values = read_f32s(&rest[4..])?;
            if rows == 0 || values.len() % rows != 0 {
                return Err(malformed("matrix row count does not divide payload"));
            }
            let cols = values.len() / rows;
            let mat = Array2::from_shape_vec((rows, cols), values)
                .map_err(|_| malformed("bad matrix shape"))?;
            Ok(Payload::Matrix(mat))
        }
        3 => Ok(Payload::Text(
            String::from_utf8(body.to_vec()).map_err(|_| malformed("text is not UTF-8"))?,
        )),
        other => Err(TransportError::MalformedPacket {
            reason: format!("unknown payload tag {other}"),
        }
        .into()),
    }
}

fn split_dtype(body: &[u8]) -> Result<(u8, u8, &[u8])> {
    if body.len() < 2 {
        return Err(malformed("payload too short for dtype header"));
    }
    Ok((body[0], body[1], &body[2..]))
}

fn read_f32s(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(malformed("float payload is not a multiple of 4 bytes"));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn malformed(reason: &str) -> crate::errors::BrookError {
    TransportError::MalformedPacket {
        reason: reason.to_string(),
    }
    .into()
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(malformed("packet bytes truncated"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_main_key_defaults_to_first_slot() {
        let mut packet = Packet::new("mfcc", Payload::Vector(arr1(&[1.0, 2.0])), 0, 7);
        assert_eq!(packet.main_key(), Some("mfcc"));
        packet.add("fbank", Payload::Vector(arr1(&[3.0])), false);
        assert_eq!(packet.main_key(), Some("mfcc"));
        packet.add("fbank", Payload::Vector(arr1(&[4.0])), true);
        assert_eq!(packet.main_key(), Some("fbank"));
    }

    #[test]
    fn test_endpoint_can_carry_results() {
        let mut ep = Packet::endpoint(3, 1);
        assert!(ep.is_endpoint() && ep.is_empty());
        ep.add("text", Payload::Text("hello".into()), true);
        assert!(ep.is_endpoint());
        assert_eq!(ep.main().unwrap().as_text(), Some("hello"));
    }

    #[test]
    fn test_element_round_trip_preserves_dtype() {
        let packet = Packet::new("data", Payload::Element(Scalar::I16(-1234)), 5, 2);
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_vector_round_trip_bit_for_bit() {
        let vec = arr1(&[0.0f32, -0.0, 1.5e-38, f32::MAX, 3.141_592_7]);
        let packet = Packet::new("data", Payload::Vector(vec), 9, 4);
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_matrix_round_trip() {
        let mat = arr2(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let mut packet = Packet::new("probs", Payload::Matrix(mat), 11, 3);
        packet.add("text", Payload::Text("partial one".into()), false);
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_decode_rejects_truncated_bytes() {
        let packet = Packet::new("data", Payload::Vector(arr1(&[1.0f32; 8])), 0, 0);
        let bytes = packet.encode();
        assert!(Packet::decode(&bytes[..bytes.len() - 3]).is_err());
    }
}
