//! Queue message payloads and their serialization disciplines.
//!
//! Four content types are supported on send: `text` stores UTF-8, `json`
//! stores a JSON string, `bytes` stores the raw byte sequence, and `v8`
//! stores a structured-clone encoding. Deserialization on delivery
//! reverses the discipline so bodies decode to the original value.
//!
//! The structured-clone encoding is a node table with index references
//! rather than a pointer graph: sharing and cycles are expressed as
//! indices into the table, so cyclic graphs round-trip without interior
//! mutability. Reducers cover byte buffers, typed arrays, `Map`, `Set`,
//! `Date`, `RegExp`, and `Error` (message, stack, and cause). Unknown
//! tags fail decoding with `DataCloneError`.

use bytes::Bytes;

use crate::error::{ErrorKind, KumoError, Result};

/// Serialization discipline applied to a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Json,
    Bytes,
    V8,
}

impl PayloadKind {
    /// Wire label for the content type.
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::Text => "text",
            PayloadKind::Json => "json",
            PayloadKind::Bytes => "bytes",
            PayloadKind::V8 => "v8",
        }
    }

    /// Parses a wire label.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "text" => Some(PayloadKind::Text),
            "json" => Some(PayloadKind::Json),
            "bytes" => Some(PayloadKind::Bytes),
            "v8" => Some(PayloadKind::V8),
            _ => None,
        }
    }
}

/// A queue message body.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuePayload {
    Text(String),
    Json(serde_json::Value),
    Bytes(Bytes),
    V8(CloneGraph),
}

impl QueuePayload {
    /// The content type of this payload.
    pub fn kind(&self) -> PayloadKind {
        match self {
            QueuePayload::Text(_) => PayloadKind::Text,
            QueuePayload::Json(_) => PayloadKind::Json,
            QueuePayload::Bytes(_) => PayloadKind::Bytes,
            QueuePayload::V8(_) => PayloadKind::V8,
        }
    }

    /// Serializes the payload per its content type.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            QueuePayload::Text(text) => Ok(text.as_bytes().to_vec()),
            QueuePayload::Json(value) => Ok(serde_json::to_vec(value)?),
            QueuePayload::Bytes(bytes) => Ok(bytes.to_vec()),
            QueuePayload::V8(graph) => Ok(graph.encode()),
        }
    }

    /// Reverses [`Self::serialize`] for the given content type.
    pub fn deserialize(kind: PayloadKind, bytes: &[u8]) -> Result<Self> {
        match kind {
            PayloadKind::Text => Ok(QueuePayload::Text(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| KumoError::new(ErrorKind::Validation, "TypeError", e.to_string()))?,
            )),
            PayloadKind::Json => Ok(QueuePayload::Json(serde_json::from_slice(bytes)?)),
            PayloadKind::Bytes => Ok(QueuePayload::Bytes(Bytes::copy_from_slice(bytes))),
            PayloadKind::V8 => Ok(QueuePayload::V8(CloneGraph::decode(bytes)?)),
        }
    }
}

/// Element type of a serialized typed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedArrayKind {
    Uint8,
    Uint8Clamped,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl TypedArrayKind {
    fn tag(self) -> u8 {
        match self {
            TypedArrayKind::Uint8 => 0,
            TypedArrayKind::Uint8Clamped => 1,
            TypedArrayKind::Int8 => 2,
            TypedArrayKind::Uint16 => 3,
            TypedArrayKind::Int16 => 4,
            TypedArrayKind::Uint32 => 5,
            TypedArrayKind::Int32 => 6,
            TypedArrayKind::Float32 => 7,
            TypedArrayKind::Float64 => 8,
            TypedArrayKind::BigInt64 => 9,
            TypedArrayKind::BigUint64 => 10,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => TypedArrayKind::Uint8,
            1 => TypedArrayKind::Uint8Clamped,
            2 => TypedArrayKind::Int8,
            3 => TypedArrayKind::Uint16,
            4 => TypedArrayKind::Int16,
            5 => TypedArrayKind::Uint32,
            6 => TypedArrayKind::Int32,
            7 => TypedArrayKind::Float32,
            8 => TypedArrayKind::Float64,
            9 => TypedArrayKind::BigInt64,
            10 => TypedArrayKind::BigUint64,
            _ => return None,
        })
    }
}

/// One node of a structured-clone graph. Container nodes hold indices
/// into the graph's node table, so back-references and cycles are plain
/// data.
#[derive(Debug, Clone, PartialEq)]
pub enum CloneNode {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<u32>),
    Object(Vec<(String, u32)>),
    Map(Vec<(u32, u32)>),
    Set(Vec<u32>),
    /// Milliseconds since the unix epoch.
    Date(i64),
    RegExp {
        source: String,
        flags: String,
    },
    Error {
        name: String,
        message: String,
        stack: Option<String>,
        cause: Option<u32>,
    },
    ArrayBuffer(Vec<u8>),
    TypedArray {
        kind: TypedArrayKind,
        bytes: Vec<u8>,
    },
}

/// A structured-clone value: a node table plus the root index.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneGraph {
    pub nodes: Vec<CloneNode>,
    pub root: u32,
}

impl CloneGraph {
    /// Builds a single-node graph, the common case for scalar bodies.
    pub fn leaf(node: CloneNode) -> Self {
        Self {
            nodes: vec![node],
            root: 0,
        }
    }

    /// Encodes the graph into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.nodes.len() as u32);
        write_u32(&mut out, self.root);
        for node in &self.nodes {
            encode_node(&mut out, node);
        }
        out
    }

    /// Decodes a wire-form graph, validating tags and node references.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, pos: 0 };
        let count = reader.u32()?;
        let root = reader.u32()?;
        let mut nodes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            nodes.push(decode_node(&mut reader)?);
        }
        let graph = Self { nodes, root };
        graph.validate_refs()?;
        Ok(graph)
    }

    fn validate_refs(&self) -> Result<()> {
        let count = self.nodes.len() as u32;
        let check = |idx: u32| {
            if idx < count {
                Ok(())
            } else {
                Err(clone_error("structured clone references a missing node"))
            }
        };
        check(self.root)?;
        for node in &self.nodes {
            match node {
                CloneNode::Array(items) | CloneNode::Set(items) => {
                    for idx in items {
                        check(*idx)?;
                    }
                }
                CloneNode::Object(fields) => {
                    for (_, idx) in fields {
                        check(*idx)?;
                    }
                }
                CloneNode::Map(entries) => {
                    for (k, v) in entries {
                        check(*k)?;
                        check(*v)?;
                    }
                }
                CloneNode::Error {
                    cause: Some(cause), ..
                } => check(*cause)?,
                _ => {}
            }
        }
        Ok(())
    }
}

fn clone_error(message: &str) -> KumoError {
    KumoError::new(ErrorKind::Validation, "DataCloneError", message)
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, value: &str) {
    write_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

fn encode_node(out: &mut Vec<u8>, node: &CloneNode) {
    match node {
        CloneNode::Undefined => out.push(0),
        CloneNode::Null => out.push(1),
        CloneNode::Bool(value) => {
            out.push(2);
            out.push(*value as u8);
        }
        CloneNode::Number(value) => {
            out.push(3);
            out.extend_from_slice(&value.to_le_bytes());
        }
        CloneNode::String(value) => {
            out.push(4);
            write_str(out, value);
        }
        CloneNode::Array(items) => {
            out.push(5);
            write_u32(out, items.len() as u32);
            for idx in items {
                write_u32(out, *idx);
            }
        }
        CloneNode::Object(fields) => {
            out.push(6);
            write_u32(out, fields.len() as u32);
            for (name, idx) in fields {
                write_str(out, name);
                write_u32(out, *idx);
            }
        }
        CloneNode::Map(entries) => {
            out.push(7);
            write_u32(out, entries.len() as u32);
            for (key, value) in entries {
                write_u32(out, *key);
                write_u32(out, *value);
            }
        }
        CloneNode::Set(items) => {
            out.push(8);
            write_u32(out, items.len() as u32);
            for idx in items {
                write_u32(out, *idx);
            }
        }
        CloneNode::Date(millis) => {
            out.push(9);
            out.extend_from_slice(&millis.to_le_bytes());
        }
        CloneNode::RegExp { source, flags } => {
            out.push(10);
            write_str(out, source);
            write_str(out, flags);
        }
        CloneNode::Error {
            name,
            message,
            stack,
            cause,
        } => {
            out.push(11);
            write_str(out, name);
            write_str(out, message);
            match stack {
                Some(stack) => {
                    out.push(1);
                    write_str(out, stack);
                }
                None => out.push(0),
            }
            match cause {
                Some(cause) => {
                    out.push(1);
                    write_u32(out, *cause);
                }
                None => out.push(0),
            }
        }
        CloneNode::ArrayBuffer(bytes) => {
            out.push(12);
            write_u32(out, bytes.len() as u32);
            out.extend_from_slice(bytes);
        }
        CloneNode::TypedArray { kind, bytes } => {
            out.push(13);
            out.push(kind.tag());
            write_u32(out, bytes.len() as u32);
            out.extend_from_slice(bytes);
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(clone_error("truncated structured clone payload"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| clone_error("invalid UTF-8 in structured clone string"))
    }
}

fn decode_node(reader: &mut Reader<'_>) -> Result<CloneNode> {
    Ok(match reader.u8()? {
        0 => CloneNode::Undefined,
        1 => CloneNode::Null,
        2 => CloneNode::Bool(reader.u8()? != 0),
        3 => CloneNode::Number(f64::from_le_bytes(reader.take(8)?.try_into().unwrap())),
        4 => CloneNode::String(reader.string()?),
        5 => {
            let count = reader.u32()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(reader.u32()?);
            }
            CloneNode::Array(items)
        }
        6 => {
            let count = reader.u32()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = reader.string()?;
                fields.push((name, reader.u32()?));
            }
            CloneNode::Object(fields)
        }
        7 => {
            let count = reader.u32()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let key = reader.u32()?;
                entries.push((key, reader.u32()?));
            }
            CloneNode::Map(entries)
        }
        8 => {
            let count = reader.u32()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(reader.u32()?);
            }
            CloneNode::Set(items)
        }
        9 => CloneNode::Date(i64::from_le_bytes(reader.take(8)?.try_into().unwrap())),
        10 => CloneNode::RegExp {
            source: reader.string()?,
            flags: reader.string()?,
        },
        11 => {
            let name = reader.string()?;
            let message = reader.string()?;
            let stack = if reader.u8()? != 0 {
                Some(reader.string()?)
            } else {
                None
            };
            let cause = if reader.u8()? != 0 {
                Some(reader.u32()?)
            } else {
                None
            };
            CloneNode::Error {
                name,
                message,
                stack,
                cause,
            }
        }
        12 => {
            let len = reader.u32()? as usize;
            CloneNode::ArrayBuffer(reader.take(len)?.to_vec())
        }
        13 => {
            let kind = TypedArrayKind::from_tag(reader.u8()?)
                .ok_or_else(|| clone_error("unknown typed array kind"))?;
            let len = reader.u32()? as usize;
            CloneNode::TypedArray {
                kind,
                bytes: reader.take(len)?.to_vec(),
            }
        }
        // Functions, host objects and anything else hostile never get a
        // tag, so an unknown tag means the payload is not cloneable.
        _ => return Err(clone_error("value is not structured cloneable")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(graph: CloneGraph) -> CloneGraph {
        CloneGraph::decode(&graph.encode()).unwrap()
    }

    #[test]
    fn text_and_bytes_round_trip() {
        let text = QueuePayload::Text("héllo".into());
        let bytes = text.serialize().unwrap();
        assert_eq!(
            QueuePayload::deserialize(PayloadKind::Text, &bytes).unwrap(),
            text
        );

        let raw = QueuePayload::Bytes(Bytes::from_static(&[0, 159, 146, 150]));
        let bytes = raw.serialize().unwrap();
        assert_eq!(
            QueuePayload::deserialize(PayloadKind::Bytes, &bytes).unwrap(),
            raw
        );
    }

    #[test]
    fn json_round_trip() {
        let value = QueuePayload::Json(serde_json::json!({"a": [1, 2, {"b": null}]}));
        let bytes = value.serialize().unwrap();
        assert_eq!(
            QueuePayload::deserialize(PayloadKind::Json, &bytes).unwrap(),
            value
        );
    }

    #[test]
    fn scalar_nodes_round_trip() {
        for node in [
            CloneNode::Undefined,
            CloneNode::Null,
            CloneNode::Bool(true),
            CloneNode::Number(-1.5),
            CloneNode::String("s".into()),
            CloneNode::Date(1_700_000_000_000),
            CloneNode::RegExp {
                source: "a+".into(),
                flags: "gi".into(),
            },
            CloneNode::ArrayBuffer(vec![1, 2, 3]),
            CloneNode::TypedArray {
                kind: TypedArrayKind::Float64,
                bytes: 1.0f64.to_le_bytes().to_vec(),
            },
        ] {
            let graph = CloneGraph::leaf(node.clone());
            assert_eq!(round_trip(graph).nodes[0], node);
        }
    }

    #[test]
    fn cyclic_graph_round_trips() {
        // let a = []; a.push(a); a.push(new Map([[a, a]]));
        let graph = CloneGraph {
            nodes: vec![
                CloneNode::Array(vec![0, 1]),
                CloneNode::Map(vec![(0, 0)]),
            ],
            root: 0,
        };
        let decoded = round_trip(graph.clone());
        assert_eq!(decoded, graph);
    }

    #[test]
    fn error_with_cause_chain() {
        let graph = CloneGraph {
            nodes: vec![
                CloneNode::Error {
                    name: "TypeError".into(),
                    message: "outer".into(),
                    stack: Some("TypeError: outer\n    at worker".into()),
                    cause: Some(1),
                },
                CloneNode::Error {
                    name: "Error".into(),
                    message: "inner".into(),
                    stack: None,
                    cause: None,
                },
            ],
            root: 0,
        };
        assert_eq!(round_trip(graph.clone()), graph);
    }

    #[test]
    fn shared_references_preserved() {
        // Two fields of one object referencing the same set.
        let graph = CloneGraph {
            nodes: vec![
                CloneNode::Object(vec![("x".into(), 1), ("y".into(), 1)]),
                CloneNode::Set(vec![2]),
                CloneNode::Number(7.0),
            ],
            root: 0,
        };
        assert_eq!(round_trip(graph.clone()), graph);
    }

    #[test]
    fn unknown_tag_is_a_data_clone_error() {
        let mut bytes = CloneGraph::leaf(CloneNode::Null).encode();
        // Corrupt the node tag.
        let tag_offset = 8;
        bytes[tag_offset] = 0xEE;
        let err = CloneGraph::decode(&bytes).unwrap_err();
        assert_eq!(err.name(), "DataCloneError");
    }

    #[test]
    fn dangling_reference_is_a_data_clone_error() {
        let graph = CloneGraph {
            nodes: vec![CloneNode::Array(vec![9])],
            root: 0,
        };
        let err = CloneGraph::decode(&graph.encode()).unwrap_err();
        assert_eq!(err.name(), "DataCloneError");
    }

    #[test]
    fn truncated_payload_is_a_data_clone_error() {
        let bytes = CloneGraph::leaf(CloneNode::String("hello".into())).encode();
        let err = CloneGraph::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err.name(), "DataCloneError");
    }
}
