use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    codec::Opcode,
    error::{GridClientError, Result},
    node::{ClientId, NodeId},
};

pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub client_id: ClientId,
    pub protocol_version: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub node_id: NodeId,
}

/// Body of a topology request; metrics and attributes are requested via frame flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyRequest {
    #[serde(default)]
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheRequest {
    pub cache: Option<String>,
    pub command: CacheCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CacheCommand {
    Get {
        key: Value,
    },
    Put {
        key: Value,
        value: Value,
    },
    Remove {
        key: Value,
    },
    Replace {
        key: Value,
        value: Value,
    },
    CompareAndSet {
        key: Value,
        expected: Option<Value>,
        value: Option<Value>,
    },
    GetAll {
        keys: Vec<Value>,
    },
    PutAll {
        entries: Vec<(Value, Value)>,
    },
    RemoveAll {
        keys: Vec<Value>,
    },
}

impl CacheCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            CacheCommand::Get { .. } => Opcode::CacheGet,
            CacheCommand::Put { .. } => Opcode::CachePut,
            CacheCommand::Remove { .. } => Opcode::CacheRemove,
            CacheCommand::Replace { .. } => Opcode::CacheReplace,
            CacheCommand::CompareAndSet { .. } => Opcode::CacheCompareAndSet,
            CacheCommand::GetAll { .. } => Opcode::CacheGetAll,
            CacheCommand::PutAll { .. } => Opcode::CachePutAll,
            CacheCommand::RemoveAll { .. } => Opcode::CacheRemoveAll,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub task_name: String,
    pub argument: Value,
}

pub fn encode_body<T>(body: &T) -> Result<Bytes>
where
    T: Serialize + ?Sized,
{
    Ok(Bytes::from(serde_json::to_vec(body)?))
}

pub fn decode_body<T>(body: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(body).map_err(|err| {
        GridClientError::Protocol(format!("malformed response body: {err}"))
    })
}

pub(crate) fn to_value<T>(value: &T) -> Result<Value>
where
    T: Serialize + ?Sized,
{
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn from_value<T>(value: Value) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(value)
        .map_err(|err| GridClientError::Protocol(format!("unexpected value shape: {err}")))
}
