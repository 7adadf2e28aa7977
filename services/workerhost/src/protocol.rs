//! Wire message model.
//!
//! A generated schema is assumed to exist matching these message names;
//! this module provides the Rust-side shape the channel and message
//! pump operate on — a tagged variant over `StreamingMessage`, matched
//! exhaustively, replacing dynamic dispatch on a discriminated envelope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::trace::TraceContext;

/// A value carried as an invocation input or output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RpcValue {
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Int(i64),
    Double(f64),
    /// Payload lives in a shared-memory region instead of inline.
    SharedMemory(RpcSharedMemory),
}

impl RpcValue {
    /// Declared type is "transferable" (byte-buffer or string) per §4.4.
    pub fn is_transferable(&self) -> bool {
        matches!(self, Self::String(_) | Self::Bytes(_))
    }

    /// Size in bytes used against the shared-memory threshold.
    pub fn byte_len(&self) -> usize {
        match self {
            Self::String(s) => s.len(),
            Self::Bytes(b) => b.len(),
            Self::Json(v) => v.to_string().len(),
            Self::Int(_) => 8,
            Self::Double(_) => 8,
            Self::SharedMemory(_) => 0,
        }
    }
}

/// A reference to a shared-memory-backed payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcSharedMemory {
    pub region_name: String,
    pub offset: u64,
    pub count: u64,
    pub type_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcInput {
    pub name: String,
    pub declared_type: String,
    pub value: RpcValue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusResult {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInitRequest {
    pub host_version: String,
    pub worker_directory: String,
    pub function_app_directory: String,
    pub protocol_version: String,
    pub host_capabilities: HashMap<String, String>,
    pub v2_compatible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInitResponse {
    pub worker_id: String,
    pub capabilities: HashMap<String, String>,
    pub result: StatusResult,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub function_id: String,
    pub name: String,
    pub language: String,
    pub disabled: bool,
    pub triggers: Vec<String>,
    pub bindings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionLoadRequest {
    pub function_id: String,
    pub metadata: FunctionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionLoadRequestCollection {
    pub requests: Vec<FunctionLoadRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionLoadResponse {
    pub function_id: String,
    pub result: StatusResult,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionLoadResponseCollection {
    pub responses: Vec<FunctionLoadResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub invocation_id: String,
    pub function_id: String,
    pub trace_context: TraceContext,
    pub inputs: Vec<RpcInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub invocation_id: String,
    pub result: StatusResult,
    pub outputs: Vec<RpcValue>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationCancel {
    pub invocation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionEnvironmentReloadRequest {
    pub environment_variables: HashMap<String, String>,
    pub function_app_directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionEnvironmentReloadResponse {
    pub result: StatusResult,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerTerminate {
    pub grace_period_seconds: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcLogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogCategory {
    User,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcLog {
    pub invocation_id: Option<String>,
    pub level: RpcLogLevel,
    pub category: LogCategory,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusRequest {
    pub probe_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusResponse {
    pub probe_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetadataResponse {
    pub function_id: String,
    pub metadata: serde_json::Value,
}

/// The discriminated envelope every message travels in, one per direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamingMessage {
    StartStream { worker_id: String },
    WorkerInitRequest(WorkerInitRequest),
    WorkerInitResponse(WorkerInitResponse),
    FunctionLoadRequest(FunctionLoadRequest),
    FunctionLoadRequestCollection(FunctionLoadRequestCollection),
    FunctionLoadResponse(FunctionLoadResponse),
    FunctionLoadResponseCollection(FunctionLoadResponseCollection),
    InvocationRequest(InvocationRequest),
    InvocationResponse(InvocationResponse),
    InvocationCancel(InvocationCancel),
    FunctionEnvironmentReloadRequest(FunctionEnvironmentReloadRequest),
    FunctionEnvironmentReloadResponse(FunctionEnvironmentReloadResponse),
    WorkerTerminate(WorkerTerminate),
    RpcLog(RpcLog),
    WorkerStatusRequest(WorkerStatusRequest),
    WorkerStatusResponse(WorkerStatusResponse),
    WorkerMetadataResponse(WorkerMetadataResponse),
}

impl StreamingMessage {
    /// Name used in log lines and metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartStream { .. } => "StartStream",
            Self::WorkerInitRequest(_) => "WorkerInitRequest",
            Self::WorkerInitResponse(_) => "WorkerInitResponse",
            Self::FunctionLoadRequest(_) => "FunctionLoadRequest",
            Self::FunctionLoadRequestCollection(_) => "FunctionLoadRequestCollection",
            Self::FunctionLoadResponse(_) => "FunctionLoadResponse",
            Self::FunctionLoadResponseCollection(_) => "FunctionLoadResponseCollection",
            Self::InvocationRequest(_) => "InvocationRequest",
            Self::InvocationResponse(_) => "InvocationResponse",
            Self::InvocationCancel(_) => "InvocationCancel",
            Self::FunctionEnvironmentReloadRequest(_) => "FunctionEnvironmentReloadRequest",
            Self::FunctionEnvironmentReloadResponse(_) => "FunctionEnvironmentReloadResponse",
            Self::WorkerTerminate(_) => "WorkerTerminate",
            Self::RpcLog(_) => "RpcLog",
            Self::WorkerStatusRequest(_) => "WorkerStatusRequest",
            Self::WorkerStatusResponse(_) => "WorkerStatusResponse",
            Self::WorkerMetadataResponse(_) => "WorkerMetadataResponse",
        }
    }
}
