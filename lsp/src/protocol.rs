//! JSON-RPC 2.0 envelopes and the LSP-shaped params the client sends.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// JSON-RPC "Method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC "Internal error"; stands in for an error member we cannot decode.
pub(crate) const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// The `error` member of a response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// A decoded frame, classified by shape.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    /// Reply to one of our requests: `result` XOR `error`.
    Response {
        id: u64,
        outcome: Result<serde_json::Value, ResponseError>,
    },
    /// The server asking us something; it expects a reply.
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

/// Our ids are integers, but some servers echo them back as strings.
fn response_id(id: &serde_json::Value) -> Option<u64> {
    id.as_u64()
        .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
}

pub(crate) fn parse_incoming(frame: &serde_json::Value) -> Option<Incoming> {
    let id = frame.get("id").filter(|id| !id.is_null());
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let error = frame.get("error");
    let result = frame.get("result");

    match (id, method) {
        (Some(id_val), None) if error.is_some() || result.is_some() => {
            let id = response_id(id_val)?;
            let outcome = match error {
                Some(err) => Err(serde_json::from_value(err.clone()).unwrap_or_else(|_| {
                    ResponseError {
                        code: INTERNAL_ERROR,
                        message: err.to_string(),
                        data: None,
                    }
                })),
                None => Ok(result.cloned().unwrap_or(serde_json::Value::Null)),
            };
            Some(Incoming::Response { id, outcome })
        }
        (Some(id_val), Some(method)) => Some(Incoming::ServerRequest {
            id: id_val.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method)) => Some(Incoming::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Reply to a server-initiated request.
///
/// `workspace/configuration` gets one `null` per requested item; anything
/// else gets "method not found" so the server does not block on us.
pub(crate) fn server_request_reply(
    id: &serde_json::Value,
    method: &str,
    params: Option<&serde_json::Value>,
) -> serde_json::Value {
    if method == "workspace/configuration" {
        let items = params
            .and_then(|p| p.get("items"))
            .and_then(|items| items.as_array())
            .map_or(0, Vec::len);
        return serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": vec![serde_json::Value::Null; items],
        });
    }
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

pub(crate) fn initialize_params(root_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "clientInfo": { "name": "typelens", "version": env!("CARGO_PKG_VERSION") },
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["markdown", "plaintext"]
                },
                "definition": { "dynamicRegistration": false, "linkSupport": true },
                "typeDefinition": { "dynamicRegistration": false, "linkSupport": true }
            },
            "workspace": { "configuration": true }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn text_document_position_params(
    uri: &str,
    line: u32,
    character: u32,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
