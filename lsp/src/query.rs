//! Query kinds: a request builder and response parser per LSP method.
//!
//! The client knows nothing about hover text or locations. It asks a
//! [`QueryKind`] for the method name and params, and hands the raw `result`
//! back to it for parsing.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::LspError;
use crate::protocol;

/// One position in one version of a document.
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    pub path: PathBuf,
    /// Full source text the server should analyse.
    pub text: String,
    /// 0-indexed line.
    pub line: u32,
    /// 0-indexed UTF-16 column, as LSP counts it.
    pub character: u32,
}

impl DocumentQuery {
    pub fn new(
        path: impl Into<PathBuf>,
        text: impl Into<String>,
        line: u32,
        character: u32,
    ) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
            line,
            character,
        }
    }
}

pub trait QueryKind: Send + Sync {
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn method(&self) -> &'static str;

    fn params(&self, uri: &str, line: u32, character: u32) -> serde_json::Value {
        protocol::text_document_position_params(uri, line, character)
    }

    /// Interpret a successful `result`. `Ok(None)` means the server had
    /// nothing to say (a `null` result).
    fn parse(&self, result: serde_json::Value) -> Result<Option<Self::Output>, LspError>;

    /// Whether `output` carries real payload. Only meaningful results are
    /// cached, so a transient empty answer is never pinned.
    fn is_meaningful(&self, output: &Self::Output) -> bool {
        let _ = output;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

impl Location {
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        protocol::file_uri_to_path(&self.uri)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoverInfo {
    /// Hover text with markup left as the server sent it.
    pub contents: String,
    pub range: Option<Range>,
}

/// `textDocument/hover`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hover;

impl QueryKind for Hover {
    type Output = HoverInfo;

    fn method(&self) -> &'static str {
        "textDocument/hover"
    }

    fn parse(&self, result: serde_json::Value) -> Result<Option<HoverInfo>, LspError> {
        if result.is_null() {
            return Ok(None);
        }
        let contents = result
            .get("contents")
            .ok_or_else(|| LspError::Protocol("hover result without contents".to_string()))?;
        let range = match result.get("range") {
            Some(range) if !range.is_null() => Some(serde_json::from_value(range.clone())?),
            _ => None,
        };
        Ok(Some(HoverInfo {
            contents: render_hover_contents(contents),
            range,
        }))
    }

    fn is_meaningful(&self, output: &HoverInfo) -> bool {
        !output.contents.trim().is_empty()
    }
}

/// Flatten `MarkupContent`, `MarkedString` or `MarkedString[]` into text.
fn render_hover_contents(contents: &serde_json::Value) -> String {
    match contents {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(render_hover_contents)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        serde_json::Value::Object(obj) => obj
            .get("value")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// `textDocument/definition`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Definition;

impl QueryKind for Definition {
    type Output = Vec<Location>;

    fn method(&self) -> &'static str {
        "textDocument/definition"
    }

    fn parse(&self, result: serde_json::Value) -> Result<Option<Vec<Location>>, LspError> {
        parse_locations(result)
    }

    fn is_meaningful(&self, output: &Vec<Location>) -> bool {
        !output.is_empty()
    }
}

/// `textDocument/typeDefinition`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeDefinition;

impl QueryKind for TypeDefinition {
    type Output = Vec<Location>;

    fn method(&self) -> &'static str {
        "textDocument/typeDefinition"
    }

    fn parse(&self, result: serde_json::Value) -> Result<Option<Vec<Location>>, LspError> {
        parse_locations(result)
    }

    fn is_meaningful(&self, output: &Vec<Location>) -> bool {
        !output.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationLink {
    target_uri: String,
    target_range: Range,
    #[serde(default)]
    target_selection_range: Option<Range>,
}

/// Accepts `Location`, `Location[]`, `LocationLink[]` and `null`.
fn parse_locations(result: serde_json::Value) -> Result<Option<Vec<Location>>, LspError> {
    match result {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(parse_location_item)
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        single => Ok(Some(vec![parse_location_item(single)?])),
    }
}

fn parse_location_item(item: serde_json::Value) -> Result<Location, LspError> {
    if item.get("targetUri").is_some() {
        let link: LocationLink = serde_json::from_value(item)?;
        return Ok(Location {
            uri: link.target_uri,
            range: link.target_selection_range.unwrap_or(link.target_range),
        });
    }
    Ok(serde_json::from_value(item)?)
}
