//! Scriptable stand-in for a language analysis server.
//!
//! Speaks the framed protocol on stdio. Hover answers `"<word> at L:C"`
//! using the word under the cursor in the opened text; definition points
//! at the word's first occurrence in the same document.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{Stdin, Stdout};
use tokio::sync::Mutex;

use typelens_lsp::codec::{FrameReader, FrameWriter};

#[derive(Parser, Debug, Clone)]
#[command(name = "typelens-mock-server")]
struct Args {
    /// Reply to `initialize` with an error
    #[arg(long)]
    fail_initialize: bool,
    /// Delay every hover reply
    #[arg(long, default_value_t = 0)]
    hover_delay_ms: u64,
    /// Exit with status 3 right after the `initialized` notification
    #[arg(long)]
    exit_after_initialize: bool,
    /// Reply to hover with a JSON-RPC error
    #[arg(long)]
    error_on_hover: bool,
    /// Never reply to requests for this method (repeatable)
    #[arg(long)]
    no_reply: Vec<String>,
    /// Append the method of every received message to this file
    #[arg(long)]
    record: Option<PathBuf>,
}

type Writer = Arc<Mutex<FrameWriter<Stdout>>>;

async fn send(writer: &Writer, msg: Value) {
    if let Err(e) = writer.lock().await.write_frame(&msg).await {
        eprintln!("mock-server: write failed: {e}");
    }
}

fn result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn record(path: &Path, method: &str) {
    let appended = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{method}"));
    if let Err(e) = appended {
        eprintln!("mock-server: recording {method} failed: {e}");
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// The identifier touching `character` on `line`, with its start column.
fn word_at(text: &str, line: u64, character: u64) -> Option<(String, usize)> {
    let chars: Vec<char> = text.lines().nth(usize::try_from(line).ok()?)?.chars().collect();
    let mut idx = usize::try_from(character).ok()?.min(chars.len());
    if idx == chars.len() || !is_word_char(chars[idx]) {
        if idx > 0 && is_word_char(chars[idx - 1]) {
            idx -= 1;
        } else {
            return None;
        }
    }
    let start = chars[..idx]
        .iter()
        .rposition(|c| !is_word_char(*c))
        .map_or(0, |p| p + 1);
    let end = chars[idx..]
        .iter()
        .position(|c| !is_word_char(*c))
        .map_or(chars.len(), |p| idx + p);
    Some((chars[start..end].iter().collect(), start))
}

/// First occurrence of `word` as a whole identifier.
fn first_occurrence(text: &str, word: &str) -> Option<(usize, usize)> {
    for (line_no, line) in text.lines().enumerate() {
        let chars: Vec<char> = line.chars().collect();
        let target: Vec<char> = word.chars().collect();
        let mut col = 0;
        while col + target.len() <= chars.len() {
            let bounded_left = col == 0 || !is_word_char(chars[col - 1]);
            let bounded_right =
                col + target.len() == chars.len() || !is_word_char(chars[col + target.len()]);
            if bounded_left && bounded_right && chars[col..col + target.len()] == target[..] {
                return Some((line_no, col));
            }
            col += 1;
        }
    }
    None
}

fn position(params: &Value) -> (String, u64, u64) {
    let uri = params["textDocument"]["uri"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let line = params["position"]["line"].as_u64().unwrap_or(0);
    let character = params["position"]["character"].as_u64().unwrap_or(0);
    (uri, line, character)
}

fn hover_result(documents: &HashMap<String, String>, params: &Value) -> Value {
    let (uri, line, character) = position(params);
    let Some((word, start)) = documents
        .get(&uri)
        .and_then(|text| word_at(text, line, character))
    else {
        return Value::Null;
    };
    json!({
        "contents": { "kind": "markdown", "value": format!("{word} at {line}:{character}") },
        "range": {
            "start": { "line": line, "character": start },
            "end": { "line": line, "character": start + word.chars().count() }
        }
    })
}

fn definition_result(documents: &HashMap<String, String>, params: &Value) -> Value {
    let (uri, line, character) = position(params);
    let Some(text) = documents.get(&uri) else {
        return Value::Null;
    };
    let Some((word, _)) = word_at(text, line, character) else {
        return json!([]);
    };
    let Some((def_line, def_col)) = first_occurrence(text, &word) else {
        return json!([]);
    };
    json!([{
        "uri": uri,
        "range": {
            "start": { "line": def_line, "character": def_col },
            "end": { "line": def_line, "character": def_col + word.chars().count() }
        }
    }])
}

async fn serve(args: Args, mut reader: FrameReader<Stdin>, writer: Writer) -> Result<()> {
    let no_reply: HashSet<String> = args.no_reply.iter().cloned().collect();
    let mut documents: HashMap<String, String> = HashMap::new();

    while let Some(msg) = reader.read_frame().await? {
        let method = msg["method"].as_str().unwrap_or_default().to_string();
        let params = msg.get("params").cloned().unwrap_or(Value::Null);
        if let Some(path) = &args.record {
            record(path, &method);
        }
        let Some(id) = msg.get("id").cloned() else {
            // Notifications are applied in arrival order.
            match method.as_str() {
                "initialized" if args.exit_after_initialize => {
                    eprintln!("mock-server: exiting after initialize");
                    std::process::exit(3);
                }
                "textDocument/didOpen" => {
                    let doc = &params["textDocument"];
                    if let (Some(uri), Some(text)) = (doc["uri"].as_str(), doc["text"].as_str()) {
                        documents.insert(uri.to_string(), text.to_string());
                    }
                }
                "textDocument/didChange" => {
                    let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
                    if let Some(text) = params["contentChanges"][0]["text"].as_str() {
                        documents.insert(uri.to_string(), text.to_string());
                    }
                }
                "textDocument/didClose" => {
                    let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
                    documents.remove(uri);
                }
                "exit" => std::process::exit(0),
                _ => {}
            }
            continue;
        };

        if no_reply.contains(&method) {
            continue;
        }

        match method.as_str() {
            "initialize" if args.fail_initialize => {
                send(&writer, error(&id, -32603, "initialize refused")).await;
            }
            "initialize" => {
                let caps = json!({
                    "capabilities": {
                        "hoverProvider": true,
                        "definitionProvider": true
                    },
                    "serverInfo": { "name": "typelens-mock-server" }
                });
                send(&writer, result(&id, caps)).await;
            }
            "shutdown" => send(&writer, result(&id, Value::Null)).await,
            "textDocument/hover" if args.error_on_hover => {
                send(&writer, error(&id, -32000, "hover failed")).await;
            }
            "textDocument/hover" => {
                // Answer from the text as it is now; a later didClose must
                // not change this reply.
                let reply = result(&id, hover_result(&documents, &params));
                let writer = writer.clone();
                let delay = Duration::from_millis(args.hover_delay_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    send(&writer, reply).await;
                });
            }
            "textDocument/definition" => {
                send(&writer, result(&id, definition_result(&documents, &params))).await;
            }
            "mock/openDocuments" => send(&writer, result(&id, json!(documents.len()))).await,
            _ => send(&writer, error(&id, -32601, "method not found")).await,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    eprintln!("mock-server: started with {args:?}");
    let reader = FrameReader::new(tokio::io::stdin());
    let writer = Arc::new(Mutex::new(FrameWriter::new(tokio::io::stdout())));
    serve(args, reader, writer).await
}
