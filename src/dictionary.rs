//! FIX tag and message dictionaries.
//!
//! Two read-only tables back the codec: a bidirectional mapping between
//! human-readable field names and numeric tag bytes, and the set of required
//! fields per message type. They load once at process start, either from the
//! embedded FIX 4.4 tables or from `FIXtags.txt` / `FIXmsgs.txt` files in a
//! schema-versioned plain-text format.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::error::{FixlineError, Result};

const TAGS_HEADER: &str = "#fixline-dict v1";
const MSGS_HEADER: &str = "#fixline-msgs v1";

static BUILTIN: OnceLock<Arc<Dictionary>> = OnceLock::new();

/// Required-field description of one message type.
#[derive(Debug, Clone)]
pub struct MessageSpec {
    pub name: String,
    pub required: Vec<String>,
}

/// Immutable tag and message tables shared by every session in the process.
#[derive(Debug, Clone)]
pub struct Dictionary {
    by_name: HashMap<String, Bytes>,
    by_tag: HashMap<Bytes, String>,
    messages: HashMap<Bytes, MessageSpec>,
}

impl Dictionary {
    /// The embedded FIX 4.4 tables, parsed once per process.
    pub fn builtin() -> Arc<Dictionary> {
        BUILTIN
            .get_or_init(|| {
                let dict = Dictionary::from_strs(
                    include_str!("dictionaries/fix44_tags.txt"),
                    include_str!("dictionaries/fix44_msgs.txt"),
                )
                .expect("embedded FIX 4.4 dictionary is valid");
                Arc::new(dict)
            })
            .clone()
    }

    /// Loads both tables from disk. Meant to run at startup before any
    /// session exists; a failure here is fatal.
    pub fn load(tags_path: impl AsRef<Path>, msgs_path: impl AsRef<Path>) -> Result<Dictionary> {
        let tags = std::fs::read_to_string(tags_path.as_ref())?;
        let msgs = std::fs::read_to_string(msgs_path.as_ref())?;
        Dictionary::from_strs(&tags, &msgs)
    }

    pub fn from_strs(tags: &str, msgs: &str) -> Result<Dictionary> {
        let mut by_name = HashMap::new();
        let mut by_tag = HashMap::new();
        for (name, rest) in parse_table(tags, TAGS_HEADER)? {
            let tag = rest.first().ok_or_else(|| {
                FixlineError::Dictionary(format!("tag entry '{name}' has no number"))
            })?;
            if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FixlineError::Dictionary(format!(
                    "tag entry '{name}' has non-numeric number '{tag}'"
                )));
            }
            let tag = Bytes::from(tag.to_string());
            if by_name.insert(name.to_string(), tag.clone()).is_some() {
                return Err(FixlineError::Dictionary(format!("duplicate tag name '{name}'")));
            }
            if let Some(prev) = by_tag.insert(tag, name.to_string()) {
                return Err(FixlineError::Dictionary(format!(
                    "tag number of '{name}' already mapped to '{prev}'"
                )));
            }
        }
        let mut messages = HashMap::new();
        for (code, rest) in parse_table(msgs, MSGS_HEADER)? {
            let Some((name, required)) = rest.split_first() else {
                return Err(FixlineError::Dictionary(format!(
                    "message entry '{code}' has no name"
                )));
            };
            for field in required {
                if !by_name.contains_key(*field) {
                    return Err(FixlineError::Dictionary(format!(
                        "message '{name}' requires unknown field '{field}'"
                    )));
                }
            }
            let spec = MessageSpec {
                name: name.to_string(),
                required: required.iter().map(|s| s.to_string()).collect(),
            };
            if messages.insert(Bytes::from(code.to_string()), spec).is_some() {
                return Err(FixlineError::Dictionary(format!(
                    "duplicate message code '{code}'"
                )));
            }
        }
        Ok(Dictionary {
            by_name,
            by_tag,
            messages,
        })
    }

    /// Numeric tag bytes for a field name.
    pub fn tag(&self, name: &str) -> Option<&Bytes> {
        self.by_name.get(name)
    }

    /// Field name for numeric tag bytes.
    pub fn name(&self, tag: &[u8]) -> Option<&str> {
        self.by_tag.get(tag).map(String::as_str)
    }

    /// Message spec for a MsgType code, when the type is known.
    pub fn message(&self, msg_type: &[u8]) -> Option<&MessageSpec> {
        self.messages.get(msg_type)
    }
}

fn parse_table<'a>(input: &'a str, header: &str) -> Result<Vec<(&'a str, Vec<&'a str>)>> {
    let mut lines = input.lines();
    match lines.next() {
        Some(first) if first.trim() == header => {}
        other => {
            return Err(FixlineError::Dictionary(format!(
                "expected header '{header}', found '{}'",
                other.unwrap_or("").trim()
            )))
        }
    }
    let mut entries = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut columns = line.split_whitespace();
        let Some(key) = columns.next() else { continue };
        entries.push((key, columns.collect()));
    }
    Ok(entries)
}
