//! Debian control-file stanza reader.
//!
//! A "Packages" index is a sequence of stanzas: blocks of `Key: value`
//! lines separated by blank lines, where a line starting with whitespace
//! continues the previous field (multi-line descriptions).

use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use super::FetchError;

/// One parsed stanza.
#[derive(Debug, Default, Clone)]
pub struct Stanza {
    fields: HashMap<String, String>,
}

impl Stanza {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Field value, or empty string when absent.
    pub fn field(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Streaming stanza reader over any buffered async source.
pub struct ControlReader<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> ControlReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Read the next stanza, or `None` at end of input.
    pub async fn next_stanza(&mut self) -> Result<Option<Stanza>, FetchError> {
        let mut stanza = Stanza::default();
        let mut last_key: Option<String> = None;

        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                if stanza.is_empty() {
                    // Leading blank lines between stanzas.
                    continue;
                }
                return Ok(Some(stanza));
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                let value = last_key
                    .as_ref()
                    .and_then(|key| stanza.fields.get_mut(key))
                    .ok_or_else(|| FetchError::MalformedStanza(line.clone()))?;
                value.push('\n');
                value.push_str(line.trim_start());
                continue;
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FetchError::MalformedStanza(line.clone()))?;
            let key = key.trim().to_string();
            stanza
                .fields
                .insert(key.clone(), value.trim().to_string());
            last_key = Some(key);
        }

        if stanza.is_empty() {
            Ok(None)
        } else {
            Ok(Some(stanza))
        }
    }
}
