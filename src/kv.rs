//! Strict `KEY=value` document codec.
//!
//! The on-disk format for VM records and process handles:
//!
//! ```text
//! # comment
//! NAME=web
//! CPU_MODEL="host,+vmx"
//! SHARED_FOLDER_0="/srv/my data|data|virtiofs"
//! ```
//!
//! Keys are `[A-Z0-9_]+`. Values are bare (no whitespace, quotes or
//! backslashes) or double-quoted with `\"` and `\\` escapes. Control
//! characters are rejected anywhere and a key may appear only once. The
//! text is parsed, never evaluated.

use std::fmt::Write as _;

/// Ordered set of key-value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    entries: Vec<(String, String)>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse document text. The error names the offending line.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut doc = Document::new();
        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            if raw.chars().any(|c| c.is_control()) {
                return Err(format!("line {}: control character", lineno));
            }
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, rest) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected KEY=value", lineno))?;
            if !valid_key(key) {
                return Err(format!("line {}: invalid key '{}'", lineno, key));
            }
            let value = parse_value(rest).map_err(|e| format!("line {}: {}", lineno, e))?;
            if doc.get(key).is_some() {
                return Err(format!("line {}: duplicate key {}", lineno, key));
            }
            doc.entries.push((key.to_string(), value));
        }
        Ok(doc)
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove and return a value.
    pub fn take(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Set a value, replacing an existing one in place.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), String> {
        let value = value.into();
        if !valid_key(key) {
            return Err(format!("invalid key '{}'", key));
        }
        if value.chars().any(|c| c.is_control()) {
            return Err(format!("control character in value for {}", key));
        }
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
        Ok(())
    }

    /// Keys in document order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the document has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the document, one entry per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            let _ = writeln!(out, "{}={}", k, quote(v));
        }
        out
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn parse_value(raw: &str) -> Result<String, String> {
    let Some(body) = raw.strip_prefix('"') else {
        if raw.contains(['"', '\\']) || raw.contains(char::is_whitespace) {
            return Err("bare value must not contain quotes, backslashes or spaces".into());
        }
        return Ok(raw.to_string());
    };

    let mut value = String::with_capacity(body.len());
    let mut chars = body.chars();
    loop {
        match chars.next() {
            None => return Err("unterminated quoted value".into()),
            Some('"') => break,
            Some('\\') => match chars.next() {
                Some(c @ ('"' | '\\')) => value.push(c),
                Some(c) => return Err(format!("unsupported escape \\{}", c)),
                None => return Err("unterminated quoted value".into()),
            },
            Some(c) => value.push(c),
        }
    }
    if !chars.as_str().trim().is_empty() {
        return Err("trailing text after quoted value".into());
    }
    Ok(value)
}

fn quote(value: &str) -> String {
    let bare = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._:/@+%,-".contains(c));
    if bare {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_quoted_and_comments() {
        let doc = Document::parse(
            "# header\n\nNAME=web\nCPU_MODEL=\"host,+vmx\"\nPATH_0=\"/srv/a \\\"b\\\" \\\\c\"\n",
        )
        .unwrap();
        assert_eq!(doc.get("NAME"), Some("web"));
        assert_eq!(doc.get("CPU_MODEL"), Some("host,+vmx"));
        assert_eq!(doc.get("PATH_0"), Some("/srv/a \"b\" \\c"));
        assert_eq!(doc.len(), 3);
    }

    #[test]
    fn test_render_quotes_only_when_needed() {
        let mut doc = Document::new();
        doc.set("NAME", "web").unwrap();
        doc.set("EMPTY", "").unwrap();
        doc.set("PATH", "/srv/my data").unwrap();
        assert_eq!(doc.render(), "NAME=web\nEMPTY=\"\"\nPATH=\"/srv/my data\"\n");
        assert_eq!(Document::parse(&doc.render()).unwrap(), doc);
    }

    #[test]
    fn test_rejects_shell_constructs_and_duplicates() {
        assert!(Document::parse("NAME=$(rm -rf /)").is_err());
        assert!(Document::parse("name=web").is_err());
        assert!(Document::parse("NAME=web\nNAME=db").is_err());
        assert!(Document::parse("NAME=\"unterminated").is_err());
        assert!(Document::parse("NAME=\"a\" extra").is_err());
        assert!(Document::parse("NAME=\"a\\nb\"").is_err());
        assert!(Document::parse("NAME=a\tb").is_err());
        assert!(Document::parse("just text").is_err());
    }

    #[test]
    fn test_set_rejects_control_characters() {
        let mut doc = Document::new();
        assert!(doc.set("PATH", "/tmp/a\nINJECT=1").is_err());
        assert!(doc.set("lower", "x").is_err());
        assert!(doc.is_empty());
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut doc = Document::parse("A=1\nB=2\n").unwrap();
        doc.set("A", "3").unwrap();
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(doc.take("A").as_deref(), Some("3"));
        assert_eq!(doc.get("A"), None);
    }
}
