//! Minimal reader and writer for the INI dialect used by `.manager` files.
//!
//! Groups are `[name]` lines, entries are `key = value`, and `#` starts a
//! comment line. Values use the usual backslash escapes (`\s` for an edge
//! space, `\n`, `\t`, `\r`, `\\`); list items may additionally escape the
//! `,` and `;` separators.

use crate::error::{ManifestError, ManifestResult};

/// One `[group]` with its entries in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Group {
    pub(crate) name: String,
    pub(crate) entries: Vec<(String, String)>,
}

impl Group {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Raw (still escaped) value of `key`; the last occurrence wins.
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }
}

/// A parsed file: groups in first-appearance order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct KeyFile {
    pub(crate) groups: Vec<Group>,
}

impl KeyFile {
    pub(crate) fn parse(text: &str) -> ManifestResult<Self> {
        let mut file = KeyFile::default();
        let mut current: Option<usize> = None;

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| ManifestError::syntax(line_no, "unterminated group header"))?;
                if name.is_empty() {
                    return Err(ManifestError::syntax(line_no, "empty group name"));
                }
                current = Some(match file.groups.iter().position(|g| g.name == name) {
                    Some(existing) => existing,
                    None => {
                        file.groups.push(Group::new(name));
                        file.groups.len() - 1
                    }
                });
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ManifestError::syntax(line_no, "expected key = value"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ManifestError::syntax(line_no, "empty key"));
            }
            let group = current
                .and_then(|i| file.groups.get_mut(i))
                .ok_or_else(|| ManifestError::syntax(line_no, "entry outside of any group"))?;
            group.push(key, value.trim());
        }

        Ok(file)
    }

    pub(crate) fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Renders groups separated by blank lines.
    pub(crate) fn write(&self) -> String {
        let mut out = String::new();
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push('[');
            out.push_str(&group.name);
            out.push_str("]\n");
            for (key, value) in &group.entries {
                out.push_str(key);
                if value.is_empty() {
                    out.push_str(" =\n");
                } else {
                    out.push_str(" = ");
                    out.push_str(value);
                    out.push('\n');
                }
            }
        }
        out
    }
}

fn escape_with(s: &str, separators: bool) -> String {
    let mut out = String::with_capacity(s.len());
    let last = s.chars().count().saturating_sub(1);
    for (i, c) in s.chars().enumerate() {
        match c {
            ' ' if i == 0 || i == last => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            ',' | ';' if separators => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

/// Escapes a string value.
pub(crate) fn escape(s: &str) -> String {
    escape_with(s, false)
}

/// Decodes a string value. `None` on an unknown or truncated escape.
pub(crate) fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            's' => out.push(' '),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            ',' => out.push(','),
            ';' => out.push(';'),
            _ => return None,
        }
    }
    Some(out)
}

/// Splits a list on unescaped `,` or `;`, tolerating a trailing separator.
pub(crate) fn split_list(raw: &str) -> Option<Vec<String>> {
    let mut items = Vec::new();
    let mut piece = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                piece.push('\\');
                piece.push(chars.next()?);
            }
            ',' | ';' => items.push(std::mem::take(&mut piece)),
            other => piece.push(other),
        }
    }
    if !piece.trim().is_empty() {
        items.push(piece);
    }
    items.iter().map(|item| unescape(item.trim())).collect()
}

/// Joins list items with `,`, escaping separators inside items.
pub(crate) fn join_list<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(|item| escape_with(item.as_ref(), true))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_groups_and_entries() {
        let text = "# comment\n[ConnectionManager]\nInterfaces=\n\n[Protocol x]\nparam-a = s required\n param-b=q  \n";
        let file = KeyFile::parse(text).unwrap();
        assert_eq!(file.groups.len(), 2);
        let cm = file.group("ConnectionManager").unwrap();
        assert_eq!(cm.get("Interfaces"), Some(""));
        let proto = file.group("Protocol x").unwrap();
        assert_eq!(proto.get("param-a"), Some("s required"));
        assert_eq!(proto.get("param-b"), Some("q"));
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = KeyFile::parse("[ok]\nno equals sign\n").unwrap_err();
        assert!(matches!(err, ManifestError::Syntax { line: 2, .. }));
        assert!(matches!(
            KeyFile::parse("key = value\n").unwrap_err(),
            ManifestError::Syntax { line: 1, .. }
        ));
        assert!(KeyFile::parse("[broken\n").is_err());
    }

    #[test]
    fn repeated_groups_merge_and_last_key_wins() {
        let file = KeyFile::parse("[g]\na = 1\n[h]\n[g]\na = 2\n").unwrap();
        assert_eq!(file.groups.len(), 2);
        assert_eq!(file.group("g").unwrap().get("a"), Some("2"));
    }

    #[test]
    fn lists_accept_both_separators() {
        assert_eq!(split_list("a;b;").unwrap(), vec!["a", "b"]);
        assert_eq!(split_list("a, b,c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split_list("").unwrap(), Vec::<String>::new());
        assert_eq!(split_list("x\\,y,z").unwrap(), vec!["x,y", "z"]);
        assert_eq!(split_list("bad\\q"), None);
    }

    proptest! {
        #[test]
        fn string_escape_round_trips(s in "[ -~\t\n]*") {
            let escaped = escape(&s);
            prop_assert!(!escaped.contains('\n'));
            prop_assert_eq!(unescape(escaped.trim()), Some(s));
        }

        #[test]
        fn list_round_trips(items in proptest::collection::vec("[ -~]*[!-~]", 0..5)) {
            prop_assert_eq!(split_list(&join_list(&items)), Some(items));
        }
    }
}
