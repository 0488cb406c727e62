//! Schema paths: `/a/b[k=v]/c` traversal expressions.
//!
//! A segment is a name plus an optional query. Query keys select into
//! tables (by key fields) or arrays (by `position`).

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path must start with `/`")]
    MissingLeadingSlash,

    #[error("empty segment name at byte {at}")]
    EmptySegment { at: usize },

    #[error("unterminated query at byte {at}")]
    UnterminatedQuery { at: usize },

    #[error("query entry missing `=` at byte {at}")]
    MissingEquals { at: usize },

    #[error("empty query key at byte {at}")]
    EmptyQueryKey { at: usize },

    #[error("duplicate query key `{key}`")]
    DuplicateQueryKey { key: String },
}

/// One path segment: a child name and an optional selection query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub query: Option<BTreeMap<String, String>>,
}

impl Segment {
    pub fn named(name: &str) -> Self {
        Segment {
            name: normalize_ident(name),
            query: None,
        }
    }
}

/// A parsed schema path. Empty segments means the root (`/`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path {
    pub segments: Vec<Segment>,
}

impl Path {
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Split into everything-but-last and the last segment.
    pub fn split_last(&self) -> Option<(&[Segment], &Segment)> {
        self.segments.split_last().map(|(last, head)| (head, last))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment.name)?;
            if let Some(query) = &segment.query {
                for (k, v) in query {
                    write!(f, "[{k}={v}]")?;
                }
            }
        }
        Ok(())
    }
}

/// Map external identifiers onto field identifiers (`-` becomes `_`).
pub fn normalize_ident(ident: &str) -> String {
    ident.replace('-', "_")
}

/// Parse a path from its text form.
pub fn parse(text: &str) -> Result<Path, PathError> {
    let text = text.trim();
    if text == "/" || text.is_empty() {
        return Ok(Path::default());
    }
    let bytes = text.as_bytes();
    if bytes[0] != b'/' {
        return Err(PathError::MissingLeadingSlash);
    }

    let mut segments = Vec::new();
    let mut pos = 1;
    while pos < bytes.len() {
        let name_start = pos;
        while pos < bytes.len() && bytes[pos] != b'/' && bytes[pos] != b'[' {
            pos += 1;
        }
        if pos == name_start {
            return Err(PathError::EmptySegment { at: name_start });
        }
        let name = normalize_ident(&text[name_start..pos]);

        let mut query: Option<BTreeMap<String, String>> = None;
        while pos < bytes.len() && bytes[pos] == b'[' {
            let open = pos;
            pos += 1;
            let entry_start = pos;
            while pos < bytes.len() && bytes[pos] != b']' {
                pos += 1;
            }
            if pos == bytes.len() {
                return Err(PathError::UnterminatedQuery { at: open });
            }
            let entry = &text[entry_start..pos];
            pos += 1;

            let eq = entry
                .find('=')
                .ok_or(PathError::MissingEquals { at: entry_start })?;
            let key = normalize_ident(entry[..eq].trim());
            let value = entry[eq + 1..].trim().to_string();
            if key.is_empty() {
                return Err(PathError::EmptyQueryKey { at: entry_start });
            }
            let map = query.get_or_insert_with(BTreeMap::new);
            if map.insert(key.clone(), value).is_some() {
                return Err(PathError::DuplicateQueryKey { key });
            }
        }

        segments.push(Segment { name, query });

        if pos < bytes.len() {
            debug_assert_eq!(bytes[pos], b'/');
            pos += 1;
            if pos == bytes.len() {
                return Err(PathError::EmptySegment { at: pos });
            }
        }
    }

    Ok(Path { segments })
}

/// Canonical text form: parse then print.
pub fn normalize(text: &str) -> Result<String, PathError> {
    Ok(parse(text)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_forms() {
        assert!(parse("/").unwrap().is_root());
        assert!(parse("").unwrap().is_root());
        assert_eq!(parse("/").unwrap().to_string(), "/");
    }

    #[test]
    fn plain_segments() {
        let path = parse("/routes/static").unwrap();
        assert_eq!(path.segments.len(), 2);
        assert_eq!(path.segments[0].name, "routes");
        assert_eq!(path.segments[1].name, "static");
        assert!(path.segments[1].query.is_none());
    }

    #[test]
    fn query_segments() {
        let path = parse("/nexthops[addr=10.0.0.1][port=443]/weight").unwrap();
        let query = path.segments[0].query.as_ref().unwrap();
        assert_eq!(query.get("addr").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(query.get("port").map(String::as_str), Some("443"));
        assert_eq!(path.segments[1].name, "weight");
    }

    #[test]
    fn idents_are_normalized() {
        let path = parse("/next-hops[peer-id=3]").unwrap();
        assert_eq!(path.segments[0].name, "next_hops");
        assert!(path.segments[0]
            .query
            .as_ref()
            .unwrap()
            .contains_key("peer_id"));
    }

    #[test]
    fn normalize_roundtrips() {
        assert_eq!(
            normalize("/next-hops[addr=1]/weight").unwrap(),
            "/next_hops[addr=1]/weight"
        );
    }

    #[test]
    fn parse_errors() {
        assert_eq!(parse("x/y").unwrap_err(), PathError::MissingLeadingSlash);
        assert!(matches!(
            parse("//x").unwrap_err(),
            PathError::EmptySegment { .. }
        ));
        assert!(matches!(
            parse("/t[").unwrap_err(),
            PathError::UnterminatedQuery { .. }
        ));
        assert!(matches!(
            parse("/t[k]").unwrap_err(),
            PathError::MissingEquals { .. }
        ));
        assert!(matches!(
            parse("/t[k=1][k=2]").unwrap_err(),
            PathError::DuplicateQueryKey { .. }
        ));
        assert!(matches!(
            parse("/t/").unwrap_err(),
            PathError::EmptySegment { .. }
        ));
    }
}
