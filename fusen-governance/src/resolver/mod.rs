use std::sync::Arc;

use tracing::warn;

use crate::value::Value;

pub mod json_path;
pub mod object;

pub use json_path::JsonPathQueryParser;
pub use object::ObjectQueryParser;

const PREFIX_PARAM: &str = "param";

/// Extracts one value from the positional arguments of a call.
///
/// Never fails: anything that cannot be resolved is `None`, and the caller
/// leaves that label out of the governance request.
pub trait QueryParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, query: &str, arguments: &[Value]) -> Option<String>;
}

pub fn load(name: &str) -> Arc<dyn QueryParser> {
    match name {
        "json_path" | "JsonPath" => Arc::new(JsonPathQueryParser),
        "object" | "" => Arc::new(ObjectQueryParser),
        other => {
            warn!("unknown query parser {}, fall back to object", other);
            Arc::new(ObjectQueryParser)
        }
    }
}

/// Splits `param`, `paramN` or `param[N]` off a query and returns the
/// argument index with the remaining path.
pub(crate) fn split_param(query: &str) -> Option<(usize, &str)> {
    let rest = query.trim().strip_prefix(PREFIX_PARAM)?;
    let (index, rest) = if let Some(rest) = rest.strip_prefix('[') {
        let end = rest.find(']')?;
        (rest[..end].trim().parse().ok()?, &rest[end + 1..])
    } else {
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let index = if end == 0 { 0 } else { rest[..end].parse().ok()? };
        (index, &rest[end..])
    };
    if rest.is_empty() || rest.starts_with('[') {
        Some((index, rest))
    } else {
        rest.strip_prefix('.').map(|rest| (index, rest))
    }
}

/// One dotted path token: an optional field name followed by `[i]` suffixes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Segment<'a> {
    pub field: &'a str,
    pub indexes: Vec<usize>,
}

pub(crate) fn parse_segment(token: &str) -> Option<Segment<'_>> {
    let (field, mut rest) = match token.find('[') {
        Some(start) => (&token[..start], &token[start..]),
        None => (token, ""),
    };
    let mut indexes = vec![];
    while let Some(inner) = rest.strip_prefix('[') {
        let end = inner.find(']')?;
        indexes.push(inner[..end].trim().parse().ok()?);
        rest = &inner[end + 1..];
    }
    if !rest.is_empty() || (field.is_empty() && indexes.is_empty()) {
        return None;
    }
    Some(Segment { field, indexes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split() {
        assert_eq!(split_param("param"), Some((0, "")));
        assert_eq!(split_param("param.$.book[0]"), Some((0, "$.book[0]")));
        assert_eq!(split_param("param[1].$.color"), Some((1, "$.color")));
        assert_eq!(split_param("param2.name"), Some((2, "name")));
        assert_eq!(split_param("param[0][1]"), Some((0, "[1]")));
        assert_eq!(split_param("param[5]"), Some((5, "")));
        assert_eq!(split_param("paramx"), None);
        assert_eq!(split_param("param[x]"), None);
        assert_eq!(split_param("arg0"), None);
    }

    #[test]
    fn segment() {
        assert_eq!(
            parse_segment("book[0][2]"),
            Some(Segment {
                field: "book",
                indexes: vec![0, 2]
            })
        );
        assert_eq!(
            parse_segment("name"),
            Some(Segment {
                field: "name",
                indexes: vec![]
            })
        );
        assert_eq!(parse_segment("book[a]"), None);
        assert_eq!(parse_segment("book[0"), None);
        assert_eq!(parse_segment(""), None);
    }

    #[test]
    fn load_by_name() {
        assert_eq!(load("json_path").name(), "json_path");
        assert_eq!(load("object").name(), "object");
        assert_eq!(load("reflection").name(), "object");
    }
}
