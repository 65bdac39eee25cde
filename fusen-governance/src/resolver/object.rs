use std::borrow::Cow;

use tracing::debug;

use super::{parse_segment, split_param, QueryParser};
use crate::value::Value;

/// Walks the [`Value`] graph directly: maps by key, records by field name,
/// sequences by index.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjectQueryParser;

impl QueryParser for ObjectQueryParser {
    fn name(&self) -> &'static str {
        "object"
    }

    fn parse(&self, query: &str, arguments: &[Value]) -> Option<String> {
        let Some((index, path)) = split_param(query) else {
            debug!("invalid object expression for {}", query);
            return None;
        };
        let mut target = Cow::Borrowed(arguments.get(index)?);
        for token in path.split('.').filter(|e| !e.is_empty()) {
            target = resolve_token(target, token)?;
        }
        target.to_display()
    }
}

fn resolve_token<'a>(value: Cow<'a, Value>, token: &str) -> Option<Cow<'a, Value>> {
    let segment = parse_segment(token)?;
    let mut target = if segment.field.is_empty() {
        value
    } else {
        match value {
            Cow::Borrowed(value) => Cow::Borrowed(value.get_key(segment.field)?),
            Cow::Owned(value) => Cow::Owned(value.get_key(segment.field)?.clone()),
        }
    };
    for index in segment.indexes {
        target = match target {
            Cow::Borrowed(value) => value.get_index(index)?,
            Cow::Owned(value) => Cow::Owned(value.get_index(index)?.into_owned()),
        };
    }
    Some(target)
}
