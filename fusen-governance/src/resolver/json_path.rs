use serde_json::Value as Json;
use serde_json_path::JsonPath;
use tracing::debug;

use super::{split_param, QueryParser};
use crate::value::Value;

const LENGTH: &str = ".length()";

/// Serializes the selected argument to a JSON tree and evaluates the rest of
/// the query as a JSONPath expression. A trailing `.length()` counts the
/// selected array.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPathQueryParser;

impl QueryParser for JsonPathQueryParser {
    fn name(&self) -> &'static str {
        "json_path"
    }

    fn parse(&self, query: &str, arguments: &[Value]) -> Option<String> {
        let (index, path) = split_param(query)?;
        let (path, length) = match path.trim().strip_suffix(LENGTH) {
            Some(path) => (path, true),
            None => (path.trim(), false),
        };
        let compiled = match JsonPath::parse(&absolute(path)) {
            Ok(compiled) => compiled,
            Err(error) => {
                debug!("invalid json path {} in {}: {}", path, query, error);
                return None;
            }
        };
        let json = arguments.get(index)?.to_json();
        let nodes = compiled.query(&json).all();
        if length {
            return match nodes.as_slice() {
                [Json::Array(array)] => Some(array.len().to_string()),
                [Json::Object(object)] => Some(object.len().to_string()),
                [] => None,
                nodes => Some(nodes.len().to_string()),
            };
        }
        match nodes.as_slice() {
            [] | [Json::Null] => None,
            [Json::String(s)] => Some(s.clone()),
            [other] => Some(other.to_string()),
            nodes => Some(Json::Array(nodes.iter().map(|&e| e.clone()).collect()).to_string()),
        }
    }
}

/// `book[0]` and `[0]` are read relative to the root.
fn absolute(path: &str) -> String {
    if path.starts_with('$') {
        path.to_owned()
    } else if path.is_empty() || path.starts_with('[') {
        format!("${}", path)
    } else {
        format!("$.{}", path)
    }
}
