use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use tracing::debug;

use super::rule::{ArgumentType, MatchArgument};

pub const LABEL_KEY_METHOD: &str = "$method";
pub const LABEL_KEY_PATH: &str = "$path";
pub const LABEL_KEY_CALLER_IP: &str = "$caller_ip";
pub const LABEL_KEY_HEADER: &str = "$header.";
pub const LABEL_KEY_QUERY: &str = "$query.";
pub const LABEL_KEY_CALLER_SERVICE: &str = "$caller_service.";

/// Something a rule needs to see from the live call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    Method,
    Path,
    CallerIp,
    Header(String),
    Query(String),
    CallerService(String),
    Custom(String),
}

impl Label {
    /// Parses a routing metadata key. Blank keys and prefixes without a name
    /// are not labels. Unrecognised `$` keys are kept as custom labels.
    pub fn parse(key: &str) -> Option<Label> {
        let key = key.trim();
        let label = match key {
            "" => return None,
            LABEL_KEY_METHOD => Label::Method,
            LABEL_KEY_PATH => Label::Path,
            LABEL_KEY_CALLER_IP => Label::CallerIp,
            _ => {
                if let Some(name) = key.strip_prefix(LABEL_KEY_HEADER) {
                    Label::Header(non_blank(name)?)
                } else if let Some(name) = key.strip_prefix(LABEL_KEY_QUERY) {
                    Label::Query(non_blank(name)?)
                } else if let Some(name) = key.strip_prefix(LABEL_KEY_CALLER_SERVICE) {
                    Label::CallerService(non_blank(name)?)
                } else {
                    if key.starts_with('$') {
                        debug!("unknown label key {}, read it from attachments", key);
                    }
                    Label::Custom(key.to_owned())
                }
            }
        };
        Some(label)
    }

    /// Only kind and key of a rate limit argument matter; the value matcher is
    /// evaluated server side.
    pub fn from_match_argument(argument: &MatchArgument) -> Option<Label> {
        let key = argument.key.trim();
        let label = match argument.argument_type {
            ArgumentType::Method => Label::Method,
            ArgumentType::CallerIp => Label::CallerIp,
            ArgumentType::Header => Label::Header(non_blank(key)?),
            ArgumentType::Query => Label::Query(non_blank(key)?),
            ArgumentType::CallerService => Label::CallerService(key.to_owned()),
            ArgumentType::Custom => Label::Custom(non_blank(key)?),
        };
        Some(label)
    }
}

fn non_blank(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_owned())
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Label::Method => f.write_str(LABEL_KEY_METHOD),
            Label::Path => f.write_str(LABEL_KEY_PATH),
            Label::CallerIp => f.write_str(LABEL_KEY_CALLER_IP),
            Label::Header(name) => write!(f, "{}{}", LABEL_KEY_HEADER, name),
            Label::Query(name) => write!(f, "{}{}", LABEL_KEY_QUERY, name),
            Label::CallerService(name) => write!(f, "{}{}", LABEL_KEY_CALLER_SERVICE, name),
            Label::Custom(name) => f.write_str(name),
        }
    }
}

pub type LabelSet = Arc<BTreeSet<Label>>;

/// A label resolved against a live call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Argument {
    pub label: Label,
    pub value: String,
}

impl Argument {
    pub fn new(label: Label, value: impl Into<String>) -> Self {
        Self {
            label,
            value: value.into(),
        }
    }
}

impl Display for Argument {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.label, self.value)
    }
}
