use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Routing,
    RateLimiting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    #[default]
    Exact,
    Regex,
    NotEquals,
    In,
    NotIn,
    Range,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchString {
    #[serde(rename = "type")]
    pub match_type: MatchType,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Source {
    pub namespace: Option<String>,
    pub service: Option<String>,
    pub metadata: HashMap<String, MatchString>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Destination {
    pub namespace: Option<String>,
    pub service: Option<String>,
    pub metadata: HashMap<String, MatchString>,
    pub priority: u32,
    pub weight: u32,
    pub isolate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Route {
    pub sources: Vec<Source>,
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingRule {
    pub inbounds: Vec<Route>,
    pub outbounds: Vec<Route>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArgumentType {
    #[default]
    Custom,
    Method,
    Header,
    Query,
    CallerService,
    CallerIp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchArgument {
    #[serde(rename = "type")]
    pub argument_type: ArgumentType,
    pub key: String,
    pub value: MatchString,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitClause {
    pub id: String,
    pub method: Option<MatchString>,
    pub arguments: Vec<MatchArgument>,
    pub disable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitRule {
    pub rules: Vec<RateLimitClause>,
}

/// Tagged by a `type` field next to the rule body, e.g. `{type: rate_limit, rules: [..]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    Routing(RoutingRule),
    RateLimit(RateLimitRule),
}

/// A governance rule at one revision. A new revision replaces the rule wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRef {
    pub revision: String,
    pub rule: Rule,
}

impl RuleRef {
    pub fn new(revision: impl Into<String>, rule: Rule) -> Self {
        Self {
            revision: revision.into(),
            rule,
        }
    }

    pub fn rule_type(&self) -> RuleType {
        match self.rule {
            Rule::Routing(_) => RuleType::Routing,
            Rule::RateLimit(_) => RuleType::RateLimiting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_rate_limit_rule() {
        let rule: RuleRef = serde_yaml::from_str(
            r#"
revision: r1
rule:
  type: rate_limit
  rules:
    - id: limit-user
      arguments:
        - type: HEADER
          key: uid
          value:
            type: EXACT
            value: "1001"
        - type: QUERY
          key: param.name
"#,
        )
        .unwrap();
        assert_eq!(rule.rule_type(), RuleType::RateLimiting);
        let Rule::RateLimit(rate_limit) = &rule.rule else {
            panic!("not a rate limit rule");
        };
        assert_eq!(rate_limit.rules[0].arguments.len(), 2);
        assert_eq!(rate_limit.rules[0].arguments[1].argument_type, ArgumentType::Query);
        assert_eq!(rate_limit.rules[0].arguments[1].value, MatchString::default());
    }

    #[test]
    fn routing_rule_from_json() {
        let rule: RuleRef = serde_json::from_str(
            r#"{"revision":"r2","rule":{"type":"routing","outbounds":[{"sources":[{"metadata":{"$header.env":{"value":"gray"}}}]}]}}"#,
        )
        .unwrap();
        assert_eq!(rule.rule_type(), RuleType::Routing);
        let Rule::Routing(routing) = &rule.rule else {
            panic!("not a routing rule");
        };
        assert_eq!(routing.outbounds[0].sources[0].metadata["$header.env"].value, "gray");
        assert!(routing.inbounds.is_empty());

        let text = serde_json::to_string(&rule).unwrap();
        assert!(text.contains(r#""type":"routing""#));
    }
}
