use std::collections::HashMap;

use percent_encoding::percent_decode_str;

use crate::error::GovernanceError;

/// `scheme://host:port?k=v&k2=v2` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigUrl {
    pub scheme: String,
    pub address: String,
    pub params: HashMap<String, String>,
}

pub fn decode_url(url: &str) -> Result<String, GovernanceError> {
    Ok(percent_decode_str(url)
        .decode_utf8()
        .map_err(|e| GovernanceError::Config(e.to_string()))?
        .to_string())
}

pub fn parse_query(query: &str) -> Result<HashMap<String, String>, GovernanceError> {
    let mut map = HashMap::new();
    for item in query.split('&').filter(|e| !e.is_empty()) {
        let (key, value) = item.split_once('=').unwrap_or((item, ""));
        map.insert(decode_url(key)?, decode_url(value)?);
    }
    Ok(map)
}

pub fn parse_url(url: &str) -> Result<ConfigUrl, GovernanceError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| GovernanceError::Config(format!("config url err : {:?}", url)))?;
    let (address, query) = rest.split_once('?').unwrap_or((rest, ""));
    if scheme.is_empty() || address.is_empty() {
        return Err(GovernanceError::Config(format!("config url err : {:?}", url)));
    }
    Ok(ConfigUrl {
        scheme: scheme.to_lowercase(),
        address: address.trim_end_matches('/').to_owned(),
        params: parse_query(query)?,
    })
}

#[cfg(test)]
mod tests {
    use super::parse_url;

    #[test]
    fn split_url() {
        let url = parse_url("governance://127.0.0.1:8091?namespace=dev&token=a%2Fb").unwrap();
        assert_eq!(url.scheme, "governance");
        assert_eq!(url.address, "127.0.0.1:8091");
        assert_eq!(url.params.get("namespace").unwrap(), "dev");
        assert_eq!(url.params.get("token").unwrap(), "a/b");

        let url = parse_url("governance://127.0.0.1:8091").unwrap();
        assert!(url.params.is_empty());
        assert!(parse_url("127.0.0.1:8091").is_err());
    }
}
