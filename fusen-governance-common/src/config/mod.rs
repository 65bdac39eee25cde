use std::fs;

use tracing::debug;

use self::toml::get_toml_by_context;
use self::yaml::get_yaml_by_context;

use crate::error::BoxError;

pub mod toml;
pub mod yaml;

pub fn get_config_by_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, BoxError> {
    let contents =
        fs::read_to_string(path).map_err(|e| format!("read path error : {:?} {}", path, e))?;
    debug!("load config from {}", path);
    match path.rsplit('.').next().unwrap_or_default() {
        "toml" => get_toml_by_context(&contents),
        "yaml" | "yml" => get_yaml_by_context(&contents),
        file_type => Err(format!("not support {:?}", file_type).into()),
    }
}
