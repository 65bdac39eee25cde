use crate::error::BoxError;
use serde_yaml::Value;

pub fn get_yaml_by_context<T: serde::de::DeserializeOwned>(
    yaml_context: &str,
) -> Result<T, BoxError> {
    let parsed_yaml: Value = serde_yaml::from_str(yaml_context)?;
    Ok(T::deserialize(parsed_yaml).map_err(|e| format!("yaml to struct error {:?}", e))?)
}
