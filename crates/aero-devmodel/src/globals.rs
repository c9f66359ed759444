use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default property value applied to every new device of type `driver`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalProperty {
    pub driver: String,
    pub property: String,
    pub value: String,
}

impl GlobalProperty {
    pub fn new(
        driver: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            property: property.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for GlobalProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.driver, self.property, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GlobalPropertyParseError {
    #[error("global `{0}` is missing `=value`")]
    MissingValue(String),
    #[error("global `{0}` is not of the form `driver.property`")]
    MissingProperty(String),
}

impl FromStr for GlobalProperty {
    type Err = GlobalPropertyParseError;

    /// Parses `driver.property=value`. The driver ends at the first `.`, so property names may
    /// themselves contain dots.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| GlobalPropertyParseError::MissingValue(s.to_string()))?;
        let (driver, property) = key
            .split_once('.')
            .filter(|(d, p)| !d.is_empty() && !p.is_empty())
            .ok_or_else(|| GlobalPropertyParseError::MissingProperty(key.to_string()))?;
        Ok(Self::new(driver, property, value))
    }
}

/// Machine configuration handed to [`crate::DeviceModel::with_config`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModelConfig {
    #[serde(default)]
    pub globals: Vec<GlobalProperty>,
}

impl DeviceModelConfig {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
