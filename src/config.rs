use crate::reading::Quantity;
use std::env;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Required environment variable {0} not found")]
    MissingVariable(&'static str),

    #[error("Only http connections to openHAB are supported (no ssl), got {0}")]
    UnsupportedScheme(String),
}

/// Connection settings for the openHAB REST API
#[derive(Debug, Clone, PartialEq)]
pub struct OpenhabConfig {
    pub host: String,
    pub user: String,
    pub password: String,
}

impl OpenhabConfig {
    /// Reads `OH_HOST`, `OH_USER` and `OH_PASSWD`
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("OH_HOST").map_err(|_| ConfigError::MissingVariable("OH_HOST"))?;
        Self::new(
            &host,
            &env::var("OH_USER").unwrap_or_default(),
            &env::var("OH_PASSWD").unwrap_or_default(),
        )
    }

    pub fn new(host: &str, user: &str, password: &str) -> Result<Self, ConfigError> {
        if host.starts_with("https") {
            return Err(ConfigError::UnsupportedScheme(host.to_string()));
        }
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

/// openHAB item names the readings are posted to.
/// Empty names are not configured and get skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemNames {
    pub phase_1: String,
    pub phase_2: String,
    pub phase_3: String,
    pub overall: String,
    pub electricity_meter: String,
    pub overall_consumption_wh: String,
}

impl ItemNames {
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).unwrap_or_default();
        Self {
            phase_1: var("PHASE_1_CONSUMPTION_WATT_OH_ITEM"),
            phase_2: var("PHASE_2_CONSUMPTION_WATT_OH_ITEM"),
            phase_3: var("PHASE_3_CONSUMPTION_WATT_OH_ITEM"),
            overall: var("OVERALL_CONSUMPTION_WATT_OH_ITEM"),
            electricity_meter: var("ELECTRICITY_METER_KWH_OH_ITEM"),
            overall_consumption_wh: var("OVERALL_CONSUMPTION_WH_OH_ITEM"),
        }
    }

    /// Configured item for a quantity, if any
    pub fn item_for(&self, quantity: Quantity) -> Option<&str> {
        let name = match quantity {
            Quantity::Phase1 => &self.phase_1,
            Quantity::Phase2 => &self.phase_2,
            Quantity::Phase3 => &self.phase_3,
            Quantity::Overall => &self.overall,
            Quantity::ElectricityMeter => &self.electricity_meter,
        };
        non_empty(name)
    }

    pub fn overall_consumption_wh_item(&self) -> Option<&str> {
        non_empty(&self.overall_consumption_wh)
    }

    /// All configured items, readings first
    pub fn configured(&self) -> Vec<&str> {
        Quantity::ALL
            .iter()
            .filter_map(|q| self.item_for(*q))
            .chain(self.overall_consumption_wh_item())
            .collect()
    }
}

fn non_empty(name: &str) -> Option<&str> {
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
