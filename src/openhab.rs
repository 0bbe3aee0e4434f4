use crate::config::{ItemNames, OpenhabConfig};
use crate::reading::{ExtendedReading, Quantity, Reading};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Thin client for the parts of the openHAB REST API this bridge needs
pub struct OpenhabConnection {
    config: OpenhabConfig,
    client: reqwest::Client,
}

impl OpenhabConnection {
    pub fn new(config: OpenhabConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Sends a new state to an item
    pub async fn post_value(&self, item: &str, value: f64) -> Result<(), anyhow::Error> {
        let response = self
            .client
            .post(format!("{}/rest/items/{}", self.config.host, item))
            .basic_auth(&self.config.user, Some(&self.config.password))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(value.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to post value to openHAB item {item}. Return code: {}. text: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Posts every present measurement that has an item configured.
    /// Failures are logged and don't stop the remaining posts.
    /// Returns the number of successful posts.
    pub async fn post_reading(&self, reading: &Reading, items: &ItemNames) -> usize {
        let mut posted = 0;
        for (quantity, value) in reading.iter() {
            let (Some(item), Some(value)) = (items.item_for(quantity), value) else {
                continue;
            };
            posted += self.post_logged(item, value).await;
        }
        posted
    }

    pub async fn post_extended(&self, extended: &ExtendedReading, items: &ItemNames) -> usize {
        match (
            items.overall_consumption_wh_item(),
            extended.overall_consumption_wh,
        ) {
            (Some(item), Some(value)) => self.post_logged(item, value).await,
            _ => 0,
        }
    }

    async fn post_logged(&self, item: &str, value: f64) -> usize {
        match self.post_value(item, value).await {
            Ok(()) => 1,
            Err(e) => {
                warn!("{e}");
                0
            }
        }
    }

    /// Numeric states persisted for an item within the last `window`
    pub async fn get_persisted_values(
        &self,
        item: &str,
        window: Duration,
    ) -> Result<Vec<f64>, anyhow::Error> {
        let end = Utc::now();
        let start = end - chrono::Duration::from_std(window)?;
        let response = self
            .client
            .get(format!(
                "{}/rest/persistence/items/{}?starttime={}&endtime={}",
                self.config.host,
                item,
                format_timestamp(start),
                format_timestamp(end)
            ))
            .basic_auth(&self.config.user, Some(&self.config.password))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to get persistence data of openHAB item {item}. Return code: {}",
                response.status()
            );
        }
        let persisted: PersistenceResponse = response.json().await?;
        Ok(persisted.numeric_states())
    }

    /// Median of the persisted values of each configured quantity.
    /// Quantities without data stay absent, which disables their outlier check.
    pub async fn get_median_reference(&self, items: &ItemNames, window: Duration) -> Reading {
        let mut reference = Reading::empty();
        for quantity in Quantity::ALL {
            let Some(item) = items.item_for(quantity) else {
                continue;
            };
            match self.get_persisted_values(item, window).await {
                Ok(values) => reference.set(quantity, median(values)),
                Err(e) => warn!("No reference value for {quantity}: {e}"),
            }
        }
        debug!("Reference values: {reference}");
        reference
    }

    /// True if every configured item got at least one update within `window`
    pub async fn check_if_updated(&self, items: &ItemNames, window: Duration) -> bool {
        for item in items.configured() {
            match self.get_persisted_values(item, window).await {
                Ok(values) if !values.is_empty() => {}
                Ok(_) => {
                    warn!("openHAB item {item} was not updated within {window:?}");
                    return false;
                }
                Err(e) => {
                    warn!("{e}");
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceResponse {
    pub name: String,
    #[serde(default)]
    pub data: Vec<PersistenceDatapoint>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceDatapoint {
    pub time: i64,
    pub state: String,
}

impl PersistenceResponse {
    /// States that parse as numbers, units like "163 W" are stripped
    pub fn numeric_states(&self) -> Vec<f64> {
        self.data
            .iter()
            .filter_map(|point| point.state.split_whitespace().next()?.parse().ok())
            .collect()
    }
}

fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Median of the values, the mean of the two middle values for even counts
pub fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
