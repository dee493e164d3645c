//! Request-level configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Environment variable listing canon assets, comma separated.
pub const CANON_ASSETS_VAR: &str = "EPHEMERA_CANON_ASSETS";

/// Configuration shared by every cache of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerceptionConfig {
    /// Assets every character sees, in overlay order.
    #[serde(default)]
    pub canon_assets: Vec<String>,
}

impl PerceptionConfig {
    /// Create an empty config (no canon assets).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one canon asset.
    pub fn with_canon_asset(mut self, asset: impl Into<String>) -> Self {
        self.canon_assets.push(asset.into());
        self
    }

    /// Replace the canon asset list.
    pub fn with_canon_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.canon_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Read the canon asset list from `EPHEMERA_CANON_ASSETS`.
    ///
    /// An unset variable means no canon assets.
    pub fn from_env() -> Result<Self> {
        match env::var(CANON_ASSETS_VAR) {
            Ok(value) => Ok(Self::new().with_canon_assets(parse_asset_list(&value))),
            Err(env::VarError::NotPresent) => Ok(Self::new()),
            Err(err) => Err(Error::Config(format!("{CANON_ASSETS_VAR}: {err}"))),
        }
    }

    /// Canon assets followed by `personal`, each asset once, first occurrence
    /// kept.
    pub fn accessible_assets(&self, personal: &[String]) -> Vec<String> {
        let mut assets: Vec<String> = Vec::with_capacity(self.canon_assets.len() + personal.len());
        for asset in self.canon_assets.iter().chain(personal) {
            if !assets.contains(asset) {
                assets.push(asset.clone());
            }
        }
        assets
    }
}

fn parse_asset_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|asset| !asset.is_empty())
        .map(str::to_string)
        .collect()
}
