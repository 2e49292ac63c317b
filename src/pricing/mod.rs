mod litellm;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::{debug, info};

use crate::cost::{ModelPricing, PricingMap};

const CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// USD per million tokens: input, output, cache read, cache write.
const BUILTIN_RATES: &[(&str, f64, f64, f64, f64)] = &[
    ("claude-opus-4-6", 5.00, 25.00, 0.50, 6.25),
    ("claude-sonnet-4-6", 3.00, 15.00, 0.30, 3.75),
    ("kimi-k2.5", 0.60, 3.00, 0.15, 0.60),
    ("kimi-k2-thinking", 0.60, 3.00, 0.15, 0.60),
    ("gemini-3-flash-preview", 0.10, 0.40, 0.025, 0.10),
    ("gemini-3-pro-preview", 1.25, 5.00, 0.3125, 1.25),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PricingSource {
    /// Rates compiled into the binary
    #[default]
    Builtin,
    /// LiteLLM's community price list, cached for a day
    Litellm,
}

/// A per-model rate override from the config file, per million tokens.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelRate {
    pub input_per_m: f64,
    pub output_per_m: f64,
    #[serde(default)]
    pub cache_read_per_m: f64,
    #[serde(default)]
    pub cache_write_per_m: f64,
}

impl From<&ModelRate> for ModelPricing {
    fn from(rate: &ModelRate) -> Self {
        ModelPricing::per_million(
            rate.input_per_m,
            rate.output_per_m,
            rate.cache_read_per_m,
            rate.cache_write_per_m,
        )
    }
}

pub struct CachedPricing {
    map: HashMap<String, ModelPricing>,
}

impl PricingMap for CachedPricing {
    fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.map
            .get(model)
            .or_else(|| self.map.get(strip_date_suffix(model)))
    }
}

impl CachedPricing {
    pub fn builtin() -> Self {
        let map = BUILTIN_RATES
            .iter()
            .map(|(model, input, output, read, write)| {
                (
                    model.to_string(),
                    ModelPricing::per_million(*input, *output, *read, *write),
                )
            })
            .collect();
        Self { map }
    }

    /// Config overrides replace whatever the source provided.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, ModelRate>) -> Self {
        for (model, rate) in overrides {
            self.map.insert(model.clone(), rate.into());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// "claude-sonnet-4-6-20260115" → "claude-sonnet-4-6"
fn strip_date_suffix(model: &str) -> &str {
    if model.len() > 9
        && model.as_bytes()[model.len() - 9] == b'-'
        && model[model.len() - 8..].chars().all(|c| c.is_ascii_digit())
    {
        &model[..model.len() - 9]
    } else {
        model
    }
}

fn cache_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "clawmeter").map(|d| d.cache_dir().join("pricing.json"))
}

fn cache_is_fresh(path: &PathBuf) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|d| d.as_secs() < CACHE_TTL_SECS)
        .unwrap_or(false)
}

fn load_litellm(offline: bool) -> Result<CachedPricing> {
    let cache = cache_path();

    if let Some(ref path) = cache {
        if offline || cache_is_fresh(path) {
            if let Ok(data) = fs::read_to_string(path) {
                if let Ok(litellm) = litellm::parse_litellm_json(&data) {
                    debug!(path = %path.display(), "using cached litellm pricing");
                    return Ok(merge_over_builtin(litellm));
                }
            }
            if offline {
                bail!("--offline: no valid pricing cache found");
            }
        }
    }

    let data = litellm::fetch_litellm_json().context("Failed to fetch pricing data")?;
    let litellm = litellm::parse_litellm_json(&data).context("Failed to parse pricing data")?;
    info!(models = litellm.len(), "fetched litellm pricing");

    if let Some(ref path) = cache {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(path, &data);
    }

    Ok(merge_over_builtin(litellm))
}

fn merge_over_builtin(litellm: HashMap<String, ModelPricing>) -> CachedPricing {
    let mut pricing = CachedPricing::builtin();
    pricing.map.extend(litellm);
    pricing
}

pub fn load_pricing(
    source: PricingSource,
    offline: bool,
    overrides: &BTreeMap<String, ModelRate>,
) -> Result<CachedPricing> {
    let pricing = match source {
        PricingSource::Builtin => CachedPricing::builtin(),
        PricingSource::Litellm => load_litellm(offline)?,
    };
    Ok(pricing.with_overrides(overrides))
}
