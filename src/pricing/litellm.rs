use std::collections::HashMap;

use anyhow::Result;

use crate::cost::ModelPricing;

const LITELLM_URL: &str =
    "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json";

pub fn fetch_litellm_json() -> Result<String> {
    let body = ureq::get(LITELLM_URL).call()?.body_mut().read_to_string()?;
    Ok(body)
}

pub fn parse_litellm_json(data: &str) -> Result<HashMap<String, ModelPricing>> {
    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(data)?;
    let mut map = HashMap::new();

    for (key, val) in &raw {
        let Some(input) = val.get("input_cost_per_token").and_then(|v| v.as_f64()) else {
            continue;
        };
        let Some(output) = val.get("output_cost_per_token").and_then(|v| v.as_f64()) else {
            continue;
        };

        let pricing = ModelPricing {
            input_cost_per_token: input,
            output_cost_per_token: output,
            cache_read_input_token_cost: val
                .get("cache_read_input_token_cost")
                .and_then(|v| v.as_f64()),
            cache_creation_input_token_cost: val
                .get("cache_creation_input_token_cost")
                .and_then(|v| v.as_f64()),
        };

        // Routed keys ("moonshot/kimi-k2.5") must not shadow a direct entry.
        let bare = bare_model_name(key);
        if bare != key {
            map.entry(bare.to_string()).or_insert_with(|| pricing.clone());
        }
        map.insert(key.clone(), pricing);
    }

    Ok(map)
}

/// Model names in session logs carry no routing prefix, so
/// "gemini/gemini-3-pro-preview" and "vertex_ai/gemini-3-pro-preview"
/// both become "gemini-3-pro-preview".
fn bare_model_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
