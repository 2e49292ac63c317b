use crate::types::{LogicalEvent, ModelTotals};

/// Per-token pricing for a model, in USD.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    pub cache_read_input_token_cost: Option<f64>,
    pub cache_creation_input_token_cost: Option<f64>,
}

impl ModelPricing {
    /// Build from USD-per-million-token rates, the unit vendors publish.
    pub fn per_million(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input_cost_per_token: input / 1_000_000.0,
            output_cost_per_token: output / 1_000_000.0,
            cache_read_input_token_cost: Some(cache_read / 1_000_000.0),
            cache_creation_input_token_cost: Some(cache_write / 1_000_000.0),
        }
    }

    pub fn cost(&self, input: u64, output: u64, cache_read: u64, cache_write: u64) -> f64 {
        let mut cost = 0.0;
        cost += input as f64 * self.input_cost_per_token;
        cost += output as f64 * self.output_cost_per_token;
        if let Some(cr) = self.cache_read_input_token_cost {
            cost += cache_read as f64 * cr;
        }
        if let Some(cc) = self.cache_creation_input_token_cost {
            cost += cache_write as f64 * cc;
        }
        cost
    }
}

/// Trait for looking up pricing by model name.
pub trait PricingMap {
    fn get(&self, model: &str) -> Option<&ModelPricing>;

    /// Cost derived from the pricing table. `None` when the model is unpriced.
    fn cost_for_event(&self, e: &LogicalEvent) -> Option<f64> {
        let p = self.get(e.model.as_deref()?)?;
        Some(p.cost(
            e.input_tokens,
            e.output_tokens,
            e.cache_read_tokens,
            e.cache_write_tokens,
        ))
    }

    fn cost_for_totals(&self, model: &str, t: &ModelTotals) -> Option<f64> {
        let p = self.get(model)?;
        Some(p.cost(
            t.input_tokens,
            t.output_tokens,
            t.cache_read_tokens,
            t.cache_write_tokens,
        ))
    }

    /// Models that appeared in events but have no pricing.
    fn unpriced_models<'a, I>(&self, models: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
        Self: Sized,
    {
        models
            .into_iter()
            .filter(|m| self.get(m).is_none())
            .map(str::to_string)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Embedded cost wins; otherwise the pricing table; otherwise unknown.
pub fn resolve_event_cost(event: &LogicalEvent, pricing: Option<&dyn PricingMap>) -> Option<f64> {
    event
        .cost
        .or_else(|| pricing.and_then(|p| p.cost_for_event(event)))
}

/// A pricing map with no entries.
pub struct NoPricing;

impl PricingMap for NoPricing {
    fn get(&self, _model: &str) -> Option<&ModelPricing> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Table(HashMap<String, ModelPricing>);

    impl PricingMap for Table {
        fn get(&self, model: &str) -> Option<&ModelPricing> {
            self.0.get(model)
        }
    }

    fn table() -> Table {
        let mut map = HashMap::new();
        map.insert(
            "claude-sonnet-4-6".to_string(),
            ModelPricing::per_million(3.0, 15.0, 0.30, 3.75),
        );
        Table(map)
    }

    #[test]
    fn per_million_rates() {
        let event = LogicalEvent {
            model: Some("claude-sonnet-4-6".into()),
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            cache_read_tokens: 1_000_000,
            ..LogicalEvent::default()
        };
        let cost = table().cost_for_event(&event).expect("priced");
        assert!((cost - (3.0 + 1.5 + 0.30)).abs() < 1e-9);
    }

    #[test]
    fn embedded_cost_takes_precedence() {
        let event = LogicalEvent {
            model: Some("claude-sonnet-4-6".into()),
            input_tokens: 1_000_000,
            cost: Some(0.42),
            ..LogicalEvent::default()
        };
        let t = table();
        assert_eq!(resolve_event_cost(&event, Some(&t)), Some(0.42));
    }

    #[test]
    fn unpriced_model_stays_unknown() {
        let event = LogicalEvent {
            model: Some("mystery-1".into()),
            input_tokens: 10,
            ..LogicalEvent::default()
        };
        let t = table();
        assert_eq!(resolve_event_cost(&event, Some(&t)), None);
        assert_eq!(resolve_event_cost(&event, None), None);
        assert_eq!(
            t.unpriced_models(["mystery-1", "claude-sonnet-4-6", "mystery-1"]),
            vec!["mystery-1".to_string()]
        );
    }
}
