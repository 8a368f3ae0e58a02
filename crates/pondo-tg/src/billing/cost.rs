use super::Config;
use itertools::Itertools;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChargeKind {
    Text,
    Photo,
    Document,
}

/// Maps a request to its token cost based on the pricing table from the
/// config. Prices are per message, not per LLM token.
#[derive(Clone)]
pub(crate) struct CostPolicy {
    config: Config,
}

impl CostPolicy {
    pub(crate) fn new(config: Config) -> Self {
        Self { config }
    }

    /// The model the request will actually use. An unset or unknown user
    /// preference falls back to the default model.
    pub(crate) fn resolve_model<'a>(&'a self, preferred: Option<&'a str>) -> &'a str {
        preferred
            .filter(|model| self.known_model(model))
            .unwrap_or(&self.config.default_model)
    }

    pub(crate) fn known_model(&self, model: &str) -> bool {
        self.config.model_costs.contains_key(model)
    }

    pub(crate) fn known_models(&self) -> String {
        self.config.model_costs.keys().join(", ")
    }

    pub(crate) fn cost(&self, preferred_model: Option<&str>, kind: ChargeKind) -> u32 {
        let model = self.resolve_model(preferred_model);

        let base = self
            .config
            .model_costs
            .get(model)
            .copied()
            .unwrap_or_else(|| {
                // Unreachable unless the default model is missing from the
                // pricing table. Charge the cheapest known price then.
                self.config.model_costs.values().copied().min().unwrap_or(1)
            });

        match kind {
            ChargeKind::Text => base,
            ChargeKind::Photo | ChargeKind::Document => {
                base.saturating_add(self.config.media_surcharge)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CostPolicy {
        CostPolicy::new(Config::default())
    }

    #[test]
    fn text_messages_cost_the_model_price() {
        let policy = policy();

        assert_eq!(policy.cost(Some("gpt-3.5-turbo"), ChargeKind::Text), 3);
        assert_eq!(policy.cost(Some("gpt-4o-mini"), ChargeKind::Text), 5);
        assert_eq!(policy.cost(Some("gpt-4o"), ChargeKind::Text), 7);
    }

    #[test]
    fn unset_and_unknown_models_fall_back_to_the_default() {
        let policy = policy();

        assert_eq!(policy.resolve_model(None), "gpt-4o");
        assert_eq!(policy.resolve_model(Some("gpt-9000")), "gpt-4o");
        assert_eq!(policy.cost(None, ChargeKind::Text), 7);
        assert_eq!(policy.cost(Some("gpt-9000"), ChargeKind::Text), 7);
    }

    #[test]
    fn media_messages_pay_a_surcharge() {
        let policy = policy();

        assert_eq!(policy.cost(Some("gpt-4o-mini"), ChargeKind::Photo), 7);
        assert_eq!(policy.cost(Some("gpt-4o-mini"), ChargeKind::Document), 7);
    }

    #[test]
    fn known_model_checks_the_pricing_table() {
        let policy = policy();

        assert!(policy.known_model("gpt-4o"));
        assert!(!policy.known_model("gpt-4o "));
        assert!(!policy.known_model("claude-3"));
    }
}
