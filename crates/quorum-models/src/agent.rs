use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Expected latency of an agent. Drives the per-task deadline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    #[default]
    Fast,
    Slow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Disabled,
}

impl HealthStatus {
    /// Whether new tasks may be assigned to an agent in this state.
    pub fn is_dispatchable(self) -> bool {
        !matches!(self, HealthStatus::Disabled)
    }
}

/// Registry metadata for one agent unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    pub id: String,
    /// Capabilities this agent can serve (e.g., "technical", "fundamental").
    pub capability_tags: Vec<String>,
    #[serde(default)]
    pub latency_class: LatencyClass,
    /// Relative invocation cost. Cheaper agents are preferred when resolving.
    pub cost_weight: Decimal,
    pub version: String,
    #[serde(default)]
    pub health: HealthStatus,
}

impl AgentDescriptor {
    pub fn new(id: &str, capabilities: &[&str], latency_class: LatencyClass) -> Self {
        Self {
            id: id.to_string(),
            capability_tags: capabilities.iter().map(|c| c.to_string()).collect(),
            latency_class,
            cost_weight: Decimal::ONE,
            version: "1".to_string(),
            health: HealthStatus::Healthy,
        }
    }

    pub fn with_cost(mut self, cost_weight: Decimal) -> Self {
        self.cost_weight = cost_weight;
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn serves(&self, capability: &str) -> bool {
        self.capability_tags.iter().any(|c| c == capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn descriptor_builder() {
        let descriptor = AgentDescriptor::new("tech-1", &["technical", "momentum"], LatencyClass::Fast)
            .with_cost(dec!(0.5))
            .with_version("2");

        assert!(descriptor.serves("technical"));
        assert!(descriptor.serves("momentum"));
        assert!(!descriptor.serves("fundamental"));
        assert_eq!(descriptor.cost_weight, dec!(0.5));
        assert_eq!(descriptor.version, "2");
        assert_eq!(descriptor.health, HealthStatus::Healthy);
    }

    #[test]
    fn disabled_is_not_dispatchable() {
        assert!(HealthStatus::Healthy.is_dispatchable());
        assert!(HealthStatus::Degraded.is_dispatchable());
        assert!(!HealthStatus::Disabled.is_dispatchable());
    }

    #[test]
    fn health_defaults_when_missing() {
        let json = r#"{
            "id": "fund-1",
            "capability_tags": ["fundamental"],
            "latency_class": "slow",
            "cost_weight": "2.5",
            "version": "1"
        }"#;
        let descriptor: AgentDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.health, HealthStatus::Healthy);
        assert_eq!(descriptor.latency_class, LatencyClass::Slow);
        assert_eq!(descriptor.cost_weight, dec!(2.5));
    }
}
