use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy when nothing is degraded or unhealthy, degraded when something
    /// is degraded but nothing unhealthy, otherwise unhealthy.
    pub fn aggregate(parts: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
        let mut degraded = false;
        for part in parts {
            match part {
                HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
                HealthStatus::Degraded => degraded = true,
                HealthStatus::Healthy => {}
            }
        }
        if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Named health of one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        let status = HealthStatus::aggregate(components.iter().map(|c| c.status));
        Self { status, components }
    }
}
