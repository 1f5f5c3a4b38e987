//! Control collaborator contract

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    Power,
    Light,
    Relay,
    Other(u8),
}

/// Indicator values a hot-swap indicator light takes in each machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub req_activate: i32,
    pub active: i32,
    pub req_deactivate: i32,
    pub inactive: i32,
}

#[async_trait]
pub trait Control: Send + Sync {
    /// Stable identifier, unique within the domain.
    fn id(&self) -> &str;

    fn control_type(&self) -> ControlType;

    fn value_count(&self) -> usize {
        1
    }

    fn is_hot_swap_power(&self) -> bool {
        false
    }

    fn hot_swap_indicator(&self) -> Option<IndicatorSpec> {
        None
    }

    async fn get_value(&self) -> Result<i32>;

    async fn set_value(&self, val: i32) -> Result<()>;
}

/// A usable hot-swap power control: single-value power type, self-classified.
pub(crate) fn is_power_control(control: &dyn Control) -> bool {
    control.control_type() == ControlType::Power
        && control.value_count() == 1
        && control.is_hot_swap_power()
}

/// A usable hot-swap indicator: single-value light with per-state values.
pub(crate) fn indicator_spec_for(control: &dyn Control) -> Option<IndicatorSpec> {
    if control.control_type() != ControlType::Light || control.value_count() != 1 {
        return None;
    }
    control.hot_swap_indicator()
}
