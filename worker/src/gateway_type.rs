use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream payment processor a payment can be routed to.
///
/// The ordinal and the name are both embedded in store keys, so neither may
/// change once data has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayType {
    Default,
    Fallback,
}

impl GatewayType {
    pub const ALL: [GatewayType; 2] = [GatewayType::Default, GatewayType::Fallback];

    pub fn ordinal(self) -> u8 {
        match self {
            GatewayType::Default => 0,
            GatewayType::Fallback => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GatewayType::Default => "default",
            GatewayType::Fallback => "fallback",
        }
    }

    pub(crate) fn index(self) -> usize {
        self.ordinal() as usize
    }
}

impl fmt::Display for GatewayType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_and_names_are_stable() {
        assert_eq!(GatewayType::Default.ordinal(), 0);
        assert_eq!(GatewayType::Fallback.ordinal(), 1);
        assert_eq!(GatewayType::Default.to_string(), "default");
        assert_eq!(GatewayType::Fallback.to_string(), "fallback");
    }

    #[test]
    fn serializes_as_lowercase_name() {
        let json = serde_json::to_string(&GatewayType::Fallback).unwrap();
        assert_eq!(json, "\"fallback\"");
    }
}
