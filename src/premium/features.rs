use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

/// Subscription tier gating feature access. Ordinals are stored in the
/// database, so the mapping is part of the persisted schema.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "i32", into = "i32")]
pub enum Tier {
    None,
    Basic,
    Standard,
    Pro,
    Enterprise,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::None
    }
}

#[derive(Debug, Error)]
#[error("invalid premium tier ordinal: {0}")]
pub struct InvalidTier(pub i32);

impl Tier {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Tier::None),
            1 => Some(Tier::Basic),
            2 => Some(Tier::Standard),
            3 => Some(Tier::Pro),
            4 => Some(Tier::Enterprise),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Tier::None => 0,
            Tier::Basic => 1,
            Tier::Standard => 2,
            Tier::Pro => 3,
            Tier::Enterprise => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tier::None => "None",
            Tier::Basic => "Basic",
            Tier::Standard => "Standard",
            Tier::Pro => "Pro",
            Tier::Enterprise => "Enterprise",
        }
    }
}

impl TryFrom<i32> for Tier {
    type Error = InvalidTier;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Tier::from_i32(value).ok_or(InvalidTier(value))
    }
}

impl From<Tier> for i32 {
    fn from(tier: Tier) -> i32 {
        tier.as_i32()
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A named premium capability. Immutable once registered; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub name: String,
    pub description: String,
    pub required_level: Tier,
    pub category: String,
}

impl Feature {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        required_level: Tier,
        category: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required_level,
            category: category.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("feature name must not be empty")]
    EmptyName,
    #[error("feature {0} has an empty category")]
    EmptyCategory(String),
}

/// In-process catalog of premium features, built once at startup and
/// read-only thereafter.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    features: HashMap<String, Feature>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the built-in catalog.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let catalog = [
            Feature::new(
                "custom_prefix",
                "Customize the bot command prefix for your server",
                Tier::Basic,
                "General",
            ),
            Feature::new(
                "extended_logs",
                "Access to extended logging features and history",
                Tier::Basic,
                "Logging",
            ),
            Feature::new(
                "auto_responses",
                "Create custom automated responses to messages",
                Tier::Standard,
                "Commands",
            ),
            Feature::new(
                "custom_commands",
                "Create custom commands with dynamic responses",
                Tier::Standard,
                "Commands",
            ),
            Feature::new(
                "auto_moderation",
                "Automatic moderation based on rules",
                Tier::Standard,
                "Moderation",
            ),
            Feature::new(
                "advanced_analytics",
                "Advanced analytics and statistics",
                Tier::Pro,
                "Analytics",
            ),
            Feature::new(
                "custom_integrations",
                "Custom integrations with external services",
                Tier::Enterprise,
                "Integrations",
            ),
        ];
        for feature in catalog {
            if let Err(e) = registry.register(feature) {
                error!("Failed to register built-in feature: {}", e);
            }
        }
        registry
    }

    /// Adds a feature to the catalog. A feature registered under an existing
    /// name replaces the previous definition.
    pub fn register(&mut self, feature: Feature) -> Result<(), RegistrationError> {
        if feature.name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if feature.category.trim().is_empty() {
            return Err(RegistrationError::EmptyCategory(feature.name));
        }
        debug!("Registered premium feature: {}", feature.name);
        self.features.insert(feature.name.clone(), feature);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Feature> {
        self.features.get(name)
    }

    pub fn all(&self) -> Vec<&Feature> {
        self.features.values().collect()
    }

    /// Features unlocked at or below `level`. Raising the level never
    /// removes a feature from the result.
    pub fn by_level(&self, level: Tier) -> Vec<&Feature> {
        self.features
            .values()
            .filter(|f| f.required_level <= level)
            .collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<&Feature> {
        self.features
            .values()
            .filter(|f| f.category == category)
            .collect()
    }

    /// Names of every feature unlocked at `level`, sorted for stable
    /// persistence.
    pub fn names_for_level(&self, level: Tier) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_level(level)
            .into_iter()
            .map(|f| f.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
