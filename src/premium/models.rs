use chrono::{DateTime, Duration, Utc};
use mongodb::bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use mongodb::IndexModel;
use serde::{Deserialize, Serialize};

use crate::db::model::{dates, Model};
use crate::premium::features::{FeatureRegistry, Tier};

pub const SCHEMA_VERSION: i32 = 1;

fn default_schema_version() -> i32 {
    SCHEMA_VERSION
}

/// A persisted entitlement holder, guild or user. The provided methods
/// implement the lifecycle shared by both: lazy expiry, grant/revoke
/// mutations, and the invariant that `features` stays a subset of what the
/// stored tier unlocks.
pub trait Subject: Model + Clone {
    /// Short label for log lines.
    const KIND: &'static str;

    fn new_record(subject_id: i64, now: DateTime<Utc>) -> Self;
    fn subject_filter(subject_id: i64) -> Document;

    fn subject_id(&self) -> i64;
    fn tier(&self) -> Tier;
    fn set_tier(&mut self, tier: Tier);
    fn features(&self) -> &[String];
    fn set_features(&mut self, features: Vec<String>);
    fn expires_at(&self) -> Option<DateTime<Utc>>;
    fn set_expires_at(&mut self, expires_at: Option<DateTime<Utc>>);
    fn set_status(&mut self, status: bool);
    fn touch(&mut self, now: DateTime<Utc>);

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at(), Some(expiry) if expiry <= now)
    }

    /// The tier access decisions must use: a past `expires_at` forces
    /// `None` no matter what the stored tier says.
    fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        if self.is_expired_at(now) {
            Tier::None
        } else {
            self.tier()
        }
    }

    fn is_premium_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_tier(now) > Tier::None
    }

    fn has_feature(&self, name: &str) -> bool {
        self.features().iter().any(|f| f == name)
    }

    fn days_left(&self, now: DateTime<Utc>) -> i64 {
        match self.expires_at() {
            Some(expiry) if expiry > now => (expiry - now).num_days(),
            _ => 0,
        }
    }

    /// Adds `days` on top of a still-active expiry, restarting from `now`
    /// for lapsed or perpetual records. This is the extend operation;
    /// grants reset the expiry instead.
    fn extend(&mut self, days: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = match self.expires_at() {
            Some(expiry) if expiry > now => expiry,
            _ => now,
        };
        let expiry = base + Duration::days(days);
        self.set_expires_at(Some(expiry));
        expiry
    }

    /// Assigns `tier` until `now + days` and overwrites the feature set with
    /// the full set the tier unlocks. Every prior state, active included,
    /// lands on the same expiry.
    fn apply_grant(
        &mut self,
        tier: Tier,
        days: i64,
        registry: &FeatureRegistry,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        self.set_tier(tier);
        let expiry = now + Duration::days(days);
        self.set_expires_at(Some(expiry));
        self.set_features(registry.names_for_level(tier));
        self.set_status(tier > Tier::None);
        self.touch(now);
        expiry
    }

    /// Downgrades to no entitlement: tier `None`, no features, no expiry.
    fn apply_revoke(&mut self, now: DateTime<Utc>) {
        self.set_tier(Tier::None);
        self.set_features(Vec::new());
        self.set_expires_at(None);
        self.set_status(false);
        self.touch(now);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremiumGuild {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub guild_id: i64,
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(with = "dates::optional", default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "dates::required")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "dates::required")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremiumUser {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: i64,
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(with = "dates::optional", default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub credits: i64,
    #[serde(with = "dates::required")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "dates::required")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: i32,
}

fn subject_indexes(id_field: &str) -> Vec<IndexModel> {
    vec![
        IndexModel::builder()
            .keys(doc! { id_field: 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build(),
        IndexModel::builder().keys(doc! { "expires_at": 1 }).build(),
    ]
}

impl Model for PremiumGuild {
    const COLLECTION: &'static str = "guild_premium";

    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = Some(id);
    }

    fn indexes() -> Vec<IndexModel> {
        subject_indexes("guild_id")
    }
}

impl Subject for PremiumGuild {
    const KIND: &'static str = "guild";

    fn new_record(subject_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            guild_id: subject_id,
            status: false,
            tier: Tier::None,
            features: Vec::new(),
            expires_at: None,
            created_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
        }
    }

    fn subject_filter(subject_id: i64) -> Document {
        doc! { "guild_id": subject_id }
    }

    fn subject_id(&self) -> i64 {
        self.guild_id
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn set_tier(&mut self, tier: Tier) {
        self.tier = tier;
    }

    fn features(&self) -> &[String] {
        &self.features
    }

    fn set_features(&mut self, features: Vec<String>) {
        self.features = features;
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    fn set_expires_at(&mut self, expires_at: Option<DateTime<Utc>>) {
        self.expires_at = expires_at;
    }

    fn set_status(&mut self, status: bool) {
        self.status = status;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Model for PremiumUser {
    const COLLECTION: &'static str = "user_premium";

    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = Some(id);
    }

    fn indexes() -> Vec<IndexModel> {
        subject_indexes("user_id")
    }
}

impl Subject for PremiumUser {
    const KIND: &'static str = "user";

    fn new_record(subject_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            user_id: subject_id,
            status: false,
            tier: Tier::None,
            features: Vec::new(),
            expires_at: None,
            credits: 0,
            created_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
        }
    }

    fn subject_filter(subject_id: i64) -> Document {
        doc! { "user_id": subject_id }
    }

    fn subject_id(&self) -> i64 {
        self.user_id
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn set_tier(&mut self, tier: Tier) {
        self.tier = tier;
    }

    fn features(&self) -> &[String] {
        &self.features
    }

    fn set_features(&mut self, features: Vec<String>) {
        self.features = features;
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    fn set_expires_at(&mut self, expires_at: Option<DateTime<Utc>>) {
        self.expires_at = expires_at;
    }

    fn set_status(&mut self, status: bool) {
        self.status = status;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
