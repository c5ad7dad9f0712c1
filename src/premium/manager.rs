use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use mongodb::bson::{doc, DateTime as BsonDateTime};
use tracing::{debug, error, info, warn};

use crate::db::model::Store;
use crate::db::safe::DbResult;
use crate::premium::features::{FeatureRegistry, Tier};
use crate::premium::models::{PremiumGuild, PremiumUser, Subject};

pub const DEFAULT_CACHE_TTL_SECS: i64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Process-local snapshot of a subject's entitlement. Entries older than the
/// cache TTL are revalidated against the store before being trusted.
#[derive(Debug, Clone)]
struct CacheEntry {
    tier: Tier,
    features: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl CacheEntry {
    fn none(now: DateTime<Utc>) -> Self {
        Self {
            tier: Tier::None,
            features: Vec::new(),
            expires_at: None,
            updated_at: now,
        }
    }

    fn from_subject<S: Subject>(subject: &S, now: DateTime<Utc>) -> Self {
        Self {
            tier: subject.tier(),
            features: subject.features().to_vec(),
            expires_at: subject.expires_at(),
            updated_at: now,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.updated_at <= ttl
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }
}

/// Snapshot of a subject's subscription for display purposes.
#[derive(Debug, Clone)]
pub struct PremiumStatus {
    pub is_premium: bool,
    pub tier: Tier,
    pub tier_name: &'static str,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_left: i64,
    pub features: Vec<String>,
    pub available_features: Vec<String>,
}

impl PremiumStatus {
    fn none() -> Self {
        Self {
            is_premium: false,
            tier: Tier::None,
            tier_name: Tier::None.name(),
            expires_at: None,
            days_left: 0,
            features: Vec::new(),
            available_features: Vec::new(),
        }
    }

    fn from_record<S: Subject>(record: &S, registry: &FeatureRegistry, now: DateTime<Utc>) -> Self {
        let tier = record.effective_tier(now);
        if tier == Tier::None {
            return Self::none();
        }
        Self {
            is_premium: true,
            tier,
            tier_name: tier.name(),
            expires_at: record.expires_at(),
            days_left: record.days_left(now),
            features: record.features().to_vec(),
            available_features: registry.names_for_level(tier),
        }
    }
}

/// Persistence the entitlement layer needs for one subject kind. The
/// production implementation routes through [`Store`]; tests substitute an
/// in-memory fake.
#[async_trait]
trait SubjectRecords<S: Subject>: Send + Sync {
    async fn load(&self, subject_id: i64) -> DbResult<Option<S>>;
    async fn persist(&self, record: &mut S) -> DbResult<()>;
    /// Candidates for the expiration sweep: records with a past expiry and a
    /// tier other than NONE.
    async fn load_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<S>>;
}

struct DbRecords {
    store: Arc<Store>,
}

#[async_trait]
impl<S: Subject + 'static> SubjectRecords<S> for DbRecords {
    async fn load(&self, subject_id: i64) -> DbResult<Option<S>> {
        self.store.find_one(S::subject_filter(subject_id)).await
    }

    async fn persist(&self, record: &mut S) -> DbResult<()> {
        self.store.save(record).await
    }

    async fn load_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<S>> {
        // Legacy documents store expiry as ISO-8601 strings; the second arm
        // matches those lexicographically and the sweep re-checks the
        // decoded expiry before downgrading.
        let filter = doc! {
            "tier": { "$ne": Tier::None.as_i32() },
            "$or": [
                { "expires_at": { "$lt": BsonDateTime::from_chrono(now) } },
                { "expires_at": { "$lt": now.to_rfc3339() } },
            ],
        };
        self.store.find(filter, None, None).await
    }
}

/// Cache plus record access for one subject kind. The manager instantiates
/// this twice, for guilds and for users.
struct EntitlementStore<S: Subject> {
    records: Arc<dyn SubjectRecords<S>>,
    registry: Arc<FeatureRegistry>,
    cache: DashMap<i64, CacheEntry>,
    cache_ttl: Duration,
}

impl<S: Subject> EntitlementStore<S> {
    fn new(
        records: Arc<dyn SubjectRecords<S>>,
        registry: Arc<FeatureRegistry>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            records,
            registry,
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Persists the expired record's downgrade to NONE.
    async fn downgrade(&self, subject_id: i64, now: DateTime<Utc>) {
        match self.records.load(subject_id).await {
            Ok(Some(mut record)) => {
                record.apply_revoke(now);
                match self.records.persist(&mut record).await {
                    Ok(()) => info!("Premium expired for {} {}", S::KIND, subject_id),
                    Err(e) => error!(
                        "Failed to persist expiry downgrade for {} {}: {}",
                        S::KIND,
                        subject_id,
                        e
                    ),
                }
            }
            Ok(None) => {}
            Err(e) => warn!(
                "Could not load {} {} for expiry downgrade: {}",
                S::KIND,
                subject_id,
                e
            ),
        }
    }

    /// Resolves the subject's current entitlement: cache first, store on a
    /// miss or stale entry, lazy expiry downgrade on either path. Returns
    /// `None` only when the store is unreachable; that outcome is not
    /// cached, so reads fail closed without pinning a wrong verdict for a
    /// whole TTL window.
    async fn resolve(&self, subject_id: i64) -> Option<CacheEntry> {
        let now = Utc::now();

        let cached = self.cache.get(&subject_id).map(|e| e.value().clone());
        if let Some(entry) = cached {
            if entry.is_fresh(now, self.cache_ttl) {
                if entry.is_expired_at(now) {
                    self.downgrade(subject_id, now).await;
                    let none = CacheEntry::none(now);
                    self.cache.insert(subject_id, none.clone());
                    return Some(none);
                }
                return Some(entry);
            }
        }

        match self.records.load(subject_id).await {
            Ok(Some(record)) => {
                let entry = if record.is_expired_at(now) {
                    if record.tier() != Tier::None {
                        self.downgrade(subject_id, now).await;
                    }
                    CacheEntry::none(now)
                } else {
                    CacheEntry::from_subject(&record, now)
                };
                self.cache.insert(subject_id, entry.clone());
                Some(entry)
            }
            Ok(None) => {
                let entry = CacheEntry::none(now);
                self.cache.insert(subject_id, entry.clone());
                Some(entry)
            }
            Err(e) => {
                warn!(
                    "Premium lookup for {} {} failed, denying access: {}",
                    S::KIND,
                    subject_id,
                    e
                );
                None
            }
        }
    }

    async fn is_premium(&self, subject_id: i64) -> bool {
        match self.resolve(subject_id).await {
            Some(entry) => entry.tier > Tier::None,
            None => false,
        }
    }

    async fn tier(&self, subject_id: i64) -> Tier {
        match self.resolve(subject_id).await {
            Some(entry) => entry.tier,
            None => Tier::None,
        }
    }

    async fn has_feature(&self, subject_id: i64, feature_name: &str) -> bool {
        let feature = match self.registry.get(feature_name) {
            Some(feature) => feature.clone(),
            None => {
                warn!("Unknown premium feature: {}", feature_name);
                return false;
            }
        };
        match self.resolve(subject_id).await {
            Some(entry) => {
                entry.tier >= feature.required_level
                    && entry.features.iter().any(|f| f == feature_name)
            }
            None => false,
        }
    }

    async fn load_or_new(&self, subject_id: i64, now: DateTime<Utc>) -> DbResult<S> {
        Ok(self
            .records
            .load(subject_id)
            .await?
            .unwrap_or_else(|| S::new_record(subject_id, now)))
    }

    async fn grant(&self, subject_id: i64, tier: Tier, duration_days: i64) -> bool {
        if tier == Tier::None {
            warn!("Refusing to grant tier None to {} {}", S::KIND, subject_id);
            return false;
        }
        let now = Utc::now();
        let mut record = match self.load_or_new(subject_id, now).await {
            Ok(record) => record,
            Err(e) => {
                error!("Failed to load {} {} for grant: {}", S::KIND, subject_id, e);
                return false;
            }
        };

        let expiry = record.apply_grant(tier, duration_days, &self.registry, now);
        match self.records.persist(&mut record).await {
            Ok(()) => {
                // Write-through: reads reflect the grant immediately.
                self.cache
                    .insert(subject_id, CacheEntry::from_subject(&record, now));
                info!(
                    "Granted {} premium to {} {} until {}",
                    tier,
                    S::KIND,
                    subject_id,
                    expiry
                );
                true
            }
            Err(e) => {
                error!("Failed to grant premium to {} {}: {}", S::KIND, subject_id, e);
                false
            }
        }
    }

    async fn revoke(&self, subject_id: i64) -> bool {
        let now = Utc::now();
        let mut record = match self.records.load(subject_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("{} {} has no premium record to revoke", S::KIND, subject_id);
                return false;
            }
            Err(e) => {
                error!("Failed to load {} {} for revoke: {}", S::KIND, subject_id, e);
                return false;
            }
        };

        record.apply_revoke(now);
        match self.records.persist(&mut record).await {
            Ok(()) => {
                self.cache.insert(subject_id, CacheEntry::none(now));
                info!("Revoked premium from {} {}", S::KIND, subject_id);
                true
            }
            Err(e) => {
                error!(
                    "Failed to revoke premium from {} {}: {}",
                    S::KIND,
                    subject_id,
                    e
                );
                false
            }
        }
    }

    async fn set_feature(&self, subject_id: i64, feature_name: &str, enabled: bool) -> bool {
        let feature = match self.registry.get(feature_name) {
            Some(feature) => feature.clone(),
            None => {
                warn!("Unknown premium feature: {}", feature_name);
                return false;
            }
        };

        let now = Utc::now();
        let mut record = match self.records.load(subject_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("{} {} has no premium record", S::KIND, subject_id);
                return false;
            }
            Err(e) => {
                error!(
                    "Failed to load {} {} for feature toggle: {}",
                    S::KIND,
                    subject_id,
                    e
                );
                return false;
            }
        };

        let tier = record.effective_tier(now);
        if tier < feature.required_level {
            warn!(
                "Feature {} requires {} but {} {} is at {}",
                feature_name,
                feature.required_level,
                S::KIND,
                subject_id,
                tier
            );
            return false;
        }

        let mut features = record.features().to_vec();
        if enabled {
            if !features.iter().any(|f| f == feature_name) {
                features.push(feature_name.to_string());
                features.sort();
            }
        } else {
            features.retain(|f| f != feature_name);
        }
        // Restore the tier-subset invariant before persisting.
        let unlocked = self.registry.names_for_level(tier);
        features.retain(|f| unlocked.contains(f));
        record.set_features(features);
        record.touch(now);

        match self.records.persist(&mut record).await {
            Ok(()) => {
                self.cache
                    .insert(subject_id, CacheEntry::from_subject(&record, now));
                info!(
                    "{} feature {} for {} {}",
                    if enabled { "Enabled" } else { "Disabled" },
                    feature_name,
                    S::KIND,
                    subject_id
                );
                true
            }
            Err(e) => {
                error!(
                    "Failed to toggle feature {} for {} {}: {}",
                    feature_name,
                    S::KIND,
                    subject_id,
                    e
                );
                false
            }
        }
    }

    async fn status(&self, subject_id: i64) -> PremiumStatus {
        let now = Utc::now();
        match self.records.load(subject_id).await {
            Ok(Some(record)) => PremiumStatus::from_record(&record, &self.registry, now),
            Ok(None) => PremiumStatus::none(),
            Err(e) => {
                warn!(
                    "Status lookup for {} {} failed, reporting none: {}",
                    S::KIND,
                    subject_id,
                    e
                );
                PremiumStatus::none()
            }
        }
    }

    /// Adds `days` to a still-active subscription's remaining time. Lapsed
    /// or absent records are refused; those take a fresh grant.
    async fn extend(&self, subject_id: i64, days: i64) -> bool {
        let now = Utc::now();
        let mut record = match self.records.load(subject_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("{} {} has no premium record to extend", S::KIND, subject_id);
                return false;
            }
            Err(e) => {
                error!("Failed to load {} {} for extend: {}", S::KIND, subject_id, e);
                return false;
            }
        };
        if record.effective_tier(now) == Tier::None {
            warn!("{} {} has no active premium to extend", S::KIND, subject_id);
            return false;
        }

        let expiry = record.extend(days, now);
        record.touch(now);
        match self.records.persist(&mut record).await {
            Ok(()) => {
                self.cache
                    .insert(subject_id, CacheEntry::from_subject(&record, now));
                info!(
                    "Extended premium for {} {} until {}",
                    S::KIND,
                    subject_id,
                    expiry
                );
                true
            }
            Err(e) => {
                error!(
                    "Failed to extend premium for {} {}: {}",
                    S::KIND,
                    subject_id,
                    e
                );
                false
            }
        }
    }

    /// Downgrades every persisted record whose expiry has passed. Returns
    /// the number of records transitioned.
    async fn sweep(&self, now: DateTime<Utc>) -> u64 {
        let records = match self.records.load_expired(now).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Expiration sweep query failed for {}s: {}", S::KIND, e);
                return 0;
            }
        };

        let mut swept = 0u64;
        for mut record in records {
            // The string-date match is lexicographic; trust only the
            // decoded expiry.
            if !record.is_expired_at(now) {
                continue;
            }
            let subject_id = record.subject_id();
            record.apply_revoke(now);
            match self.records.persist(&mut record).await {
                Ok(()) => {
                    self.cache.remove(&subject_id);
                    swept += 1;
                }
                Err(e) => error!(
                    "Failed to downgrade expired {} {}: {}",
                    S::KIND,
                    subject_id,
                    e
                ),
            }
        }
        swept
    }

    /// Evicts cache entries past the TTL.
    fn prune_cache(&self, now: DateTime<Utc>) -> usize {
        let before = self.cache.len();
        let ttl = self.cache_ttl;
        self.cache.retain(|_, entry| entry.is_fresh(now, ttl));
        before - self.cache.len()
    }
}

/// The decision point for "can subject X use feature F". Constructed once at
/// startup and handed to every consumer; owns the process-local caches and
/// the feature registry.
pub struct PremiumManager {
    guilds: EntitlementStore<PremiumGuild>,
    users: EntitlementStore<PremiumUser>,
    registry: Arc<FeatureRegistry>,
    store: Arc<Store>,
    default_duration_days: i64,
}

impl PremiumManager {
    pub fn new(
        store: Arc<Store>,
        registry: FeatureRegistry,
        cache_ttl_secs: i64,
        default_duration_days: i64,
    ) -> Self {
        let registry = Arc::new(registry);
        let cache_ttl = Duration::seconds(cache_ttl_secs);
        let records = Arc::new(DbRecords {
            store: store.clone(),
        });
        Self {
            guilds: EntitlementStore::new(records.clone(), registry.clone(), cache_ttl),
            users: EntitlementStore::new(records, registry.clone(), cache_ttl),
            registry,
            store,
            default_duration_days,
        }
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    pub fn default_duration_days(&self) -> i64 {
        self.default_duration_days
    }

    /// Creates the collections' indexes; safe to run on every startup.
    pub async fn ensure_indexes(&self) -> DbResult<()> {
        self.store.ensure_indexes::<PremiumGuild>().await?;
        self.store.ensure_indexes::<PremiumUser>().await?;
        Ok(())
    }

    pub async fn is_guild_premium(&self, guild_id: u64) -> bool {
        self.guilds.is_premium(guild_id as i64).await
    }

    pub async fn guild_tier(&self, guild_id: u64) -> Tier {
        self.guilds.tier(guild_id as i64).await
    }

    pub async fn guild_has_feature(&self, guild_id: u64, feature: &str) -> bool {
        self.guilds.has_feature(guild_id as i64, feature).await
    }

    pub async fn grant_guild(&self, guild_id: u64, tier: Tier, duration_days: Option<i64>) -> bool {
        let days = duration_days.unwrap_or(self.default_duration_days);
        self.guilds.grant(guild_id as i64, tier, days).await
    }

    pub async fn extend_guild(&self, guild_id: u64, days: i64) -> bool {
        self.guilds.extend(guild_id as i64, days).await
    }

    pub async fn revoke_guild(&self, guild_id: u64) -> bool {
        self.guilds.revoke(guild_id as i64).await
    }

    pub async fn enable_guild_feature(&self, guild_id: u64, feature: &str) -> bool {
        self.guilds.set_feature(guild_id as i64, feature, true).await
    }

    pub async fn disable_guild_feature(&self, guild_id: u64, feature: &str) -> bool {
        self.guilds.set_feature(guild_id as i64, feature, false).await
    }

    pub async fn guild_status(&self, guild_id: u64) -> PremiumStatus {
        self.guilds.status(guild_id as i64).await
    }

    pub async fn is_user_premium(&self, user_id: u64) -> bool {
        self.users.is_premium(user_id as i64).await
    }

    pub async fn user_tier(&self, user_id: u64) -> Tier {
        self.users.tier(user_id as i64).await
    }

    pub async fn user_has_feature(&self, user_id: u64, feature: &str) -> bool {
        self.users.has_feature(user_id as i64, feature).await
    }

    pub async fn grant_user(&self, user_id: u64, tier: Tier, duration_days: Option<i64>) -> bool {
        let days = duration_days.unwrap_or(self.default_duration_days);
        self.users.grant(user_id as i64, tier, days).await
    }

    pub async fn extend_user(&self, user_id: u64, days: i64) -> bool {
        self.users.extend(user_id as i64, days).await
    }

    pub async fn revoke_user(&self, user_id: u64) -> bool {
        self.users.revoke(user_id as i64).await
    }

    pub async fn user_status(&self, user_id: u64) -> PremiumStatus {
        self.users.status(user_id as i64).await
    }

    /// One pass of the expiration sweep. Returns `(guilds, users)`
    /// transitioned to NONE. A missed pass is not correctness-critical;
    /// every read re-checks expiry lazily.
    pub async fn sweep(&self) -> (u64, u64) {
        let now = Utc::now();
        let guilds = self.guilds.sweep(now).await;
        let users = self.users.sweep(now).await;
        if guilds > 0 || users > 0 {
            info!(
                "Expiration sweep downgraded {} guilds and {} users",
                guilds, users
            );
        }
        (guilds, users)
    }

    /// Drops stale cache entries; run periodically alongside the sweep.
    pub fn prune_caches(&self) {
        let now = Utc::now();
        let evicted = self.guilds.prune_cache(now) + self.users.prune_cache(now);
        if evicted > 0 {
            debug!("Pruned {} stale premium cache entries", evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::safe::SafeMongo;
    use chrono::TimeZone;
    use mongodb::bson::oid::ObjectId;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    /// In-memory guild records with a load counter.
    #[derive(Default)]
    struct FakeRecords {
        records: Mutex<HashMap<i64, PremiumGuild>>,
        loads: AtomicUsize,
    }

    impl FakeRecords {
        fn seed(&self, record: PremiumGuild) {
            self.records.lock().unwrap().insert(record.guild_id, record);
        }

        fn get(&self, subject_id: i64) -> Option<PremiumGuild> {
            self.records.lock().unwrap().get(&subject_id).cloned()
        }

        fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SubjectRecords<PremiumGuild> for FakeRecords {
        async fn load(&self, subject_id: i64) -> DbResult<Option<PremiumGuild>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.get(subject_id))
        }

        async fn persist(&self, record: &mut PremiumGuild) -> DbResult<()> {
            if record.id.is_none() {
                record.id = Some(ObjectId::new());
            }
            self.seed(record.clone());
            Ok(())
        }

        async fn load_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<PremiumGuild>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.tier != Tier::None && r.is_expired_at(now))
                .cloned()
                .collect())
        }
    }

    fn fake_store() -> (Arc<FakeRecords>, EntitlementStore<PremiumGuild>) {
        let fake = Arc::new(FakeRecords::default());
        let store = EntitlementStore::new(
            fake.clone(),
            Arc::new(FeatureRegistry::builtin()),
            Duration::seconds(DEFAULT_CACHE_TTL_SECS),
        );
        (fake, store)
    }

    #[tokio::test]
    async fn grant_is_visible_from_cache_without_another_load() {
        let (fake, store) = fake_store();
        assert!(store.grant(1, Tier::Pro, 30).await);

        let loads = fake.load_count();
        assert!(store.is_premium(1).await);
        assert_eq!(store.tier(1).await, Tier::Pro);
        assert!(store.has_feature(1, "advanced_analytics").await);
        assert_eq!(fake.load_count(), loads);
    }

    #[tokio::test]
    async fn reads_lazily_downgrade_expired_records() {
        let (fake, store) = fake_store();
        let registry = FeatureRegistry::builtin();
        let mut record = PremiumGuild::new_record(5, now());
        record.apply_grant(Tier::Enterprise, 30, &registry, now());
        record.expires_at = Some(Utc::now() - Duration::seconds(5));
        fake.seed(record);

        assert!(!store.is_premium(5).await);
        let stored = fake.get(5).unwrap();
        assert_eq!(stored.tier, Tier::None);
        assert!(stored.features.is_empty());
        assert!(!stored.status);
    }

    #[tokio::test]
    async fn sweep_downgrades_expired_subjects_and_leaves_active_ones() {
        let (fake, store) = fake_store();
        let registry = FeatureRegistry::builtin();

        let mut expired = PremiumGuild::new_record(1, now());
        expired.apply_grant(Tier::Pro, 30, &registry, now());
        expired.expires_at = Some(Utc::now() - Duration::days(1));
        fake.seed(expired);
        store.cache.insert(
            1,
            CacheEntry {
                tier: Tier::Pro,
                features: Vec::new(),
                expires_at: None,
                updated_at: Utc::now(),
            },
        );
        assert!(store.grant(2, Tier::Basic, 30).await);

        assert_eq!(store.sweep(Utc::now()).await, 1);

        let downgraded = fake.get(1).unwrap();
        assert_eq!(downgraded.tier, Tier::None);
        assert!(downgraded.features.is_empty());
        assert_eq!(downgraded.expires_at, None);
        assert!(!store.cache.contains_key(&1));

        let active = fake.get(2).unwrap();
        assert_eq!(active.tier, Tier::Basic);
        assert!(store.cache.contains_key(&2));
    }

    #[tokio::test]
    async fn extend_adds_days_to_an_active_subscription_only() {
        let (fake, store) = fake_store();
        assert!(store.grant(7, Tier::Basic, 10).await);
        assert!(store.extend(7, 5).await);
        let record = fake.get(7).unwrap();
        assert_eq!(record.days_left(Utc::now()), 14);

        assert!(!store.extend(99, 5).await);

        let registry = FeatureRegistry::builtin();
        let mut lapsed = PremiumGuild::new_record(8, now());
        lapsed.apply_grant(Tier::Basic, 10, &registry, now());
        lapsed.expires_at = Some(Utc::now() - Duration::days(1));
        fake.seed(lapsed);
        assert!(!store.extend(8, 5).await);
    }

    #[tokio::test]
    async fn feature_toggles_stay_within_the_unlocked_set() {
        let (fake, store) = fake_store();
        assert!(store.grant(3, Tier::Basic, 30).await);

        assert!(!store.set_feature(3, "advanced_analytics", true).await);
        assert!(store.set_feature(3, "custom_prefix", false).await);
        let record = fake.get(3).unwrap();
        assert!(!record.features.iter().any(|f| f == "custom_prefix"));

        assert!(store.set_feature(3, "custom_prefix", true).await);
        assert!(store.has_feature(3, "custom_prefix").await);
    }

    fn unreachable_manager() -> PremiumManager {
        // The URI fails to parse, so every store operation errors without
        // touching the network.
        let mongo = Arc::new(SafeMongo::new("not-a-mongodb-uri", "premium_test"));
        let store = Arc::new(Store::new(mongo));
        PremiumManager::new(store, FeatureRegistry::builtin(), DEFAULT_CACHE_TTL_SECS, 30)
    }

    #[tokio::test(start_paused = true)]
    async fn reads_fail_closed_when_the_store_is_unreachable() {
        let manager = unreachable_manager();
        assert!(!manager.is_guild_premium(1).await);
        assert!(!manager.is_user_premium(1).await);
        assert_eq!(manager.guild_tier(1).await, Tier::None);
        assert_eq!(manager.user_tier(1).await, Tier::None);
        assert!(!manager.guild_has_feature(1, "custom_commands").await);
        assert!(!manager.user_has_feature(1, "custom_commands").await);
        assert!(!manager.guild_status(1).await.is_premium);
        assert!(!manager.user_status(1).await.is_premium);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_report_failure_when_the_store_is_unreachable() {
        let manager = unreachable_manager();
        assert!(!manager.grant_guild(1, Tier::Pro, None).await);
        assert!(!manager.grant_user(1, Tier::Basic, Some(7)).await);
        assert!(!manager.extend_guild(1, 7).await);
        assert!(!manager.extend_user(1, 7).await);
        assert!(!manager.revoke_guild(1).await);
        assert!(!manager.revoke_user(1).await);
        assert!(!manager.enable_guild_feature(1, "custom_commands").await);
        assert!(!manager.disable_guild_feature(1, "custom_commands").await);
        assert_eq!(manager.sweep().await, (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_features_are_denied_without_a_store_round_trip() {
        let manager = unreachable_manager();
        assert!(!manager.guild_has_feature(1, "no_such_feature").await);
        assert!(!manager.enable_guild_feature(1, "no_such_feature").await);
    }

    #[test]
    fn entries_go_stale_after_the_ttl() {
        let ttl = Duration::seconds(DEFAULT_CACHE_TTL_SECS);
        let entry = CacheEntry {
            tier: Tier::Standard,
            features: vec!["custom_commands".to_string()],
            expires_at: None,
            updated_at: now(),
        };
        assert!(entry.is_fresh(now(), ttl));
        assert!(entry.is_fresh(now() + Duration::seconds(DEFAULT_CACHE_TTL_SECS), ttl));
        assert!(!entry.is_fresh(now() + Duration::seconds(DEFAULT_CACHE_TTL_SECS + 1), ttl));
    }

    #[test]
    fn cached_expiry_is_detected_before_the_ttl_lapses() {
        let entry = CacheEntry {
            tier: Tier::Pro,
            features: Vec::new(),
            expires_at: Some(now() - Duration::seconds(1)),
            updated_at: now(),
        };
        // Still fresh by TTL, but the subscription itself has lapsed.
        assert!(entry.is_fresh(now(), Duration::seconds(DEFAULT_CACHE_TTL_SECS)));
        assert!(entry.is_expired_at(now()));
    }

    #[test]
    fn status_for_an_expired_record_reports_none() {
        let registry = FeatureRegistry::builtin();
        let mut guild = PremiumGuild::new_record(1, now());
        guild.apply_grant(Tier::Pro, 30, &registry, now());
        guild.expires_at = Some(now() - Duration::days(1));

        let status = PremiumStatus::from_record(&guild, &registry, now());
        assert!(!status.is_premium);
        assert_eq!(status.tier, Tier::None);
        assert_eq!(status.days_left, 0);
        assert!(status.available_features.is_empty());
    }

    #[test]
    fn status_for_an_active_record_lists_features_and_days() {
        let registry = FeatureRegistry::builtin();
        let mut guild = PremiumGuild::new_record(1, now());
        guild.apply_grant(Tier::Standard, 30, &registry, now());

        let status = PremiumStatus::from_record(&guild, &registry, now());
        assert!(status.is_premium);
        assert_eq!(status.tier_name, "Standard");
        assert_eq!(status.days_left, 30);
        assert_eq!(status.features, registry.names_for_level(Tier::Standard));
        assert_eq!(status.available_features, status.features);
    }
}
