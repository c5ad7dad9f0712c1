use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::{self, doc, oid::ObjectId, Bson, Document};
use mongodb::IndexModel;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::db::safe::{DbError, DbResult, SafeMongo};

/// A typed record persisted in a MongoDB collection.
///
/// Implementors get generic CRUD through [`Store`]. The `_id` accessors let
/// `save` decide between insert (back-filling the generated id) and
/// update-by-identity.
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn id(&self) -> Option<ObjectId>;
    fn set_id(&mut self, id: ObjectId);

    /// Index specifications for the collection. Created idempotently at
    /// startup.
    fn indexes() -> Vec<IndexModel> {
        Vec::new()
    }
}

/// The document operations [`Store`] needs from the database layer. The
/// production implementation is [`SafeMongo`]; tests substitute an
/// in-memory backend.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Returns the inserted `_id`.
    async fn insert_one(&self, collection: &str, document: Document) -> DbResult<Bson>;
    async fn update_one(
        &self,
        collection: &str,
        query: Document,
        update: Document,
        upsert: bool,
    ) -> DbResult<()>;
    async fn delete_one(&self, collection: &str, query: Document) -> DbResult<()>;
    async fn find_one(&self, collection: &str, filter: Document) -> DbResult<Option<Document>>;
    async fn find_many(
        &self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    ) -> DbResult<Vec<Document>>;
    async fn count(&self, collection: &str, filter: Document) -> DbResult<u64>;
    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>)
        -> DbResult<Vec<Document>>;
    async fn create_indexes(&self, collection: &str, indexes: Vec<IndexModel>) -> DbResult<()>;
}

#[async_trait]
impl DocumentBackend for SafeMongo {
    async fn insert_one(&self, collection: &str, document: Document) -> DbResult<Bson> {
        let result = SafeMongo::insert_one(self, collection, document).await?;
        Ok(result.inserted_id)
    }

    async fn update_one(
        &self,
        collection: &str,
        query: Document,
        update: Document,
        upsert: bool,
    ) -> DbResult<()> {
        SafeMongo::update_one(self, collection, query, update, upsert).await?;
        Ok(())
    }

    async fn delete_one(&self, collection: &str, query: Document) -> DbResult<()> {
        SafeMongo::delete_one(self, collection, query).await?;
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: Document) -> DbResult<Option<Document>> {
        SafeMongo::find_one(self, collection, filter).await
    }

    async fn find_many(
        &self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    ) -> DbResult<Vec<Document>> {
        SafeMongo::find_many(self, collection, filter, sort, limit, None).await
    }

    async fn count(&self, collection: &str, filter: Document) -> DbResult<u64> {
        SafeMongo::count(self, collection, filter).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> DbResult<Vec<Document>> {
        SafeMongo::aggregate(self, collection, pipeline).await
    }

    async fn create_indexes(&self, collection: &str, indexes: Vec<IndexModel>) -> DbResult<()> {
        SafeMongo::create_indexes(self, collection, indexes).await
    }
}

/// Generic persistence layered on a [`DocumentBackend`]. All failures come
/// back as [`DbError`] values; nothing here panics on backend trouble.
pub struct Store {
    db: Arc<dyn DocumentBackend>,
}

impl Store {
    pub fn new(db: Arc<SafeMongo>) -> Self {
        let db: Arc<dyn DocumentBackend> = db;
        Self { db }
    }

    #[cfg(test)]
    fn with_backend(db: Arc<dyn DocumentBackend>) -> Self {
        Self { db }
    }

    fn to_document<M: Model>(model: &M) -> DbResult<Document> {
        bson::to_document(model)
            .map_err(|e| DbError::new(crate::db::safe::DbErrorKind::Validation, e.to_string()))
    }

    fn from_document<M: Model>(document: Document) -> DbResult<M> {
        bson::from_document(document.clone()).map_err(|e| {
            DbError::validation(format!("failed to decode {}: {}", M::COLLECTION, e), document)
        })
    }

    /// Updates the record by identity when it has one, otherwise inserts it
    /// and back-fills the generated id. Calling this twice on an identified
    /// record updates the same row rather than duplicating it.
    pub async fn save<M: Model>(&self, model: &mut M) -> DbResult<()> {
        let mut document = Self::to_document(model)?;
        document.remove("_id");

        match model.id() {
            Some(id) => {
                self.db
                    .update_one(M::COLLECTION, doc! { "_id": id }, doc! { "$set": document }, false)
                    .await?;
            }
            None => {
                let inserted_id = self.db.insert_one(M::COLLECTION, document).await?;
                if let Bson::ObjectId(id) = inserted_id {
                    model.set_id(id);
                }
            }
        }
        Ok(())
    }

    pub async fn delete<M: Model>(&self, model: &M) -> DbResult<()> {
        match model.id() {
            Some(id) => {
                self.db.delete_one(M::COLLECTION, doc! { "_id": id }).await?;
                Ok(())
            }
            None => Err(DbError::validation(
                "cannot delete a record without an _id",
                Self::to_document(model)?,
            )),
        }
    }

    pub async fn find_one<M: Model>(&self, filter: Document) -> DbResult<Option<M>> {
        match self.db.find_one(M::COLLECTION, filter).await? {
            Some(document) => Ok(Some(Self::from_document(document)?)),
            None => Ok(None),
        }
    }

    pub async fn find<M: Model>(
        &self,
        filter: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    ) -> DbResult<Vec<M>> {
        let documents = self.db.find_many(M::COLLECTION, filter, sort, limit).await?;
        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            records.push(Self::from_document(document)?);
        }
        Ok(records)
    }

    pub async fn count<M: Model>(&self, filter: Document) -> DbResult<u64> {
        self.db.count(M::COLLECTION, filter).await
    }

    pub async fn aggregate<M: Model>(&self, pipeline: Vec<Document>) -> DbResult<Vec<Document>> {
        self.db.aggregate(M::COLLECTION, pipeline).await
    }

    pub async fn ensure_indexes<M: Model>(&self) -> DbResult<()> {
        let indexes = M::indexes();
        if indexes.is_empty() {
            return Ok(());
        }
        debug!("Ensuring {} indexes for {}", indexes.len(), M::COLLECTION);
        self.db.create_indexes(M::COLLECTION, indexes).await
    }
}

/// Serde helpers for timestamp fields. Documents written by older deploys
/// stored expiry dates as ISO-8601 strings, while the driver writes native
/// BSON datetimes; reads accept both, writes always produce the native form.
pub mod dates {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use mongodb::bson::{Bson, DateTime as BsonDateTime};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    fn parse_string(value: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Some(dt.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
                return Some(naive.and_utc());
            }
        }
        None
    }

    fn from_bson<E: serde::de::Error>(value: Bson) -> Result<DateTime<Utc>, E> {
        match value {
            Bson::DateTime(dt) => Ok(dt.to_chrono()),
            Bson::String(s) => parse_string(&s)
                .ok_or_else(|| E::custom(format!("unrecognized date string: {}", s))),
            other => Err(E::custom(format!("expected date, found {}", other))),
        }
    }

    pub mod required {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &DateTime<Utc>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            BsonDateTime::from_chrono(*value).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<DateTime<Utc>, D::Error> {
            let value = Bson::deserialize(deserializer)?;
            super::from_bson(value)
        }
    }

    pub mod optional {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            // None serializes as an explicit null so `$set` clears the field.
            match value {
                Some(dt) => BsonDateTime::from_chrono(*dt).serialize(serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<Bson>::deserialize(deserializer)? {
                None | Some(Bson::Null) => Ok(None),
                Some(value) => super::from_bson(value).map(Some),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        #[serde(with = "dates::required")]
        created_at: DateTime<Utc>,
        #[serde(with = "dates::optional", default)]
        expires_at: Option<DateTime<Utc>>,
    }

    #[test]
    fn dates_round_trip_through_bson() {
        let probe = Probe {
            created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            expires_at: Some(Utc.timestamp_millis_opt(1_800_000_000_000).unwrap()),
        };
        let document = bson::to_document(&probe).unwrap();
        assert!(matches!(document.get("created_at"), Some(Bson::DateTime(_))));
        let decoded: Probe = bson::from_document(document).unwrap();
        assert_eq!(decoded, probe);
    }

    #[test]
    fn none_expiry_serializes_as_null() {
        let probe = Probe {
            created_at: Utc.timestamp_millis_opt(0).unwrap(),
            expires_at: None,
        };
        let document = bson::to_document(&probe).unwrap();
        assert_eq!(document.get("expires_at"), Some(&Bson::Null));
    }

    #[test]
    fn string_dates_are_accepted_on_read() {
        let document = doc! {
            "created_at": "2024-05-01T12:00:00Z",
            "expires_at": "2024-06-01 08:30:00",
        };
        let decoded: Probe = bson::from_document(document).unwrap();
        assert_eq!(
            decoded.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            decoded.expires_at,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn malformed_date_strings_are_rejected() {
        let document = doc! { "created_at": "not-a-date" };
        assert!(bson::from_document::<Probe>(document).is_err());
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Gadget {
        #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
        id: Option<ObjectId>,
        label: String,
    }

    impl Model for Gadget {
        const COLLECTION: &'static str = "gadgets";

        fn id(&self) -> Option<ObjectId> {
            self.id
        }

        fn set_id(&mut self, id: ObjectId) {
            self.id = Some(id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_operations_surface_backend_errors() {
        use crate::db::safe::DbErrorKind;

        let mongo = Arc::new(SafeMongo::new("not-a-mongodb-uri", "prism_test"));
        let store = Store::new(mongo);

        let mut gadget = Gadget {
            id: None,
            label: "probe".to_string(),
        };
        // Deleting an unidentified record is a validation error and never
        // reaches the backend.
        let err = store.delete(&gadget).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Validation);

        assert!(store.save(&mut gadget).await.is_err());
        assert!(store.find_one::<Gadget>(doc! {}).await.is_err());
        assert!(store.find::<Gadget>(doc! {}, None, None).await.is_err());
        assert!(store.count::<Gadget>(doc! {}).await.is_err());
        assert!(store.aggregate::<Gadget>(Vec::new()).await.is_err());
        // No indexes declared, so there is nothing to create.
        assert!(store.ensure_indexes::<Gadget>().await.is_ok());

        gadget.id = Some(ObjectId::new());
        assert!(store.delete(&gadget).await.is_err());
    }

    /// In-memory backend that counts inserts and updates.
    #[derive(Default)]
    struct RecordingBackend {
        collections: std::sync::Mutex<std::collections::HashMap<String, Vec<Document>>>,
        inserts: std::sync::atomic::AtomicUsize,
        updates: std::sync::atomic::AtomicUsize,
    }

    fn filter_matches(document: &Document, filter: &Document) -> bool {
        filter.iter().all(|(key, value)| document.get(key) == Some(value))
    }

    #[async_trait]
    impl DocumentBackend for RecordingBackend {
        async fn insert_one(&self, collection: &str, mut document: Document) -> DbResult<Bson> {
            use std::sync::atomic::Ordering;
            let id = ObjectId::new();
            document.insert("_id", id);
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.collections
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default()
                .push(document);
            Ok(Bson::ObjectId(id))
        }

        async fn update_one(
            &self,
            collection: &str,
            query: Document,
            update: Document,
            _upsert: bool,
        ) -> DbResult<()> {
            use std::sync::atomic::Ordering;
            self.updates.fetch_add(1, Ordering::SeqCst);
            let mut collections = self.collections.lock().unwrap();
            if let Some(documents) = collections.get_mut(collection) {
                if let Some(target) = documents.iter_mut().find(|d| filter_matches(d, &query)) {
                    if let Ok(set) = update.get_document("$set") {
                        for (key, value) in set {
                            target.insert(key, value.clone());
                        }
                    }
                }
            }
            Ok(())
        }

        async fn delete_one(&self, collection: &str, query: Document) -> DbResult<()> {
            let mut collections = self.collections.lock().unwrap();
            if let Some(documents) = collections.get_mut(collection) {
                if let Some(position) = documents.iter().position(|d| filter_matches(d, &query)) {
                    documents.remove(position);
                }
            }
            Ok(())
        }

        async fn find_one(
            &self,
            collection: &str,
            filter: Document,
        ) -> DbResult<Option<Document>> {
            Ok(self
                .collections
                .lock()
                .unwrap()
                .get(collection)
                .and_then(|docs| docs.iter().find(|d| filter_matches(d, &filter)).cloned()))
        }

        async fn find_many(
            &self,
            collection: &str,
            filter: Document,
            _sort: Option<Document>,
            _limit: Option<i64>,
        ) -> DbResult<Vec<Document>> {
            Ok(self
                .collections
                .lock()
                .unwrap()
                .get(collection)
                .map(|docs| {
                    docs.iter()
                        .filter(|d| filter_matches(d, &filter))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn count(&self, collection: &str, filter: Document) -> DbResult<u64> {
            let documents = self.find_many(collection, filter, None, None).await?;
            Ok(documents.len() as u64)
        }

        async fn aggregate(
            &self,
            _collection: &str,
            _pipeline: Vec<Document>,
        ) -> DbResult<Vec<Document>> {
            Ok(Vec::new())
        }

        async fn create_indexes(
            &self,
            _collection: &str,
            _indexes: Vec<IndexModel>,
        ) -> DbResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn saving_twice_updates_instead_of_duplicating() {
        use std::sync::atomic::Ordering;

        let backend = Arc::new(RecordingBackend::default());
        let store = Store::with_backend(backend.clone());

        let mut gadget = Gadget {
            id: None,
            label: "first".to_string(),
        };
        store.save(&mut gadget).await.unwrap();
        let id = gadget.id.expect("insert back-fills the id");
        assert_eq!(backend.inserts.load(Ordering::SeqCst), 1);

        gadget.label = "second".to_string();
        store.save(&mut gadget).await.unwrap();
        assert_eq!(backend.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.updates.load(Ordering::SeqCst), 1);

        let stored: Vec<Gadget> = store.find(doc! {}, None, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].label, "second");
        assert_eq!(stored[0].id, Some(id));

        let found: Option<Gadget> = store.find_one(doc! { "_id": id }).await.unwrap();
        assert_eq!(found.unwrap().label, "second");

        store.delete(&gadget).await.unwrap();
        assert_eq!(store.count::<Gadget>(doc! {}).await.unwrap(), 0);
    }
}
