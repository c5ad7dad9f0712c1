use std::time::Duration;

use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, FindOptions, UpdateOptions};
use mongodb::results::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
use mongodb::{Client, Collection, Database, IndexModel};
use futures::stream::TryStreamExt;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_POOL_SIZE: u32 = 10;

/// Broad classification of database failures. Connection-class errors are
/// retried by the wrapper; validation-class errors are surfaced immediately
/// with the offending payload attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    Connection,
    Timeout,
    Reconnection,
    Query,
    Write,
    Validation,
    Other,
}

impl DbErrorKind {
    fn from_driver(err: &mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;
        match err.kind.as_ref() {
            ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::Authentication { .. } => DbErrorKind::Connection,
            ErrorKind::ServerSelection { .. } => DbErrorKind::Timeout,
            ErrorKind::Write(_) => DbErrorKind::Write,
            ErrorKind::InvalidArgument { .. }
            | ErrorKind::BsonSerialization(_)
            | ErrorKind::BsonDeserialization(_) => DbErrorKind::Validation,
            ErrorKind::Command(_) => DbErrorKind::Query,
            _ => DbErrorKind::Other,
        }
    }

    /// Whether an error of this kind indicates a severed connection.
    pub fn is_connectivity(self) -> bool {
        matches!(
            self,
            DbErrorKind::Connection | DbErrorKind::Timeout | DbErrorKind::Reconnection
        )
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
    /// The document or query that triggered a non-retriable failure, kept
    /// for diagnostics.
    pub payload: Option<Document>,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: None,
        }
    }

    pub fn validation(message: impl Into<String>, payload: Document) -> Self {
        Self {
            kind: DbErrorKind::Validation,
            message: message.into(),
            payload: Some(payload),
        }
    }

    fn driver(err: mongodb::error::Error, payload: Option<Document>) -> Self {
        Self {
            kind: DbErrorKind::from_driver(&err),
            message: err.to_string(),
            payload,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// MongoDB access wrapper that never lets driver errors escape as panics.
/// Every operation resolves the target collection (reconnecting with bounded
/// retries if the connection was severed), executes, and converts failures
/// into a typed [`DbError`].
pub struct SafeMongo {
    uri: String,
    db_name: String,
    handle: RwLock<Option<Database>>,
}

impl SafeMongo {
    pub fn new(uri: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            db_name: db_name.into(),
            handle: RwLock::new(None),
        }
    }

    pub fn database_name(&self) -> &str {
        &self.db_name
    }

    /// Establishes the connection with bounded timeouts and verifies it with
    /// a ping before trusting it.
    pub async fn connect(&self) -> DbResult<()> {
        info!("Connecting to MongoDB database: {}", self.db_name);

        let mut options = ClientOptions::parse(&self.uri)
            .await
            .map_err(|e| DbError::driver(e, None))?;
        options.connect_timeout = Some(CONNECT_TIMEOUT);
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        options.max_pool_size = Some(MAX_POOL_SIZE);

        let client = Client::with_options(options).map_err(|e| DbError::driver(e, None))?;
        let database = client.database(&self.db_name);

        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                error!("Failed to connect to MongoDB: {}", e);
                DbError::driver(e, None)
            })?;

        *self.handle.write().await = Some(database);
        info!("Connected to MongoDB database: {}", self.db_name);
        Ok(())
    }

    /// Drops the connection handle. Safe to call repeatedly; the next
    /// operation will reconnect.
    pub async fn close(&self) {
        let mut handle = self.handle.write().await;
        if handle.take().is_some() {
            info!("Closed MongoDB connection");
        }
    }

    async fn sever(&self) {
        *self.handle.write().await = None;
    }

    async fn ensure_connected(&self) -> DbResult<Database> {
        if let Some(db) = self.handle.read().await.clone() {
            return Ok(db);
        }

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            match self.connect().await {
                Ok(()) => {
                    if let Some(db) = self.handle.read().await.clone() {
                        return Ok(db);
                    }
                }
                Err(e) => {
                    warn!(
                        "Reconnection attempt {}/{} failed: {}",
                        attempt, MAX_RECONNECT_ATTEMPTS, e
                    );
                    if attempt < MAX_RECONNECT_ATTEMPTS {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }

        Err(DbError::new(
            DbErrorKind::Reconnection,
            "failed to reconnect to MongoDB after multiple attempts",
        ))
    }

    async fn collection(&self, name: &str) -> DbResult<Collection<Document>> {
        let db = self.ensure_connected().await?;
        Ok(db.collection::<Document>(name))
    }

    /// Converts a driver error into a [`DbError`], severing the handle on
    /// connectivity failures so the next operation reconnects.
    async fn operation_failed(
        &self,
        context: &str,
        err: mongodb::error::Error,
        payload: Option<Document>,
    ) -> DbError {
        let wrapped = DbError::driver(err, payload);
        error!("MongoDB {} failed: {}", context, wrapped);
        if wrapped.kind.is_connectivity() {
            self.sever().await;
        }
        wrapped
    }

    pub async fn insert_one(&self, collection: &str, document: Document) -> DbResult<InsertOneResult> {
        let coll = self.collection(collection).await?;
        match coll.insert_one(document.clone(), None).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.operation_failed("insert_one", e, Some(document)).await),
        }
    }

    pub async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> DbResult<InsertManyResult> {
        let coll = self.collection(collection).await?;
        match coll.insert_many(documents.clone(), None).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let payload = doc! { "documents": documents.into_iter().map(Bson::Document).collect::<Vec<_>>() };
                Err(self.operation_failed("insert_many", e, Some(payload)).await)
            }
        }
    }

    pub async fn find_one(&self, collection: &str, filter: Document) -> DbResult<Option<Document>> {
        let coll = self.collection(collection).await?;
        match coll.find_one(filter, None).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.operation_failed("find_one", e, None).await),
        }
    }

    pub async fn find_many(
        &self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
        limit: Option<i64>,
        skip: Option<u64>,
    ) -> DbResult<Vec<Document>> {
        let coll = self.collection(collection).await?;
        let options = FindOptions::builder()
            .sort(sort)
            .limit(limit)
            .skip(skip)
            .build();
        let cursor = match coll.find(filter, options).await {
            Ok(cursor) => cursor,
            Err(e) => return Err(self.operation_failed("find", e, None).await),
        };
        match cursor.try_collect::<Vec<Document>>().await {
            Ok(documents) => Ok(documents),
            Err(e) => Err(self.operation_failed("find cursor", e, None).await),
        }
    }

    pub async fn update_one(
        &self,
        collection: &str,
        query: Document,
        update: Document,
        upsert: bool,
    ) -> DbResult<UpdateResult> {
        let coll = self.collection(collection).await?;
        let options = UpdateOptions::builder().upsert(upsert).build();
        match coll.update_one(query.clone(), update.clone(), options).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let payload = doc! { "query": query, "update": update };
                Err(self.operation_failed("update_one", e, Some(payload)).await)
            }
        }
    }

    pub async fn update_many(
        &self,
        collection: &str,
        query: Document,
        update: Document,
    ) -> DbResult<UpdateResult> {
        let coll = self.collection(collection).await?;
        match coll.update_many(query.clone(), update.clone(), None).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let payload = doc! { "query": query, "update": update };
                Err(self.operation_failed("update_many", e, Some(payload)).await)
            }
        }
    }

    pub async fn delete_one(&self, collection: &str, query: Document) -> DbResult<DeleteResult> {
        let coll = self.collection(collection).await?;
        match coll.delete_one(query.clone(), None).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.operation_failed("delete_one", e, Some(query)).await),
        }
    }

    pub async fn delete_many(&self, collection: &str, query: Document) -> DbResult<DeleteResult> {
        let coll = self.collection(collection).await?;
        match coll.delete_many(query.clone(), None).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.operation_failed("delete_many", e, Some(query)).await),
        }
    }

    pub async fn count(&self, collection: &str, filter: Document) -> DbResult<u64> {
        let coll = self.collection(collection).await?;
        match coll.count_documents(filter, None).await {
            Ok(count) => Ok(count),
            Err(e) => Err(self.operation_failed("count_documents", e, None).await),
        }
    }

    pub async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> DbResult<Vec<Document>> {
        let coll = self.collection(collection).await?;
        let cursor = match coll.aggregate(pipeline, None).await {
            Ok(cursor) => cursor,
            Err(e) => return Err(self.operation_failed("aggregate", e, None).await),
        };
        match cursor.try_collect::<Vec<Document>>().await {
            Ok(documents) => Ok(documents),
            Err(e) => Err(self.operation_failed("aggregate cursor", e, None).await),
        }
    }

    pub async fn collection_exists(&self, collection: &str) -> DbResult<bool> {
        let db = self.ensure_connected().await?;
        match db.list_collection_names(None).await {
            Ok(names) => Ok(names.iter().any(|n| n == collection)),
            Err(e) => Err(self.operation_failed("list_collection_names", e, None).await),
        }
    }

    /// Index creation is idempotent on the server side, so this is safe to
    /// call on every startup.
    pub async fn create_indexes(&self, collection: &str, indexes: Vec<IndexModel>) -> DbResult<()> {
        if indexes.is_empty() {
            return Ok(());
        }
        let coll = self.collection(collection).await?;
        match coll.create_indexes(indexes, None).await {
            Ok(_) => {
                info!("Created indexes for collection {}", collection);
                Ok(())
            }
            Err(e) => Err(self.operation_failed("create_indexes", e, None).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_kinds_trigger_reconnect() {
        assert!(DbErrorKind::Connection.is_connectivity());
        assert!(DbErrorKind::Timeout.is_connectivity());
        assert!(DbErrorKind::Reconnection.is_connectivity());
        assert!(!DbErrorKind::Validation.is_connectivity());
        assert!(!DbErrorKind::Write.is_connectivity());
    }

    #[test]
    fn validation_errors_carry_the_offending_payload() {
        let payload = doc! { "guild_id": 123i64 };
        let err = DbError::validation("missing _id", payload.clone());
        assert_eq!(err.kind, DbErrorKind::Validation);
        assert_eq!(err.payload, Some(payload));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let db = SafeMongo::new("mongodb://localhost:27017", "prism_test");
        db.close().await;
        db.close().await;
    }

    // An unparseable URI makes every connect attempt fail without touching
    // the network, so the retry loop exhausts and surfaces Reconnection.
    #[tokio::test(start_paused = true)]
    async fn operations_surface_reconnection_failure() {
        let db = SafeMongo::new("not-a-mongodb-uri", "prism_test");
        assert_eq!(db.database_name(), "prism_test");

        let err = db.insert_one("things", doc! { "a": 1 }).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db.insert_many("things", vec![doc! { "a": 1 }]).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db.find_one("things", doc! {}).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db
            .find_many("things", doc! {}, Some(doc! { "a": 1 }), Some(5), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db
            .update_one("things", doc! {}, doc! { "$set": { "a": 2 } }, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db
            .update_many("things", doc! {}, doc! { "$set": { "a": 2 } })
            .await
            .unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db.delete_one("things", doc! {}).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db.delete_many("things", doc! {}).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db.count("things", doc! {}).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db.aggregate("things", vec![doc! { "$match": {} }]).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db.collection_exists("things").await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
        let err = db
            .create_indexes("things", vec![IndexModel::builder().keys(doc! { "a": 1 }).build()])
            .await
            .unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Reconnection);
    }
}
