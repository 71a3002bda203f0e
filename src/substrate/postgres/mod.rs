mod bucket;
mod synclient;
mod tables;

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::DateTime;
use sea_query::{Alias as SeaAlias, Expr as SeaExpr, Func as SeaFunc, OnConflict, PostgresQueryBuilder, Query as SeaQuery};
use sea_query_binder::{SqlxBinder, SqlxValues};
use sqlx::{Row, postgres::PgListener};
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::{
    BenchError, Result, ShareLock,
    common::Shutdown,
    substrate::{BucketConfig, KeyValue, Msg, MsgHandler, StorageType, StreamConfig, StreamInfo, Substrate, SubscriptionId, map_db_err},
    utils,
};

use bucket::PgBucket;
use synclient::SynClient;
use tables::{BucketIden, MessageIden, StreamIden};

/// How long a published message row is kept for subscribers to fetch.
const MESSAGE_RETENTION: Duration = Duration::from_secs(60);
/// Old message rows are pruned once every this many publishes.
const PRUNE_EVERY: u64 = 1024;

/// Postgres-backed substrate.
///
/// Buckets, entries and streams are rows. Publishing appends to
/// `fleetbench_messages` and signals the subject channel with `pg_notify`
/// carrying the message id; subscribers fetch the row on notification.
/// Message rows older than [`MESSAGE_RETENTION`] are pruned as publishing
/// goes, and a stream's rows go with the stream.
/// Subscriptions take literal subjects only.
pub struct PostgresSubstrate {
    conn: Arc<SynClient>,
    subscriptions: ShareLock<HashMap<SubscriptionId, Arc<Shutdown>>>,
    next_sub_id: AtomicU64,
    published: AtomicU64,
}

impl PostgresSubstrate {
    pub fn new(
        db_url: &str,
        runtime: Arc<tokio::runtime::Runtime>,
    ) -> Result<Self> {
        let conn = SynClient::connect(db_url, runtime).map_err(|e| BenchError::Store(format!("unable to connect to postgres: {e}")))?;
        conn.batch_execute(&tables::schema()).map_err(|e| BenchError::Store(format!("unable to create substrate tables: {e}")))?;

        Ok(Self {
            conn: Arc::new(conn),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            next_sub_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
        })
    }

    fn prune_messages_query(cutoff_ms: i64) -> (String, SqlxValues) {
        SeaQuery::delete().from_table(MessageIden::Table).and_where(SeaExpr::col(MessageIden::Timestamp).lt(cutoff_ms)).build_sqlx(PostgresQueryBuilder)
    }

    fn subject_messages_query(subjects: &[String]) -> (String, SqlxValues) {
        SeaQuery::delete()
            .from_table(MessageIden::Table)
            .and_where(SeaExpr::col(MessageIden::Subject).is_in(subjects.iter().map(String::as_str)))
            .build_sqlx(PostgresQueryBuilder)
    }

    fn prune_messages(&self) -> Result<u64> {
        let cutoff = utils::time::time_millis() - MESSAGE_RETENTION.as_millis() as i64;
        let (sql, values) = Self::prune_messages_query(cutoff);
        let result = self.conn.execute(sql.as_str(), values).map_err(|e| BenchError::Store(format!("unable to prune messages: {e}")))?;
        Ok(result.rows_affected())
    }

    fn bucket_ttl(
        &self,
        name: &str,
    ) -> Result<Option<Option<Duration>>> {
        let (sql, values) =
            SeaQuery::select().from(BucketIden::Table).column(BucketIden::TtlMs).and_where(SeaExpr::col(BucketIden::Name).eq(name)).build_sqlx(PostgresQueryBuilder);

        let row = self.conn.query_optional(sql.as_str(), values).map_err(map_db_err)?;
        Ok(row.map(|row| row.get::<Option<i64>, _>(0).map(|ms| Duration::from_millis(ms as u64))))
    }

    fn find_stream(
        &self,
        name: &str,
    ) -> Result<Option<StreamInfo>> {
        let (sql, values) = SeaQuery::select()
            .from(StreamIden::Table)
            .columns([StreamIden::Name, StreamIden::Description, StreamIden::Subjects, StreamIden::Storage, StreamIden::Replicas, StreamIden::Created])
            .and_where(SeaExpr::col(StreamIden::Name).eq(name))
            .build_sqlx(PostgresQueryBuilder);

        let Some(row) = self.conn.query_optional(sql.as_str(), values).map_err(map_db_err)? else {
            return Ok(None);
        };

        let subjects: Vec<String> = serde_json::from_str(&row.get::<String, _>("subjects"))?;
        let storage = row.get::<String, _>("storage").parse::<StorageType>().map_err(|e| BenchError::Convert(e.to_string()))?;
        let created = DateTime::from_timestamp_millis(row.get::<i64, _>("created")).ok_or_else(|| BenchError::Convert(format!("invalid created time for stream '{name}'")))?;

        Ok(Some(StreamInfo {
            config: StreamConfig {
                name: row.get("name"),
                description: row.get("description"),
                subjects,
                storage,
                replicas: row.get::<i64, _>("replicas") as usize,
            },
            created,
        }))
    }
}

impl Substrate for PostgresSubstrate {
    fn key_value(
        &self,
        name: &str,
    ) -> Result<Arc<dyn KeyValue>> {
        match self.bucket_ttl(name)? {
            Some(ttl) => Ok(Arc::new(PgBucket::new(name, ttl, &self.conn))),
            None => Err(BenchError::BucketNotFound(name.to_string())),
        }
    }

    fn get_or_create_key_value(
        &self,
        config: &BucketConfig,
    ) -> Result<Arc<dyn KeyValue>> {
        if config.name.is_empty() {
            return Err(BenchError::Validation("bucket name cannot be empty".into()));
        }
        let ttl_ms: Option<i64> = config.ttl.map(|ttl| ttl.as_millis() as i64);
        let (sql, values) = SeaQuery::insert()
            .into_table(BucketIden::Table)
            .columns([BucketIden::Name, BucketIden::Description, BucketIden::TtlMs])
            .values([config.name.clone().into(), config.description.clone().into(), ttl_ms.into()])
            .map_err(map_db_err)?
            .on_conflict(OnConflict::column(BucketIden::Name).do_nothing().to_owned())
            .build_sqlx(PostgresQueryBuilder);

        let result = self.conn.execute(sql.as_str(), values).map_err(|e| BenchError::Store(format!("unable to create bucket '{}': {e}", config.name)))?;
        if result.rows_affected() > 0 {
            trace!("postgres::create_bucket({})", config.name);
        }

        // a concurrent creator may have won; the stored ttl is authoritative
        self.key_value(&config.name)
    }

    fn delete_key_value(
        &self,
        name: &str,
    ) -> Result<()> {
        let (sql, values) = SeaQuery::delete().from_table(BucketIden::Table).and_where(SeaExpr::col(BucketIden::Name).eq(name)).build_sqlx(PostgresQueryBuilder);
        // entries go with the bucket row through the foreign key
        let result = self.conn.execute(sql.as_str(), values).map_err(map_db_err)?;
        if result.rows_affected() == 0 {
            return Err(BenchError::BucketNotFound(name.to_string()));
        }
        Ok(())
    }

    fn create_stream(
        &self,
        config: &StreamConfig,
    ) -> Result<StreamInfo> {
        if config.name.is_empty() {
            return Err(BenchError::Validation("stream name cannot be empty".into()));
        }
        if let Some(existing) = self.find_stream(&config.name)? {
            if existing.config == *config {
                return Ok(existing);
            }
            return Err(BenchError::Store(format!("stream '{}' already exists with a different config", config.name)));
        }

        let created = utils::time::now();
        let (sql, values) = SeaQuery::insert()
            .into_table(StreamIden::Table)
            .columns([StreamIden::Name, StreamIden::Description, StreamIden::Subjects, StreamIden::Storage, StreamIden::Replicas, StreamIden::Created])
            .values([
                config.name.clone().into(),
                config.description.clone().into(),
                serde_json::to_string(&config.subjects)?.into(),
                config.storage.as_ref().into(),
                (config.replicas as i64).into(),
                created.timestamp_millis().into(),
            ])
            .map_err(map_db_err)?
            .build_sqlx(PostgresQueryBuilder);

        self.conn.execute(sql.as_str(), values).map_err(|e| BenchError::Store(format!("unable to create stream '{}': {e}", config.name)))?;

        Ok(StreamInfo {
            config: config.clone(),
            created,
        })
    }

    fn delete_stream(
        &self,
        name: &str,
    ) -> Result<()> {
        let Some(stream) = self.find_stream(name)? else {
            return Err(BenchError::Store(format!("stream '{name}' not found")));
        };

        let (sql, values) = SeaQuery::delete().from_table(StreamIden::Table).and_where(SeaExpr::col(StreamIden::Name).eq(name)).build_sqlx(PostgresQueryBuilder);
        let result = self.conn.execute(sql.as_str(), values).map_err(|e| BenchError::Store(format!("unable to delete stream '{name}': {e}")))?;
        if result.rows_affected() == 0 {
            return Err(BenchError::Store(format!("stream '{name}' not found")));
        }

        if !stream.config.subjects.is_empty() {
            let (sql, values) = Self::subject_messages_query(&stream.config.subjects);
            self.conn.execute(sql.as_str(), values).map_err(|e| BenchError::Store(format!("unable to delete messages of stream '{name}': {e}")))?;
        }
        Ok(())
    }

    fn publish(
        &self,
        msg: &Msg,
    ) -> Result<()> {
        if msg.subject.is_empty() {
            return Err(BenchError::Publish("subject cannot be empty".into()));
        }
        let (sql, values) = SeaQuery::insert()
            .into_table(MessageIden::Table)
            .columns([MessageIden::Subject, MessageIden::Headers, MessageIden::Data, MessageIden::Timestamp])
            .values([msg.subject.clone().into(), serde_json::to_string(&msg.headers)?.into(), msg.data.clone().into(), utils::time::time_millis().into()])
            .map_err(map_db_err)?
            .returning_col(MessageIden::Id)
            .build_sqlx(PostgresQueryBuilder);

        let id = self
            .conn
            .query_one(sql.as_str(), values)
            .map(|row| row.get::<i64, _>(0))
            .map_err(|e| BenchError::Publish(format!("unable to publish msg to subj '{}': {e}", msg.subject)))?;

        let (sql, values) = SeaQuery::select()
            .expr(SeaFunc::cust(SeaAlias::new("pg_notify")).arg(SeaExpr::val(msg.subject.as_str())).arg(SeaExpr::val(id.to_string())))
            .build_sqlx(PostgresQueryBuilder);

        self.conn.execute(sql.as_str(), values).map_err(|e| BenchError::Publish(format!("unable to notify subj '{}': {e}", msg.subject)))?;

        if (self.published.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY == 0 {
            match self.prune_messages() {
                Ok(n) => trace!("postgres::prune_messages() removed {}", n),
                Err(e) => warn!("{}", e),
            }
        }
        Ok(())
    }

    fn subscribe(
        &self,
        subject: &str,
        handler: MsgHandler,
    ) -> Result<SubscriptionId> {
        if subject.is_empty() || subject.contains('*') || subject.contains('>') {
            return Err(BenchError::Validation(format!("postgres subscriptions need a literal subject, got '{subject}'")));
        }

        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(Shutdown::new());
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<(), String>>();

        let pool = self.conn.pool().clone();
        let channel = subject.to_string();
        let wait_stop = stop.wait();
        self.conn.runtime().spawn(async move {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            if let Err(e) = listener.listen(&channel).await {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            tokio::pin!(wait_stop);
            loop {
                tokio::select! {
                    _ = &mut wait_stop => break,
                    notification = listener.recv() => {
                        let notification = match notification {
                            Ok(n) => n,
                            Err(e) => {
                                error!("listener on '{}' failed: {}", channel, e);
                                break;
                            }
                        };
                        let Ok(msg_id) = notification.payload().parse::<i64>() else {
                            warn!("ignoring malformed notification on '{}': {}", channel, notification.payload());
                            continue;
                        };

                        let (sql, values) = SeaQuery::select()
                            .from(MessageIden::Table)
                            .columns([MessageIden::Subject, MessageIden::Headers, MessageIden::Data])
                            .and_where(SeaExpr::col(MessageIden::Id).eq(msg_id))
                            .build_sqlx(PostgresQueryBuilder);

                        let row = match sqlx::query_with(&sql, values).fetch_one(&pool).await {
                            Ok(row) => row,
                            Err(e) => {
                                warn!("unable to load msg {} on '{}': {}", msg_id, channel, e);
                                continue;
                            }
                        };
                        let msg = Msg {
                            subject: row.get("subject"),
                            headers: serde_json::from_str(&row.get::<String, _>("headers")).unwrap_or_default(),
                            data: row.get("data"),
                        };
                        (handler)(&msg);
                    }
                }
            }
            debug!("listener on '{}' exiting", channel);
        });

        match self.conn.block_on(ready_rx) {
            Ok(Ok(())) => {
                self.subscriptions.write().unwrap().insert(id, stop);
                Ok(id)
            }
            Ok(Err(e)) => Err(BenchError::Publish(format!("unable to subscribe to subject '{subject}': {e}"))),
            Err(_) => Err(BenchError::Publish(format!("unable to subscribe to subject '{subject}': listener dropped"))),
        }
    }

    fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> Result<()> {
        match self.subscriptions.write().unwrap().remove(&id) {
            Some(stop) => {
                stop.shutdown();
                Ok(())
            }
            None => Err(BenchError::Publish(format!("subscription {id} not found"))),
        }
    }
}
