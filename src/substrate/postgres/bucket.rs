use std::{sync::Arc, time::Duration};

use sea_query::{Cond, Expr as SeaExpr, Func as SeaFunc, OnConflict, Order as SeaOrder, PostgresQueryBuilder, Query as SeaQuery};
use sea_query_binder::{SqlxBinder, SqlxValues};
use sqlx::Row;

use crate::{
    BenchError, Result,
    substrate::{KeyValue, map_db_err},
    utils,
};

use super::{
    synclient::SynClient,
    tables::{BucketIden, EntryIden},
};

/// Handle on one row of `fleetbench_buckets` and its entries.
#[derive(Debug, Clone)]
pub struct PgBucket {
    name: String,
    ttl: Option<Duration>,
    conn: Arc<SynClient>,
}

impl PgBucket {
    pub fn new(
        name: &str,
        ttl: Option<Duration>,
        conn: &Arc<SynClient>,
    ) -> Self {
        Self {
            name: name.to_string(),
            ttl,
            conn: conn.clone(),
        }
    }

    fn exists(&self) -> Result<bool> {
        let (sql, values) = SeaQuery::select()
            .from(BucketIden::Table)
            .expr(SeaFunc::count(SeaExpr::col(BucketIden::Name)))
            .and_where(SeaExpr::col(BucketIden::Name).eq(self.name.as_str()))
            .build_sqlx(PostgresQueryBuilder);

        let count = self.conn.query_one(sql.as_str(), values).map(|row| row.get::<i64, usize>(0)).map_err(map_db_err)?;
        Ok(count > 0)
    }

    fn check(&self) -> Result<()> {
        if !self.exists()? {
            return Err(BenchError::BucketNotFound(self.name.clone()));
        }
        Ok(())
    }

    /// Rows that are either permanent or not yet expired.
    fn live(now: i64) -> Cond {
        Cond::any().add(SeaExpr::col(EntryIden::ExpiresAt).is_null()).add(SeaExpr::col(EntryIden::ExpiresAt).gt(now))
    }

    /// Upserts one entry only while its bucket row exists, as a single
    /// `INSERT .. SELECT .. FROM fleetbench_buckets`. No bucket means no row.
    fn upsert_query(
        bucket: &str,
        key: &str,
        value: &[u8],
        expires_at: Option<i64>,
    ) -> Result<(String, SqlxValues)> {
        let source = SeaQuery::select()
            .exprs([SeaExpr::val(bucket), SeaExpr::val(key), SeaExpr::val(value.to_vec()), SeaExpr::val(expires_at)])
            .from(BucketIden::Table)
            .and_where(SeaExpr::col(BucketIden::Name).eq(bucket))
            .to_owned();

        Ok(SeaQuery::insert()
            .into_table(EntryIden::Table)
            .columns([EntryIden::Bucket, EntryIden::Key, EntryIden::Value, EntryIden::ExpiresAt])
            .select_from(source)
            .map_err(map_db_err)?
            .on_conflict(OnConflict::columns([EntryIden::Bucket, EntryIden::Key]).update_columns([EntryIden::Value, EntryIden::ExpiresAt]).to_owned())
            .build_sqlx(PostgresQueryBuilder))
    }

    fn purge_expired(
        &self,
        now: i64,
    ) -> Result<()> {
        let (sql, values) = SeaQuery::delete()
            .from_table(EntryIden::Table)
            .and_where(SeaExpr::col(EntryIden::Bucket).eq(self.name.as_str()))
            .and_where(SeaExpr::col(EntryIden::ExpiresAt).lte(now))
            .build_sqlx(PostgresQueryBuilder);

        self.conn.execute(sql.as_str(), values).map_err(map_db_err)?;
        Ok(())
    }
}

impl KeyValue for PgBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(
        &self,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let now = utils::time::time_millis();
        let expires_at: Option<i64> = self.ttl.map(|ttl| now + ttl.as_millis() as i64);
        let (sql, values) = Self::upsert_query(&self.name, key, value, expires_at)?;

        let result = self.conn.execute(sql.as_str(), values).map_err(|e| BenchError::Store(format!("unable to put key '{key}' in bucket '{}': {e}", self.name)))?;
        if result.rows_affected() == 0 {
            return Err(BenchError::BucketNotFound(self.name.clone()));
        }
        self.purge_expired(now)
    }

    fn get(
        &self,
        key: &str,
    ) -> Result<Vec<u8>> {
        self.check()?;
        let (sql, values) = SeaQuery::select()
            .from(EntryIden::Table)
            .column(EntryIden::Value)
            .and_where(SeaExpr::col(EntryIden::Bucket).eq(self.name.as_str()))
            .and_where(SeaExpr::col(EntryIden::Key).eq(key))
            .cond_where(Self::live(utils::time::time_millis()))
            .build_sqlx(PostgresQueryBuilder);

        match self.conn.query_optional(sql.as_str(), values).map_err(map_db_err)? {
            Some(row) => Ok(row.get::<Vec<u8>, _>(0)),
            None => Err(BenchError::KeyNotFound {
                bucket: self.name.clone(),
                key: key.to_string(),
            }),
        }
    }

    fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        self.check()?;
        let (sql, values) = SeaQuery::delete()
            .from_table(EntryIden::Table)
            .and_where(SeaExpr::col(EntryIden::Bucket).eq(self.name.as_str()))
            .and_where(SeaExpr::col(EntryIden::Key).eq(key))
            .build_sqlx(PostgresQueryBuilder);

        self.conn.execute(sql.as_str(), values).map_err(|e| BenchError::Store(format!("unable to delete key '{key}' from bucket '{}': {e}", self.name)))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.check()?;
        let (sql, values) = SeaQuery::select()
            .from(EntryIden::Table)
            .column(EntryIden::Key)
            .and_where(SeaExpr::col(EntryIden::Bucket).eq(self.name.as_str()))
            .cond_where(Self::live(utils::time::time_millis()))
            .order_by(EntryIden::Key, SeaOrder::Asc)
            .build_sqlx(PostgresQueryBuilder);

        let rows = self.conn.query(sql.as_str(), values).map_err(|e| BenchError::Store(format!("unable to list keys of bucket '{}': {e}", self.name)))?;
        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_is_conditional_on_bucket() {
        let (sql, _) = PgBucket::upsert_query("fleetbench-heartbeat", "n1", b"alive", Some(5000)).unwrap();
        assert!(sql.starts_with("INSERT INTO \"fleetbench_entries\""));
        assert!(sql.contains("SELECT"));
        assert!(sql.contains("FROM \"fleetbench_buckets\""));
        assert!(sql.contains("WHERE \"name\" = $5"));
        assert!(sql.contains("ON CONFLICT (\"bucket\", \"key\") DO UPDATE"));
        assert!(!sql.contains("VALUES"));
    }
}
