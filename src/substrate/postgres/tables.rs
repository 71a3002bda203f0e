use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Iden, Index, PostgresQueryBuilder, Table};

#[derive(Iden)]
#[iden = "fleetbench_buckets"]
pub enum BucketIden {
    Table,

    Name,
    Description,
    TtlMs,
}

#[derive(Iden)]
#[iden = "fleetbench_entries"]
pub enum EntryIden {
    Table,

    Bucket,
    Key,
    Value,
    ExpiresAt,
}

#[derive(Iden)]
#[iden = "fleetbench_streams"]
pub enum StreamIden {
    Table,

    Name,
    Description,
    Subjects,
    Storage,
    Replicas,
    Created,
}

#[derive(Iden)]
#[iden = "fleetbench_messages"]
pub enum MessageIden {
    Table,

    Id,
    Subject,
    Headers,
    Data,
    Timestamp,
}

/// DDL for every substrate table, safe to run repeatedly.
pub fn schema() -> Vec<String> {
    vec![
        Table::create()
            .table(BucketIden::Table)
            .if_not_exists()
            .col(ColumnDef::new(BucketIden::Name).string().not_null().primary_key())
            .col(ColumnDef::new(BucketIden::Description).string().not_null().default(""))
            .col(ColumnDef::new(BucketIden::TtlMs).big_integer())
            .build(PostgresQueryBuilder),
        Table::create()
            .table(EntryIden::Table)
            .if_not_exists()
            .col(ColumnDef::new(EntryIden::Bucket).string().not_null())
            .col(ColumnDef::new(EntryIden::Key).string().not_null())
            .col(ColumnDef::new(EntryIden::Value).blob().not_null())
            .col(ColumnDef::new(EntryIden::ExpiresAt).big_integer())
            .primary_key(Index::create().col(EntryIden::Bucket).col(EntryIden::Key))
            .foreign_key(
                ForeignKey::create()
                    .name("fk_fleetbench_entries_bucket")
                    .from(EntryIden::Table, EntryIden::Bucket)
                    .to(BucketIden::Table, BucketIden::Name)
                    .on_delete(ForeignKeyAction::Cascade),
            )
            .build(PostgresQueryBuilder),
        Table::create()
            .table(StreamIden::Table)
            .if_not_exists()
            .col(ColumnDef::new(StreamIden::Name).string().not_null().primary_key())
            .col(ColumnDef::new(StreamIden::Description).string().not_null().default(""))
            .col(ColumnDef::new(StreamIden::Subjects).text().not_null())
            .col(ColumnDef::new(StreamIden::Storage).string().not_null())
            .col(ColumnDef::new(StreamIden::Replicas).big_integer().not_null())
            .col(ColumnDef::new(StreamIden::Created).big_integer().not_null())
            .build(PostgresQueryBuilder),
        Table::create()
            .table(MessageIden::Table)
            .if_not_exists()
            .col(ColumnDef::new(MessageIden::Id).big_integer().not_null().auto_increment().primary_key())
            .col(ColumnDef::new(MessageIden::Subject).string().not_null())
            .col(ColumnDef::new(MessageIden::Headers).text().not_null())
            .col(ColumnDef::new(MessageIden::Data).blob().not_null())
            .col(ColumnDef::new(MessageIden::Timestamp).big_integer().not_null())
            .build(PostgresQueryBuilder),
        Index::create()
            .name("idx_fleetbench_entries_expires_at")
            .if_not_exists()
            .table(EntryIden::Table)
            .col(EntryIden::ExpiresAt)
            .build(PostgresQueryBuilder),
        Index::create()
            .name("idx_fleetbench_messages_subject")
            .if_not_exists()
            .table(MessageIden::Table)
            .col(MessageIden::Subject)
            .build(PostgresQueryBuilder),
        Index::create()
            .name("idx_fleetbench_messages_timestamp")
            .if_not_exists()
            .table(MessageIden::Table)
            .col(MessageIden::Timestamp)
            .build(PostgresQueryBuilder),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_tables() {
        let ddl = schema().join("\n");
        assert!(ddl.contains("\"fleetbench_buckets\""));
        assert!(ddl.contains("\"fleetbench_entries\""));
        assert!(ddl.contains("\"fleetbench_streams\""));
        assert!(ddl.contains("\"fleetbench_messages\""));
        assert!(ddl.contains("\"expires_at\""));
    }

    #[test]
    fn test_entries_cascade_with_bucket() {
        let entries = &schema()[1];
        assert!(entries.contains("FOREIGN KEY (\"bucket\") REFERENCES \"fleetbench_buckets\" (\"name\")"));
        assert!(entries.contains("ON DELETE CASCADE"));
    }
}
