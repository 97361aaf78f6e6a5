use anyhow::Result;
use chrono::{TimeZone, Utc};
use sqlx::{PgPool, Row};

use stash_db::{Database, IndexError, ObjectOwner, ObjectRecord, ObjectWrite};

async fn register_user(pool: &PgPool, prefix: &str) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(r#"INSERT INTO users ("S3Prefix") VALUES ($1) RETURNING id"#)
        .bind(prefix)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

async fn owner_for_prefix(database: &Database, prefix: &str) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar(r#"SELECT id FROM users WHERE "S3Prefix" = $1"#)
        .bind(prefix)
        .fetch_optional(database.pool())
        .await?;
    Ok(id)
}

async fn fetch_object(database: &Database, user_id: i64, name: &str) -> Result<Option<ObjectRecord>> {
    let row = sqlx::query(
        r#"
        SELECT "userId", name, size, "ACL", authkey, "lastUpdated"
        FROM objects WHERE "userId" = $1 AND name = $2
        "#,
    )
    .bind(user_id)
    .bind(name)
    .fetch_optional(database.pool())
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(ObjectRecord {
        user_id: row.try_get("userId")?,
        name: row.try_get("name")?,
        size: row.try_get("size")?,
        acl: row.try_get("ACL")?,
        auth_key: row.try_get("authkey")?,
        last_updated: row.try_get("lastUpdated")?,
    }))
}

fn at(millis: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
}

#[sqlx::test(migrations = "./migrations")]
async fn authenticated_upsert_overwrites_access_columns(pool: PgPool) -> Result<()> {
    let user_id = register_user(&pool, "prefix-a").await?;
    let database = Database::from_pool(pool);

    let write = ObjectWrite {
        owner: ObjectOwner::User {
            user_id,
            acl: Some("private".into()),
            auth_key: Some("key-1".into()),
        },
        name: "report.pdf".into(),
        size: 1024,
    };
    database.upsert_object(&write, at(1_000)).await?;

    let replaced = ObjectWrite {
        owner: ObjectOwner::User {
            user_id,
            acl: Some("public-read".into()),
            auth_key: None,
        },
        size: 2048,
        ..write
    };
    database.upsert_object(&replaced, at(2_000)).await?;

    let row = fetch_object(&database, user_id, "report.pdf")
        .await?
        .expect("row present");
    assert_eq!(row.size, 2048);
    assert_eq!(row.acl.as_deref(), Some("public-read"));
    assert_eq!(row.auth_key, None);
    assert_eq!(row.last_updated, 2_000);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn prefix_upsert_keeps_stored_acl(pool: PgPool) -> Result<()> {
    let user_id = register_user(&pool, "prefix-b").await?;
    let database = Database::from_pool(pool);
    assert_eq!(owner_for_prefix(&database, "prefix-b").await?, Some(user_id));

    database
        .upsert_object(
            &ObjectWrite {
                owner: ObjectOwner::User {
                    user_id,
                    acl: Some("private".into()),
                    auth_key: Some("secret".into()),
                },
                name: "a.txt".into(),
                size: 1,
            },
            at(10),
        )
        .await?;

    let anonymous = ObjectWrite {
        owner: ObjectOwner::Prefix("prefix-b".into()),
        name: "a.txt".into(),
        size: 5,
    };
    database.upsert_object(&anonymous, at(20)).await?;
    // Same write again must leave the same row behind.
    database.upsert_object(&anonymous, at(20)).await?;

    let row = fetch_object(&database, user_id, "a.txt").await?.expect("row present");
    assert_eq!(row.size, 5);
    assert_eq!(row.acl.as_deref(), Some("private"));
    assert_eq!(row.auth_key.as_deref(), Some("secret"));
    assert_eq!(row.last_updated, 20);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn unknown_prefix_is_reported(pool: PgPool) -> Result<()> {
    let database = Database::from_pool(pool);
    let err = database
        .upsert_object(
            &ObjectWrite {
                owner: ObjectOwner::Prefix("nobody".into()),
                name: "x".into(),
                size: 1,
            },
            at(1),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<IndexError>(),
        Some(&IndexError::UnknownPrefix("nobody".into()))
    );
    assert_eq!(owner_for_prefix(&database, "nobody").await?, None);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn changed_since_is_inclusive_and_ordered(pool: PgPool) -> Result<()> {
    let user_id = register_user(&pool, "prefix-c").await?;
    let database = Database::from_pool(pool);

    for (name, stamp) in [("c", 150), ("b", 100), ("a", 100), ("old", 50)] {
        database
            .upsert_object(
                &ObjectWrite {
                    owner: ObjectOwner::Prefix("prefix-c".into()),
                    name: name.into(),
                    size: 1,
                },
                at(stamp),
            )
            .await?;
    }

    let rows = database.changed_since(100, 101).await?;
    let seen: Vec<_> = rows
        .iter()
        .map(|row| (row.name.as_str(), row.last_updated))
        .collect();
    assert_eq!(seen, vec![("a", 100), ("b", 100), ("c", 150)]);
    assert!(rows.iter().all(|row| row.user_id == user_id));

    let limited = database.changed_since(0, 2).await?;
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].name, "old");
    Ok(())
}
