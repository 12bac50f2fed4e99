use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use ecoindex_types::PendingRecord;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::info;

use super::store::{Membership, RepoStore, merge_batch};
use crate::error::WriteError;

// 21 binds per repository row keeps a chunk well under the 65535 bind limit.
const INSERT_BATCH_SIZE: usize = 500;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, WriteError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), WriteError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!(stage = "startup", event = "db.migrate", result = "ok", "database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl RepoStore for PostgresStore {
    async fn existing_keys(&self, ecosystem: &str) -> Result<HashSet<String>, WriteError> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT lower(r.full_name)
             FROM repositories r
             JOIN repository_ecosystems e ON e.github_id = r.github_id
             WHERE e.ecosystem = $1
             UNION
             SELECT e.listed_as
             FROM repository_ecosystems e
             WHERE e.ecosystem = $1 AND e.listed_as IS NOT NULL",
        )
        .bind(ecosystem)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys.into_iter().collect())
    }

    async fn upsert_batch(&self, batch: &[PendingRecord]) -> Result<(), WriteError> {
        if batch.is_empty() {
            return Ok(());
        }
        let merged = merge_batch(batch);

        let mut tx = self.pool.begin().await?;
        for chunk in merged.records.chunks(INSERT_BATCH_SIZE) {
            upsert_repositories(&mut tx, chunk).await?;
            replace_topics(&mut tx, chunk).await?;
            replace_contributors(&mut tx, chunk).await?;
            replace_languages(&mut tx, chunk).await?;
        }
        // 4 binds per row.
        for chunk in merged.memberships.chunks(INSERT_BATCH_SIZE * 8) {
            upsert_memberships(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn prune_below_stars(&self, ecosystem: &str, min_stars: i64) -> Result<u64, WriteError> {
        let mut tx = self.pool.begin().await?;
        let detached = sqlx::query(
            "DELETE FROM repository_ecosystems e
             USING repositories r
             WHERE e.github_id = r.github_id
               AND e.ecosystem = $1
               AND r.stars < $2",
        )
        .bind(ecosystem)
        .bind(min_stars)
        .execute(tx.as_mut())
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM repositories r
             WHERE NOT EXISTS (
                 SELECT 1 FROM repository_ecosystems e WHERE e.github_id = r.github_id
             )",
        )
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;
        Ok(detached)
    }
}

async fn upsert_repositories(
    tx: &mut Transaction<'_, Postgres>,
    chunk: &[&PendingRecord],
) -> Result<(), WriteError> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO repositories (github_id, owner, name, full_name, description, html_url, \
         homepage, stars, forks, watchers, open_issues, size_kb, default_branch, language, \
         license, archived, fork, private, created_at, updated_at, pushed_at) ",
    );
    qb.push_values(chunk.iter().copied(), |mut b, pending| {
        let r = &pending.record;
        b.push_bind(r.github_id)
            .push_bind(&r.owner)
            .push_bind(&r.name)
            .push_bind(&r.full_name)
            .push_bind(&r.description)
            .push_bind(&r.html_url)
            .push_bind(&r.homepage)
            .push_bind(r.stars)
            .push_bind(r.forks)
            .push_bind(r.watchers)
            .push_bind(r.open_issues)
            .push_bind(r.size_kb)
            .push_bind(&r.default_branch)
            .push_bind(&r.language)
            .push_bind(&r.license)
            .push_bind(r.archived)
            .push_bind(r.fork)
            .push_bind(r.private)
            .push_bind(r.created_at)
            .push_bind(r.updated_at)
            .push_bind(r.pushed_at);
    });
    qb.push(
        " ON CONFLICT (github_id) DO UPDATE SET
            owner = EXCLUDED.owner,
            name = EXCLUDED.name,
            full_name = EXCLUDED.full_name,
            description = EXCLUDED.description,
            html_url = EXCLUDED.html_url,
            homepage = EXCLUDED.homepage,
            stars = EXCLUDED.stars,
            forks = EXCLUDED.forks,
            watchers = EXCLUDED.watchers,
            open_issues = EXCLUDED.open_issues,
            size_kb = EXCLUDED.size_kb,
            default_branch = EXCLUDED.default_branch,
            language = EXCLUDED.language,
            license = EXCLUDED.license,
            archived = EXCLUDED.archived,
            fork = EXCLUDED.fork,
            private = EXCLUDED.private,
            updated_at = EXCLUDED.updated_at,
            pushed_at = EXCLUDED.pushed_at,
            indexed_at = NOW()",
    );

    qb.build().execute(tx.as_mut()).await?;
    Ok(())
}

async fn upsert_memberships(
    tx: &mut Transaction<'_, Postgres>,
    chunk: &[Membership<'_>],
) -> Result<(), WriteError> {
    let mut qb =
        QueryBuilder::new("INSERT INTO repository_ecosystems (github_id, ecosystem, category, listed_as) ");
    qb.push_values(chunk.iter(), |mut b, membership| {
        b.push_bind(membership.github_id)
            .push_bind(membership.ecosystem)
            .push_bind(membership.category)
            .push_bind(membership.listed_as);
    });
    qb.push(
        " ON CONFLICT (github_id, ecosystem) DO UPDATE SET
            category = EXCLUDED.category,
            listed_as = EXCLUDED.listed_as",
    );

    qb.build().execute(tx.as_mut()).await?;
    Ok(())
}

async fn replace_topics(
    tx: &mut Transaction<'_, Postgres>,
    chunk: &[&PendingRecord],
) -> Result<(), WriteError> {
    let ids: Vec<i64> = chunk.iter().map(|p| p.record.github_id).collect();
    sqlx::query("DELETE FROM repository_topics WHERE github_id = ANY($1)")
        .bind(&ids)
        .execute(tx.as_mut())
        .await?;

    let rows: Vec<(i64, &str)> = chunk
        .iter()
        .flat_map(|p| p.record.topics.iter().map(move |t| (p.record.github_id, t.as_str())))
        .collect();
    if rows.is_empty() {
        return Ok(());
    }

    let mut qb = QueryBuilder::new("INSERT INTO repository_topics (github_id, topic) ");
    qb.push_values(rows, |mut b, (id, topic)| {
        b.push_bind(id).push_bind(topic);
    });
    qb.push(" ON CONFLICT (github_id, topic) DO NOTHING");

    qb.build().execute(tx.as_mut()).await?;
    Ok(())
}

/// Only records that carry a fetched list are replaced.
async fn replace_contributors(
    tx: &mut Transaction<'_, Postgres>,
    chunk: &[&PendingRecord],
) -> Result<(), WriteError> {
    let fetched: Vec<&PendingRecord> = chunk
        .iter()
        .copied()
        .filter(|p| p.record.contributors.is_some())
        .collect();
    if fetched.is_empty() {
        return Ok(());
    }

    let ids: Vec<i64> = fetched.iter().map(|p| p.record.github_id).collect();
    sqlx::query("DELETE FROM repository_contributors WHERE github_id = ANY($1)")
        .bind(&ids)
        .execute(tx.as_mut())
        .await?;

    let rows: Vec<_> = fetched
        .iter()
        .flat_map(|p| {
            p.record
                .contributors
                .iter()
                .flatten()
                .map(move |c| (p.record.github_id, c))
        })
        .collect();
    // 6 binds per row.
    for rows in rows.chunks(INSERT_BATCH_SIZE * 4) {
        let mut qb = QueryBuilder::new(
            "INSERT INTO repository_contributors \
             (github_id, login, contributor_id, avatar_url, profile_url, contributions) ",
        );
        qb.push_values(rows.iter(), |mut b, (id, c)| {
            b.push_bind(*id)
                .push_bind(&c.login)
                .push_bind(c.github_id)
                .push_bind(&c.avatar_url)
                .push_bind(&c.profile_url)
                .push_bind(c.contributions);
        });
        qb.push(" ON CONFLICT (github_id, login) DO UPDATE SET contributions = EXCLUDED.contributions");
        qb.build().execute(tx.as_mut()).await?;
    }
    Ok(())
}

async fn replace_languages(
    tx: &mut Transaction<'_, Postgres>,
    chunk: &[&PendingRecord],
) -> Result<(), WriteError> {
    let fetched: Vec<&PendingRecord> = chunk
        .iter()
        .copied()
        .filter(|p| p.record.languages.is_some())
        .collect();
    if fetched.is_empty() {
        return Ok(());
    }

    let ids: Vec<i64> = fetched.iter().map(|p| p.record.github_id).collect();
    sqlx::query("DELETE FROM repository_languages WHERE github_id = ANY($1)")
        .bind(&ids)
        .execute(tx.as_mut())
        .await?;

    let rows: Vec<(i64, &str, i64)> = fetched
        .iter()
        .flat_map(|p| {
            p.record
                .languages
                .iter()
                .flatten()
                .map(move |(language, bytes)| (p.record.github_id, language.as_str(), *bytes))
        })
        .collect();
    // 3 binds per row.
    for rows in rows.chunks(INSERT_BATCH_SIZE * 8) {
        let mut qb = QueryBuilder::new("INSERT INTO repository_languages (github_id, language, bytes) ");
        qb.push_values(rows.iter(), |mut b, (id, language, bytes)| {
            b.push_bind(*id).push_bind(*language).push_bind(*bytes);
        });
        qb.build().execute(tx.as_mut()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};
    use ecoindex_types::Contributor;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::{record, test_database};

    async fn reset(store: &PostgresStore, ids: &[i64]) {
        sqlx::query("DELETE FROM repositories WHERE github_id = ANY($1)")
            .bind(ids)
            .execute(store.pool())
            .await
            .expect("clear rows");
    }

    fn contributor(login: &str, contributions: i64) -> Contributor {
        Contributor {
            login: login.to_string(),
            github_id: None,
            avatar_url: None,
            profile_url: None,
            contributions,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_created_at_and_replaces_dependent_rows() {
        let Some(store) = test_database().await else {
            return;
        };
        let id = 910_001;
        reset(&store, &[id]).await;

        let mut first = PendingRecord::new(record(id, "pg/replace", 1), "pg-eco", "defi");
        first.record.topics = vec!["a".to_string(), "b".to_string()];
        first.record.contributors = Some(vec![contributor("alice", 3), contributor("bob", 1)]);
        first.record.languages = Some(BTreeMap::from([("Rust".to_string(), 10), ("Go".to_string(), 5)]));
        store.upsert_batch(&[first.clone()]).await.expect("first");

        let mut second = PendingRecord::new(record(id, "pg/replace", 7), "pg-eco", "defi");
        second.record.created_at = None;
        second.record.topics = vec!["b".to_string()];
        second.record.contributors = None;
        second.record.languages = Some(BTreeMap::from([("Rust".to_string(), 20)]));
        store.upsert_batch(&[second]).await.expect("second");

        let (stars, created_at): (i64, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT stars, created_at FROM repositories WHERE github_id = $1")
                .bind(id)
                .fetch_one(store.pool())
                .await
                .expect("row");
        assert_eq!(stars, 7);
        assert_eq!(created_at, first.record.created_at);

        let topics: Vec<String> =
            sqlx::query_scalar("SELECT topic FROM repository_topics WHERE github_id = $1 ORDER BY topic")
                .bind(id)
                .fetch_all(store.pool())
                .await
                .expect("topics");
        assert_eq!(topics, vec!["b".to_string()]);

        let logins: Vec<String> = sqlx::query_scalar(
            "SELECT login FROM repository_contributors WHERE github_id = $1 ORDER BY login",
        )
        .bind(id)
        .fetch_all(store.pool())
        .await
        .expect("contributors");
        assert_eq!(logins, vec!["alice".to_string(), "bob".to_string()]);

        let languages: Vec<(String, i64)> = sqlx::query_as(
            "SELECT language, bytes FROM repository_languages WHERE github_id = $1 ORDER BY language",
        )
        .bind(id)
        .fetch_all(store.pool())
        .await
        .expect("languages");
        assert_eq!(languages, vec![("Rust".to_string(), 20)]);
    }

    #[tokio::test]
    async fn one_batch_writes_every_membership_and_alias() {
        let Some(store) = test_database().await else {
            return;
        };
        let id = 910_002;
        reset(&store, &[id]).await;

        store
            .upsert_batch(&[
                PendingRecord::new(record(id, "pg/renamed", 1), "pg-alpha", "defi")
                    .with_source_key("pg/original"),
                PendingRecord::new(record(id, "pg/renamed", 1), "pg-beta", "infra"),
            ])
            .await
            .expect("upsert");

        let memberships: Vec<(String, String)> = sqlx::query_as(
            "SELECT ecosystem, category FROM repository_ecosystems WHERE github_id = $1 ORDER BY ecosystem",
        )
        .bind(id)
        .fetch_all(store.pool())
        .await
        .expect("memberships");
        assert_eq!(
            memberships,
            vec![
                ("pg-alpha".to_string(), "defi".to_string()),
                ("pg-beta".to_string(), "infra".to_string()),
            ]
        );

        let alpha = store.existing_keys("pg-alpha").await.expect("keys");
        assert!(alpha.contains("pg/renamed"));
        assert!(alpha.contains("pg/original"));
        let beta = store.existing_keys("pg-beta").await.expect("keys");
        assert!(!beta.contains("pg/original"));

        let detached = store.prune_below_stars("pg-alpha", 10).await.expect("prune");
        assert_eq!(detached, 1);
        assert!(store.existing_keys("pg-beta").await.expect("keys").contains("pg/renamed"));
    }
}
