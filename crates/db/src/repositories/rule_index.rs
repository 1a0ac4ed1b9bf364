use sqlx::{sqlite::SqliteRow, Row};

use upsell_core::domain::rule::RuleId;
use upsell_core::indexing::{IndexCandidate, IndexEntry};
use upsell_core::keys::ConditionKey;

use super::{RepositoryError, RuleIndexRepository};
use crate::DbPool;

pub struct SqlRuleIndexRepository {
    pool: DbPool,
}

impl SqlRuleIndexRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RuleIndexRepository for SqlRuleIndexRepository {
    async fn delete_for_rule(&self, rule_id: RuleId) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM upsell_rule_index WHERE rule_id = ?")
            .bind(rule_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_entries(&self, entries: &[IndexEntry]) -> Result<u64, RepositoryError> {
        let mut inserted = 0;
        for entry in entries {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO upsell_rule_index (condition_key, rule_id, priority)
                 VALUES (?, ?, ?)",
            )
            .bind(entry.condition_key.as_str())
            .bind(entry.rule_id.0)
            .bind(entry.priority)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn truncate(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM upsell_rule_index").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn candidates(
        &self,
        keys: &[ConditionKey],
    ) -> Result<Vec<IndexCandidate>, RepositoryError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT rule_id, MIN(priority) AS priority
             FROM upsell_rule_index
             WHERE condition_key IN ({})
             GROUP BY rule_id
             ORDER BY priority ASC, rule_id ASC",
            vec!["?"; keys.len()].join(", ")
        );
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<IndexCandidate, RepositoryError> {
                Ok(IndexCandidate {
                    priority: row.try_get("priority")?,
                    rule_id: RuleId(row.try_get("rule_id")?),
                })
            })
            .collect()
    }

    async fn entries_for_rule(&self, rule_id: RuleId) -> Result<Vec<IndexEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT condition_key, rule_id, priority
             FROM upsell_rule_index
             WHERE rule_id = ?
             ORDER BY condition_key ASC",
        )
        .bind(rule_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: SqliteRow) -> Result<IndexEntry, RepositoryError> {
    let raw_key = row.try_get::<String, _>("condition_key")?;
    let condition_key = ConditionKey::from_stored(&raw_key)
        .ok_or_else(|| RepositoryError::Decode(format!("invalid condition key `{raw_key}`")))?;

    Ok(IndexEntry {
        condition_key,
        rule_id: RuleId(row.try_get("rule_id")?),
        priority: row.try_get("priority")?,
    })
}
