use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use upsell_core::domain::action::{Action, ActionGroup, ActionSource, CouponRef, ResultOrder};
use upsell_core::domain::item::ItemId;
use upsell_core::domain::rule::{
    Condition, ConditionAttribute, ConditionGroup, ConditionOperator, Exclusions, NewRule, Rule,
    RuleId, RuleStatus,
};

use super::{Page, RepositoryError, RuleFilter, RuleRepository};
use crate::DbPool;

const RULE_COLUMNS: &str = "id, name, priority, status, starts_at, ends_at, \
                            exclude_out_of_stock, created_at, updated_at";

pub struct SqlRuleRepository {
    pool: DbPool,
}

impl SqlRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RuleRepository for SqlRuleRepository {
    async fn create(&self, rule: NewRule) -> Result<Rule, RepositoryError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO upsell_rule (
                name,
                priority,
                status,
                starts_at,
                ends_at,
                exclude_out_of_stock,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.status.as_str())
        .bind(rule.starts_at.map(|value| value.to_rfc3339()))
        .bind(rule.ends_at.map(|value| value.to_rfc3339()))
        .bind(rule.exclude_out_of_stock)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Rule {
            id: RuleId(result.last_insert_rowid()),
            name: rule.name,
            priority: rule.priority,
            status: rule.status,
            starts_at: rule.starts_at,
            ends_at: rule.ends_at,
            exclude_out_of_stock: rule.exclude_out_of_stock,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, id: RuleId, rule: NewRule) -> Result<Rule, RepositoryError> {
        let result = sqlx::query(
            "UPDATE upsell_rule SET
                name = ?,
                priority = ?,
                status = ?,
                starts_at = ?,
                ends_at = ?,
                exclude_out_of_stock = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.status.as_str())
        .bind(rule.starts_at.map(|value| value.to_rfc3339()))
        .bind(rule.ends_at.map(|value| value.to_rfc3339()))
        .bind(rule.exclude_out_of_stock)
        .bind(Utc::now().to_rfc3339())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("rule {id}")));
        }

        self.find_by_id(id).await?.ok_or_else(|| RepositoryError::NotFound(format!("rule {id}")))
    }

    async fn delete(&self, id: RuleId) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM upsell_rule WHERE id = ?").bind(id.0).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: RuleId) -> Result<Option<Rule>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM upsell_rule WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(rule_from_row).transpose()
    }

    async fn find_by_ids(&self, ids: &[RuleId]) -> Result<Vec<Rule>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM upsell_rule WHERE id IN ({}) ORDER BY priority ASC, id ASC",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.0);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(rule_from_row).collect()
    }

    async fn save_condition_groups(
        &self,
        id: RuleId,
        groups: &[ConditionGroup],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        ensure_exists(&mut *tx, id).await?;

        sqlx::query("DELETE FROM upsell_rule_condition WHERE rule_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        for group in groups {
            for (position, condition) in group.conditions.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO upsell_rule_condition (
                        rule_id,
                        group_id,
                        position,
                        attribute,
                        operator,
                        value,
                        include_children,
                        min_quantity,
                        exclusions_json
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(id.0)
                .bind(i64::from(group.group_id))
                .bind(position as i64)
                .bind(condition.attribute.as_str())
                .bind(condition.operator.as_str())
                .bind(&condition.value)
                .bind(condition.include_children)
                .bind(i64::from(condition.min_quantity.max(1)))
                .bind(encode_json("exclusions_json", &condition.exclusions)?)
                .execute(&mut *tx)
                .await?;
            }
        }

        touch(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_action_groups(
        &self,
        id: RuleId,
        groups: &[ActionGroup],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        ensure_exists(&mut *tx, id).await?;

        sqlx::query("DELETE FROM upsell_rule_action WHERE rule_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        for group in groups {
            for (position, action) in group.actions.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO upsell_rule_action (
                        rule_id,
                        group_id,
                        position,
                        source,
                        value,
                        item_ids_json,
                        result_limit,
                        sort_order,
                        include_children,
                        coupon_code,
                        coupon_message,
                        exclusions_json
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(id.0)
                .bind(i64::from(group.group_id))
                .bind(position as i64)
                .bind(action.source.as_str())
                .bind(&action.value)
                .bind(encode_json("item_ids_json", &action.item_ids)?)
                .bind(i64::from(action.limit))
                .bind(action.order.as_str())
                .bind(action.include_children)
                .bind(action.coupon.as_ref().map(|coupon| coupon.code.as_str()))
                .bind(action.coupon.as_ref().and_then(|coupon| coupon.message.as_deref()))
                .bind(encode_json("exclusions_json", &action.exclusions)?)
                .execute(&mut *tx)
                .await?;
            }
        }

        touch(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn condition_groups(&self, id: RuleId) -> Result<Vec<ConditionGroup>, RepositoryError> {
        Ok(self.condition_groups_for(&[id]).await?.remove(&id).unwrap_or_default())
    }

    async fn condition_groups_for(
        &self,
        ids: &[RuleId],
    ) -> Result<HashMap<RuleId, Vec<ConditionGroup>>, RepositoryError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            "SELECT
                rule_id,
                group_id,
                attribute,
                operator,
                value,
                include_children,
                min_quantity,
                exclusions_json
             FROM upsell_rule_condition
             WHERE rule_id IN ({})
             ORDER BY rule_id ASC, group_id ASC, position ASC",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.0);
        }

        let mut grouped: HashMap<RuleId, Vec<ConditionGroup>> = HashMap::new();
        for row in query.fetch_all(&self.pool).await? {
            let rule_id = RuleId(row.try_get("rule_id")?);
            let group_id = parse_u32("group_id", row.try_get("group_id")?)?;
            let condition = condition_from_row(&row)?;

            let groups = grouped.entry(rule_id).or_default();
            match groups.last_mut() {
                Some(group) if group.group_id == group_id => group.conditions.push(condition),
                _ => groups.push(ConditionGroup::new(group_id, vec![condition])),
            }
        }

        Ok(grouped)
    }

    async fn action_groups(&self, id: RuleId) -> Result<Vec<ActionGroup>, RepositoryError> {
        Ok(self.action_groups_for(&[id]).await?.remove(&id).unwrap_or_default())
    }

    async fn action_groups_for(
        &self,
        ids: &[RuleId],
    ) -> Result<HashMap<RuleId, Vec<ActionGroup>>, RepositoryError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            "SELECT
                rule_id,
                group_id,
                source,
                value,
                item_ids_json,
                result_limit,
                sort_order,
                include_children,
                coupon_code,
                coupon_message,
                exclusions_json
             FROM upsell_rule_action
             WHERE rule_id IN ({})
             ORDER BY rule_id ASC, group_id ASC, position ASC",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.0);
        }

        let mut grouped: HashMap<RuleId, Vec<ActionGroup>> = HashMap::new();
        for row in query.fetch_all(&self.pool).await? {
            let rule_id = RuleId(row.try_get("rule_id")?);
            let group_id = parse_u32("group_id", row.try_get("group_id")?)?;
            let action = action_from_row(&row)?;

            let groups = grouped.entry(rule_id).or_default();
            match groups.last_mut() {
                Some(group) if group.group_id == group_id => group.actions.push(action),
                _ => groups.push(ActionGroup::new(group_id, vec![action])),
            }
        }

        Ok(grouped)
    }

    async fn list(&self, filter: &RuleFilter, page: Page) -> Result<Vec<Rule>, RepositoryError> {
        let (clause, binds) = filter_clause(filter);
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM upsell_rule{clause}
             ORDER BY priority ASC, id ASC
             LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(value);
        }

        let rows = query
            .bind(i64::from(page.limit))
            .bind(i64::from(page.offset))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(rule_from_row).collect()
    }

    async fn count(&self, filter: &RuleFilter) -> Result<u64, RepositoryError> {
        let (clause, binds) = filter_clause(filter);
        let sql = format!("SELECT COUNT(*) AS count FROM upsell_rule{clause}");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(value);
        }

        let count: i64 = query.fetch_one(&self.pool).await?.try_get("count")?;
        u64::try_from(count)
            .map_err(|_| RepositoryError::Decode(format!("negative rule count: {count}")))
    }

    async fn list_active_ids(&self) -> Result<Vec<RuleId>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id FROM upsell_rule WHERE status = 'active' ORDER BY priority ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RuleId, RepositoryError> { Ok(RuleId(row.try_get("id")?)) })
            .collect()
    }

    async fn list_coupon_rules(&self) -> Result<Vec<Rule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM upsell_rule
             WHERE status = 'active'
               AND EXISTS (
                   SELECT 1 FROM upsell_rule_action
                   WHERE upsell_rule_action.rule_id = upsell_rule.id
                     AND upsell_rule_action.source = 'apply_coupon'
               )
             ORDER BY priority ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(rule_from_row).collect()
    }
}

async fn ensure_exists(
    conn: &mut sqlx::SqliteConnection,
    id: RuleId,
) -> Result<(), RepositoryError> {
    let found = sqlx::query("SELECT 1 FROM upsell_rule WHERE id = ?")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(RepositoryError::NotFound(format!("rule {id}"))),
    }
}

async fn touch(conn: &mut sqlx::SqliteConnection, id: RuleId) -> Result<(), RepositoryError> {
    sqlx::query("UPDATE upsell_rule SET updated_at = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(id.0)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn filter_clause(filter: &RuleFilter) -> (String, Vec<String>) {
    let mut predicates = Vec::new();
    let mut binds = Vec::new();

    if let Some(status) = filter.status {
        predicates.push("status = ?");
        binds.push(status.as_str().to_string());
    }
    if let Some(needle) = filter.name_contains.as_deref().map(str::trim) {
        if !needle.is_empty() {
            predicates.push("LOWER(name) LIKE ?");
            binds.push(format!("%{}%", needle.to_ascii_lowercase()));
        }
    }

    if predicates.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", predicates.join(" AND ")), binds)
    }
}

fn rule_from_row(row: SqliteRow) -> Result<Rule, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = status_raw
        .parse::<RuleStatus>()
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(Rule {
        id: RuleId(row.try_get("id")?),
        name: row.try_get("name")?,
        priority: row.try_get("priority")?,
        status,
        starts_at: parse_optional_timestamp("starts_at", row.try_get("starts_at")?)?,
        ends_at: parse_optional_timestamp("ends_at", row.try_get("ends_at")?)?,
        exclude_out_of_stock: row.try_get("exclude_out_of_stock")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn condition_from_row(row: &SqliteRow) -> Result<Condition, RepositoryError> {
    let attribute = row
        .try_get::<String, _>("attribute")?
        .parse::<ConditionAttribute>()
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let operator = row
        .try_get::<String, _>("operator")?
        .parse::<ConditionOperator>()
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(Condition {
        attribute,
        operator,
        value: row.try_get("value")?,
        include_children: row.try_get("include_children")?,
        min_quantity: parse_u32("min_quantity", row.try_get("min_quantity")?)?.max(1),
        exclusions: decode_json::<Exclusions>("exclusions_json", row.try_get("exclusions_json")?)?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<Action, RepositoryError> {
    let source = row
        .try_get::<String, _>("source")?
        .parse::<ActionSource>()
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let order = row
        .try_get::<String, _>("sort_order")?
        .parse::<ResultOrder>()
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let coupon = row
        .try_get::<Option<String>, _>("coupon_code")?
        .map(|code| -> Result<CouponRef, RepositoryError> {
            Ok(CouponRef { code, message: row.try_get("coupon_message")? })
        })
        .transpose()?;

    Ok(Action {
        source,
        value: row.try_get("value")?,
        item_ids: decode_json::<Vec<ItemId>>("item_ids_json", row.try_get("item_ids_json")?)?,
        limit: parse_u32("result_limit", row.try_get("result_limit")?)?,
        order,
        include_children: row.try_get("include_children")?,
        coupon,
        exclusions: decode_json::<Exclusions>("exclusions_json", row.try_get("exclusions_json")?)?,
    })
}

fn encode_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode `{column}`: {error}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: String,
) -> Result<T, RepositoryError> {
    serde_json::from_str(&raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid json in `{column}`: `{raw}` ({error})"))
    })
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
