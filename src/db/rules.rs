//! Rules store on Postgres.

use super::Db;
use crate::error::{Error, Result};
use crate::model::{Channel, Rule, RuleId, RuleSpec, Severity};
use crate::store::RuleStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

const RULE_COLUMNS: &str =
    "rule_id, name, enabled, codes, severities, channels, recipients, create_time, last_modified_time";

#[async_trait]
impl RuleStore for Db {
    async fn create_rule(&self, spec: RuleSpec) -> Result<Rule> {
        let id = RuleId::new();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO nc_rules (rule_id, name, enabled, codes, severities, channels, recipients, create_time, last_modified_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)",
        )
        .bind(id.0)
        .bind(&spec.name)
        .bind(spec.enabled)
        .bind(&spec.codes)
        .bind(severity_names(&spec.severities))
        .bind(channel_names(&spec.channels))
        .bind(&spec.recipients)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_rule(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("rule {id}")))
    }

    async fn list_rules(&self, enabled: Option<bool>) -> Result<Vec<Rule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM nc_rules
             WHERE $1::BOOLEAN IS NULL OR enabled = $1
             ORDER BY create_time, rule_id"
        ))
        .bind(enabled)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RuleRow::try_into_rule).collect()
    }

    async fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        let row: Option<RuleRow> =
            sqlx::query_as(&format!("SELECT {RULE_COLUMNS} FROM nc_rules WHERE rule_id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(RuleRow::try_into_rule).transpose()
    }

    async fn update_rule(&self, id: RuleId, spec: RuleSpec) -> Result<Rule> {
        let rows_affected = sqlx::query(
            "UPDATE nc_rules SET name = $1, enabled = $2, codes = $3, severities = $4, channels = $5, recipients = $6, last_modified_time = now()
             WHERE rule_id = $7",
        )
        .bind(&spec.name)
        .bind(spec.enabled)
        .bind(&spec.codes)
        .bind(severity_names(&spec.severities))
        .bind(channel_names(&spec.channels))
        .bind(&spec.recipients)
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("rule {id}")));
        }
        self.get_rule(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("rule {id}")))
    }

    async fn delete_rule(&self, id: RuleId) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM nc_rules WHERE rule_id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }
}

fn severity_names(severities: &[Severity]) -> Vec<String> {
    severities.iter().map(|s| s.as_str().to_string()).collect()
}

fn channel_names(channels: &[Channel]) -> Vec<String> {
    channels.iter().map(|c| c.as_str().to_string()).collect()
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RuleRow {
    rule_id: Uuid,
    name: String,
    enabled: bool,
    codes: Vec<String>,
    severities: Vec<String>,
    channels: Vec<String>,
    recipients: Vec<String>,
    create_time: DateTime<Utc>,
    last_modified_time: DateTime<Utc>,
}

impl RuleRow {
    fn try_into_rule(self) -> Result<Rule> {
        let severities = self
            .severities
            .iter()
            .map(|s| s.parse::<Severity>().map_err(Error::Other))
            .collect::<Result<Vec<_>>>()?;
        let channels = self
            .channels
            .iter()
            .map(|c| c.parse::<Channel>().map_err(Error::Other))
            .collect::<Result<Vec<_>>>()?;

        Ok(Rule {
            rule_id: RuleId(self.rule_id),
            spec: RuleSpec {
                name: self.name,
                enabled: self.enabled,
                codes: self.codes,
                severities,
                channels,
                recipients: self.recipients,
            },
            create_time: self.create_time.timestamp(),
            last_modified_time: self.last_modified_time.timestamp(),
        })
    }
}
