use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use nsmr_core::domain::identity::Principal;
use nsmr_core::domain::level::ApprovalLevel;
use nsmr_core::domain::request::{
    ApprovalRecord, DecisionStatus, ManufacturingRequest, RequestId, RequestStatus,
};
use nsmr_core::flows::TransitionOutcome;

use super::{format_timestamp, parse_level, parse_timestamp, RepositoryError, RequestRepository};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "r.id, r.status, r.creator, r.content, r.current_approval_level,
     r.version, r.created_at, r.updated_at,
     a.level AS record_level, a.status AS record_status, a.comment AS record_comment,
     a.approver AS record_approver, a.decided_at AS record_decided_at";

pub struct SqlRequestRepository {
    pool: DbPool,
}

impl SqlRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(
        &self,
        filter: &str,
        bind: Vec<QueryArg<'_>>,
    ) -> Result<Vec<ManufacturingRequest>, RepositoryError> {
        fetch_requests(&self.pool, filter, bind).await
    }
}

async fn fetch_requests<'e, E>(
    executor: E,
    filter: &str,
    bind: Vec<QueryArg<'_>>,
) -> Result<Vec<ManufacturingRequest>, RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let sql = format!(
        "SELECT {REQUEST_COLUMNS}
         FROM manufacturing_request r
         LEFT JOIN approval_record a ON a.request_id = r.id
         {filter}
         ORDER BY r.created_at ASC, r.id ASC, a.level ASC"
    );

    let mut query = sqlx::query(&sql);
    for arg in bind {
        query = match arg {
            QueryArg::Text(value) => query.bind(value),
            QueryArg::Int(value) => query.bind(value),
        };
    }

    let rows = query.fetch_all(executor).await?;
    fold_rows(&rows)
}

enum QueryArg<'a> {
    Text(&'a str),
    Int(i64),
}

fn decode<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn parse_status(raw: &str) -> Result<RequestStatus, RepositoryError> {
    RequestStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request status `{raw}`")))
}

fn parse_decision_status(raw: &str) -> Result<DecisionStatus, RepositoryError> {
    DecisionStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown decision status `{raw}`")))
}

fn parse_version(raw: i64) -> Result<u32, RepositoryError> {
    u32::try_from(raw).map_err(|_| RepositoryError::Decode(format!("invalid version `{raw}`")))
}

fn row_to_request(row: &SqliteRow) -> Result<ManufacturingRequest, RepositoryError> {
    let id: String = decode(row, "id")?;
    let status: String = decode(row, "status")?;
    let creator: String = decode(row, "creator")?;
    let content: String = decode(row, "content")?;
    let level: i64 = decode(row, "current_approval_level")?;
    let version: i64 = decode(row, "version")?;
    let created_at: String = decode(row, "created_at")?;
    let updated_at: String = decode(row, "updated_at")?;

    Ok(ManufacturingRequest {
        id: RequestId(id),
        status: parse_status(&status)?,
        creator: Principal(creator),
        content,
        current_approval_level: parse_level("current_approval_level", level)?,
        approval_records: Vec::new(),
        version: parse_version(version)?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn row_to_record(row: &SqliteRow) -> Result<Option<ApprovalRecord>, RepositoryError> {
    let level: Option<i64> = decode(row, "record_level")?;
    let Some(level) = level else {
        return Ok(None);
    };

    let status: String = decode(row, "record_status")?;
    let comment: Option<String> = decode(row, "record_comment")?;
    let approver: String = decode(row, "record_approver")?;
    let decided_at: String = decode(row, "record_decided_at")?;

    Ok(Some(ApprovalRecord {
        level: parse_level("record_level", level)?,
        status: parse_decision_status(&status)?,
        comment,
        approver: Principal(approver),
        timestamp: parse_timestamp("record_decided_at", &decided_at)?,
    }))
}

/// Folds joined request/record rows back into aggregates, keeping row order.
fn fold_rows(rows: &[SqliteRow]) -> Result<Vec<ManufacturingRequest>, RepositoryError> {
    let mut requests: Vec<ManufacturingRequest> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let id: String = decode(row, "id")?;
        let position = match positions.get(&id) {
            Some(position) => *position,
            None => {
                requests.push(row_to_request(row)?);
                positions.insert(id, requests.len() - 1);
                requests.len() - 1
            }
        };

        if let Some(record) = row_to_record(row)? {
            requests[position].approval_records.push(record);
        }
    }

    Ok(requests)
}

#[async_trait::async_trait]
impl RequestRepository for SqlRequestRepository {
    async fn create(
        &self,
        creator: &Principal,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<ManufacturingRequest, RepositoryError> {
        let request =
            ManufacturingRequest::submitted(RequestId::generate(), creator.clone(), content, now);
        let timestamp = format_timestamp(now);

        sqlx::query(
            "INSERT INTO manufacturing_request
                 (id, status, creator, content, current_approval_level, version, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.id.as_str())
        .bind(request.status.as_str())
        .bind(request.creator.as_str())
        .bind(&request.content)
        .bind(i64::from(request.current_approval_level))
        .bind(i64::from(request.version))
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?;

        Ok(request)
    }

    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<ManufacturingRequest>, RepositoryError> {
        let mut found = self.fetch("WHERE r.id = ?", vec![QueryArg::Text(id.as_str())]).await?;
        Ok(found.pop())
    }

    async fn list_all(&self) -> Result<Vec<ManufacturingRequest>, RepositoryError> {
        self.fetch("", Vec::new()).await
    }

    async fn list_by_creator(
        &self,
        creator: &Principal,
    ) -> Result<Vec<ManufacturingRequest>, RepositoryError> {
        self.fetch("WHERE r.creator = ?", vec![QueryArg::Text(creator.as_str())]).await
    }

    async fn list_active_at_level(
        &self,
        level: ApprovalLevel,
    ) -> Result<Vec<ManufacturingRequest>, RepositoryError> {
        self.fetch(
            "WHERE r.status IN ('submitted', 'in_approval') AND r.current_approval_level = ?",
            vec![QueryArg::Int(i64::from(level))],
        )
        .await
    }

    async fn append_decision(
        &self,
        outcome: &TransitionOutcome,
    ) -> Result<ManufacturingRequest, RepositoryError> {
        let request_id = outcome.request_id.as_str();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE manufacturing_request
             SET status = ?, current_approval_level = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND version = ? AND status IN ('submitted', 'in_approval')",
        )
        .bind(outcome.to_status.as_str())
        .bind(i64::from(outcome.to_level))
        .bind(format_timestamp(outcome.record.timestamp))
        .bind(request_id)
        .bind(i64::from(outcome.expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT version FROM manufacturing_request WHERE id = ?")
                    .bind(request_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return Err(match current {
                None => RepositoryError::NotFound(request_id.to_owned()),
                Some(actual) => RepositoryError::VersionConflict {
                    id: request_id.to_owned(),
                    expected: outcome.expected_version,
                    actual: parse_version(actual)?,
                },
            });
        }

        let record = &outcome.record;
        sqlx::query(
            "INSERT INTO approval_record (request_id, level, status, comment, approver, decided_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(i64::from(record.level))
        .bind(record.status.as_str())
        .bind(record.comment.as_deref())
        .bind(record.approver.as_str())
        .bind(format_timestamp(record.timestamp))
        .execute(&mut *tx)
        .await?;

        // Read inside the transaction; any failure here rolls the decision back.
        let updated = fetch_requests(&mut *tx, "WHERE r.id = ?", vec![QueryArg::Text(request_id)])
            .await?
            .pop()
            .ok_or_else(|| RepositoryError::NotFound(request_id.to_owned()))?;

        tx.commit().await?;
        Ok(updated)
    }
}
