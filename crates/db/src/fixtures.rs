use serde::Serialize;
use sqlx::Executor;

use nsmr_core::domain::level::{ApprovalLevel, LEVEL_COUNT};
use nsmr_core::domain::request::RequestId;

use crate::connection::DbPool;
use crate::repositories::{
    ApproverRepository, RepositoryError, RequestRepository, SqlApproverRepository,
    SqlRequestRepository,
};

/// Canonical demo requests and the state each one is expected to be in after seeding.
const SEED_REQUESTS: &[SeedRequestContract] = &[
    SeedRequestContract {
        id: "NSMR-DEMO-0001",
        status: "submitted",
        current_approval_level: 0,
        record_count: 0,
        description: "Bore tolerance deviation waiting at level 0",
    },
    SeedRequestContract {
        id: "NSMR-DEMO-0002",
        status: "in_approval",
        current_approval_level: 2,
        record_count: 2,
        description: "Heat treatment change escalated to level 2",
    },
    SeedRequestContract {
        id: "NSMR-DEMO-0003",
        status: "rejected",
        current_approval_level: 1,
        record_count: 2,
        description: "Alloy substitution rejected at level 1",
    },
];

/// Approver assignments made by the fixture, one per level.
const SEED_APPROVERS: &[(i64, &str)] = &[
    (0, "approver-l0"),
    (1, "approver-l1"),
    (2, "approver-l2"),
    (3, "approver-l3"),
    (4, "approver-l4"),
    (5, "approver-l5"),
    (6, "approver-l6"),
    (7, "approver-l7"),
];

const SEED_ADMIN: &str = "plant-admin";
const SEED_PRINCIPALS: &[&str] = &["plant-admin", "requester-ana"];

/// Demo dataset used by `nsmr seed` and the smoke checks.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed_data.sql");

    /// Loads the dataset. Re-running is a no-op for rows that already exist.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;

        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        let requests_seeded = SEED_REQUESTS
            .iter()
            .map(|request| SeededRequest { id: request.id, description: request.description })
            .collect::<Vec<_>>();

        Ok(SeedResult { admin: SEED_ADMIN, requests_seeded })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let admin_present: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM user_role WHERE principal = ?1 AND role = 'admin')",
        )
        .bind(SEED_ADMIN)
        .fetch_one(pool)
        .await?;
        checks.push(("admin-role".to_owned(), admin_present == 1));

        let approvers = SqlApproverRepository::new(pool.clone());
        let mut staffed_levels = 0;
        for level in ApprovalLevel::all() {
            if !approvers.approvers_of(level).await?.is_empty() {
                staffed_levels += 1;
            }
        }
        checks.push(("approvers-per-level".to_owned(), staffed_levels == LEVEL_COUNT));

        let requests = SqlRequestRepository::new(pool.clone());
        for contract in SEED_REQUESTS {
            let stored = requests.find_by_id(&RequestId(contract.id.to_owned())).await?;
            let matches = stored.as_ref().is_some_and(|request| {
                request.status.as_str() == contract.status
                    && request.current_approval_level.value() == contract.current_approval_level
                    && request.approval_records.len() == contract.record_count
                    && request.verify_audit_trail().is_ok()
            });
            checks.push((contract.id.to_owned(), matches));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes seeded rows from a test database.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let request_ids = sql_array_from_ids(&SEED_REQUESTS.iter().map(|r| r.id).collect::<Vec<_>>());
        let principals = sql_array_from_ids(SEED_PRINCIPALS);
        let mut tx = pool.begin().await?;

        sqlx::query(&format!("DELETE FROM approval_record WHERE request_id IN {request_ids}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM manufacturing_request WHERE id IN {request_ids}"))
            .execute(&mut *tx)
            .await?;
        for (level, approver) in SEED_APPROVERS {
            sqlx::query("DELETE FROM level_approver WHERE level = ?1 AND approver = ?2")
                .bind(*level)
                .bind(*approver)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(&format!("DELETE FROM user_role WHERE principal IN {principals}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM user_profile WHERE principal IN {principals}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedRequestContract {
    id: &'static str,
    status: &'static str,
    current_approval_level: u8,
    record_count: usize,
    description: &'static str,
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug, Serialize)]
pub struct SeedResult {
    pub admin: &'static str,
    pub requests_seeded: Vec<SeededRequest>,
}

#[derive(Debug, Serialize)]
pub struct SeededRequest {
    pub id: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Serialize)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}
