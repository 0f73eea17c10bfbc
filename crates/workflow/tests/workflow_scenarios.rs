use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nsmr_core::audit::{CallContext, InMemoryAuditSink};
use nsmr_core::clock::MonotonicClock;
use nsmr_core::domain::identity::{Principal, UserRole};
use nsmr_core::domain::level::ApprovalLevel;
use nsmr_core::domain::request::{DecisionStatus, RequestId, RequestStatus};
use nsmr_core::errors::WorkflowError;
use nsmr_db::repositories::{InMemoryRoleRepository, RepositoryError, RoleRepository};
use nsmr_db::{connect_with_settings, migrations};
use nsmr_workflow::{WorkflowService, WorkflowStores};

const ADMIN: &str = "plant-admin";
const REQUESTER: &str = "requester-ana";

struct Harness {
    service: Arc<WorkflowService>,
    audit: InMemoryAuditSink,
}

fn ctx(principal: &str) -> CallContext {
    CallContext::new(Principal::new(principal), format!("corr-{principal}"))
}

fn level(value: u8) -> ApprovalLevel {
    ApprovalLevel::new(value).expect("valid level")
}

fn approver_for(level: ApprovalLevel) -> String {
    format!("approver-l{level}")
}

async fn staff(service: &WorkflowService) {
    service.bootstrap_admins(&[Principal::new(ADMIN)]).await.expect("bootstrap admin");
    for level in ApprovalLevel::all() {
        service
            .assign_approver(&ctx(ADMIN), level, &Principal::new(approver_for(level)))
            .await
            .expect("assign level approver");
    }
}

async fn in_memory_harness() -> Harness {
    let audit = InMemoryAuditSink::default();
    let service = WorkflowService::in_memory(Arc::new(audit.clone()));
    staff(&service).await;
    Harness { service: Arc::new(service), audit }
}

async fn sqlite_harness() -> Harness {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    let audit = InMemoryAuditSink::default();
    let service = WorkflowService::sqlite(pool, Arc::new(audit.clone()));
    staff(&service).await;
    Harness { service: Arc::new(service), audit }
}

async fn submit(harness: &Harness, content: &str) -> RequestId {
    harness.service.submit(&ctx(REQUESTER), content).await.expect("submit").id
}

#[tokio::test]
async fn submit_creates_request_at_level_zero() {
    let harness = in_memory_harness().await;

    let request = harness.service.submit(&ctx(REQUESTER), "Bore tolerance 0.05mm").await.expect("submit");

    assert_eq!(request.status, RequestStatus::Submitted);
    assert_eq!(request.current_approval_level, ApprovalLevel::FIRST);
    assert_eq!(request.creator, Principal::new(REQUESTER));
    assert!(request.approval_records.is_empty());
    assert_eq!(request.created_at, request.updated_at);
    assert_eq!(harness.audit.events_of_type("request.submitted").len(), 1);
}

#[tokio::test]
async fn blank_content_is_rejected_without_creating_anything() {
    let harness = in_memory_harness().await;

    let error = harness.service.submit(&ctx(REQUESTER), "   \n").await.expect_err("blank");

    assert!(matches!(error, WorkflowError::InvalidArgument(_)));
    assert!(harness.service.get_all_requests().await.expect("list").is_empty());
}

#[tokio::test]
async fn approval_below_final_level_escalates() {
    let harness = in_memory_harness().await;
    let id = submit(&harness, "Alternate heat treatment").await;
    let before = harness.service.get_request(&id).await.expect("load");

    let updated = harness
        .service
        .approve(&ctx("approver-l0"), &id, Some("  looks fine  ".to_owned()))
        .await
        .expect("approve");

    assert_eq!(updated.status, RequestStatus::InApproval);
    assert_eq!(updated.current_approval_level.value(), 1);
    assert_eq!(updated.approval_records.len(), 1);
    let record = &updated.approval_records[0];
    assert_eq!(record.level, ApprovalLevel::FIRST);
    assert_eq!(record.status, DecisionStatus::Approved);
    assert_eq!(record.comment.as_deref(), Some("looks fine"));
    assert_eq!(record.approver, Principal::new("approver-l0"));
    assert!(updated.updated_at >= before.updated_at);
    assert_eq!(harness.audit.events_of_type("request.escalated").len(), 1);
}

async fn run_full_escalation(harness: &Harness) {
    let id = submit(harness, "Substitute alloy for housing").await;
    let mut previous = harness.service.get_request(&id).await.expect("load");

    for level in ApprovalLevel::all() {
        let updated = harness
            .service
            .approve(&ctx(&approver_for(level)), &id, None)
            .await
            .expect("approve along the chain");
        assert!(updated.current_approval_level >= previous.current_approval_level);
        assert!(updated.updated_at >= previous.updated_at);
        assert!(updated.approval_records.len() <= usize::from(updated.current_approval_level.value()) + 1);
        previous = updated;
    }

    assert_eq!(previous.status, RequestStatus::Approved);
    assert_eq!(previous.current_approval_level, ApprovalLevel::FINAL);
    assert_eq!(previous.approval_records.len(), 8);
    assert!(previous.approval_records.iter().all(|r| r.status == DecisionStatus::Approved));
    assert!(previous.verify_audit_trail().is_ok());

    let error = harness
        .service
        .approve(&ctx(&approver_for(ApprovalLevel::FINAL)), &id, None)
        .await
        .expect_err("approved is terminal");
    assert!(matches!(error, WorkflowError::InvalidState(_)));
    assert_eq!(harness.audit.events_of_type("request.approved").len(), 1);
    assert_eq!(harness.audit.events_of_type("request.escalated").len(), 7);
}

#[tokio::test]
async fn full_escalation_reaches_approved_in_memory() {
    run_full_escalation(&in_memory_harness().await).await;
}

#[tokio::test]
async fn full_escalation_reaches_approved_on_sqlite() {
    run_full_escalation(&sqlite_harness().await).await;
}

async fn run_rejection_at_level_one(harness: &Harness) {
    let id = submit(harness, "Custom coating thickness").await;
    harness.service.approve(&ctx("approver-l0"), &id, None).await.expect("approve level 0");

    let rejected = harness
        .service
        .reject(&ctx("approver-l1"), &id, Some("Coating supplier not qualified".to_owned()))
        .await
        .expect("reject level 1");

    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.current_approval_level.value(), 1);
    assert_eq!(rejected.approval_records.len(), 2);
    assert_eq!(rejected.approval_records[1].status, DecisionStatus::Rejected);
    assert_eq!(
        rejected.approval_records[1].comment.as_deref(),
        Some("Coating supplier not qualified")
    );

    for attempt in [
        harness.service.approve(&ctx("approver-l1"), &id, None).await,
        harness.service.reject(&ctx("approver-l1"), &id, Some("again".to_owned())).await,
    ] {
        assert!(matches!(attempt, Err(WorkflowError::InvalidState(_))));
    }

    let stored = harness.service.get_request(&id).await.expect("load");
    assert_eq!(stored, rejected);
}

#[tokio::test]
async fn rejection_at_level_one_is_terminal_in_memory() {
    run_rejection_at_level_one(&in_memory_harness().await).await;
}

#[tokio::test]
async fn rejection_at_level_one_is_terminal_on_sqlite() {
    run_rejection_at_level_one(&sqlite_harness().await).await;
}

#[tokio::test]
async fn blank_rejection_comment_has_no_effect() {
    let harness = in_memory_harness().await;
    let id = submit(&harness, "Oversized bracket").await;

    for comment in [None, Some(String::new()), Some("   ".to_owned())] {
        let error = harness.service.reject(&ctx("approver-l0"), &id, comment).await.expect_err("blank");
        assert!(matches!(error, WorkflowError::InvalidArgument(_)));
    }

    let stored = harness.service.get_request(&id).await.expect("load");
    assert_eq!(stored.status, RequestStatus::Submitted);
    assert_eq!(stored.version, 0);
    assert!(stored.approval_records.is_empty());
}

#[tokio::test]
async fn non_approver_decisions_are_denied_without_effect() {
    let harness = in_memory_harness().await;
    let id = submit(&harness, "Thread pitch deviation").await;

    for caller in ["approver-l1", ADMIN, REQUESTER] {
        let error = harness.service.approve(&ctx(caller), &id, None).await.expect_err("denied");
        assert!(error.is_permission_denied(), "{caller} should be denied");
    }

    let stored = harness.service.get_request(&id).await.expect("load");
    assert_eq!(stored.version, 0);
    assert!(stored.approval_records.is_empty());
    assert_eq!(harness.audit.events_of_type("request.decision_denied").len(), 3);
}

#[tokio::test]
async fn checks_run_in_argument_existence_state_membership_order() {
    let harness = in_memory_harness().await;
    let missing = RequestId("NSMR-missing".to_owned());

    let error = harness.service.reject(&ctx(REQUESTER), &missing, None).await.expect_err("arg");
    assert!(matches!(error, WorkflowError::InvalidArgument(_)));

    let error = harness.service.approve(&ctx(REQUESTER), &missing, None).await.expect_err("missing");
    assert!(matches!(error, WorkflowError::NotFound { .. }));

    let id = submit(&harness, "Paint color deviation").await;
    harness.service.reject(&ctx("approver-l0"), &id, Some("no".to_owned())).await.expect("reject");
    let error = harness.service.approve(&ctx(REQUESTER), &id, None).await.expect_err("terminal");
    assert!(matches!(error, WorkflowError::InvalidState(_)));
}

#[tokio::test]
async fn level_queue_is_hidden_from_non_approvers() {
    let harness = in_memory_harness().await;
    let waiting = submit(&harness, "Queued at level 0").await;
    let moved = submit(&harness, "Escalated to level 1").await;
    harness.service.approve(&ctx("approver-l0"), &moved, None).await.expect("approve");

    let error = harness
        .service
        .get_requests_by_level(&ctx(REQUESTER), ApprovalLevel::FIRST)
        .await
        .expect_err("non-approver");
    assert!(error.is_permission_denied());
    let error = harness
        .service
        .get_requests_by_level(&ctx(ADMIN), ApprovalLevel::FIRST)
        .await
        .expect_err("admin is not a level member");
    assert!(error.is_permission_denied());

    let queue = harness
        .service
        .get_requests_by_level(&ctx("approver-l0"), ApprovalLevel::FIRST)
        .await
        .expect("approver view");
    let ids: Vec<&RequestId> = queue.iter().map(|request| &request.id).collect();
    assert_eq!(ids, vec![&waiting]);
}

#[tokio::test]
async fn my_approvals_aggregates_member_levels_only() {
    let harness = in_memory_harness().await;
    let multi = Principal::new("multi-level");
    harness.service.assign_approver(&ctx(ADMIN), level(0), &multi).await.expect("assign 0");
    harness.service.assign_approver(&ctx(ADMIN), level(2), &multi).await.expect("assign 2");

    let at_zero = submit(&harness, "At level zero").await;
    let at_one = submit(&harness, "At level one").await;
    let at_two = submit(&harness, "At level two").await;
    harness.service.approve(&ctx("approver-l0"), &at_one, None).await.expect("0 -> 1");
    harness.service.approve(&ctx("approver-l0"), &at_two, None).await.expect("0 -> 1");
    harness.service.approve(&ctx("approver-l1"), &at_two, None).await.expect("1 -> 2");

    let mine = harness.service.my_approvals(&ctx("multi-level")).await.expect("my approvals");
    let mut ids: Vec<RequestId> = mine.into_iter().map(|request| request.id).collect();
    ids.sort();
    let mut expected = vec![at_zero, at_two];
    expected.sort();
    assert_eq!(ids, expected);

    assert!(harness.service.my_approvals(&ctx(REQUESTER)).await.expect("nobody").is_empty());
}

#[tokio::test]
async fn approver_assignment_is_admin_only_and_idempotent() {
    let harness = in_memory_harness().await;
    let newcomer = Principal::new("newcomer");

    let denied = harness.service.assign_approver(&ctx(REQUESTER), level(3), &newcomer).await;
    assert!(matches!(denied, Err(WorkflowError::PermissionDenied(_))));
    assert!(!harness.service.approvers_of(level(3)).await.expect("approvers").contains(&newcomer));

    assert_eq!(harness.service.assign_approver(&ctx(ADMIN), level(3), &newcomer).await, Ok(true));
    assert_eq!(harness.service.assign_approver(&ctx(ADMIN), level(3), &newcomer).await, Ok(false));
    assert_eq!(harness.service.approvers_of(level(3)).await.expect("approvers").len(), 2);

    let replaced = harness
        .service
        .reassign_approvers(&ctx(ADMIN), level(3), vec![newcomer.clone()])
        .await
        .expect("reassign");
    assert_eq!(replaced.into_iter().collect::<Vec<_>>(), vec![newcomer.clone()]);
    assert_eq!(harness.service.remove_approver(&ctx(ADMIN), level(3), &newcomer).await, Ok(true));
    assert_eq!(harness.service.remove_approver(&ctx(ADMIN), level(3), &newcomer).await, Ok(false));
    assert!(!harness.audit.events_of_type("approvers.reassigned").is_empty());
}

#[tokio::test]
async fn roles_default_to_guest_and_are_admin_assigned() {
    let harness = in_memory_harness().await;
    let operator = Principal::new("operator");

    assert_eq!(harness.service.caller_role(&ctx("operator")).await, Ok(UserRole::Guest));
    assert_eq!(harness.service.is_caller_admin(&ctx("operator")).await, Ok(false));
    assert_eq!(harness.service.is_caller_admin(&ctx(ADMIN)).await, Ok(true));

    let denied = harness.service.assign_role(&ctx("operator"), &operator, UserRole::Admin).await;
    assert!(matches!(denied, Err(WorkflowError::PermissionDenied(_))));

    harness.service.assign_role(&ctx(ADMIN), &operator, UserRole::User).await.expect("assign");
    assert_eq!(harness.service.caller_role(&ctx("operator")).await, Ok(UserRole::User));

    let submitted = harness.service.submit(&ctx("guest-visitor"), "Guests may submit").await;
    assert!(submitted.is_ok());
}

#[tokio::test]
async fn profiles_are_private_to_owner_and_admins() {
    let harness = in_memory_harness().await;

    let error = harness.service.save_caller_profile(&ctx(REQUESTER), "  ").await.expect_err("blank");
    assert!(matches!(error, WorkflowError::InvalidArgument(_)));
    assert_eq!(harness.service.caller_profile(&ctx(REQUESTER)).await, Ok(None));

    harness.service.save_caller_profile(&ctx(REQUESTER), " Ana ").await.expect("save");
    let own = harness.service.caller_profile(&ctx(REQUESTER)).await.expect("own profile");
    assert_eq!(own.map(|profile| profile.name), Some("Ana".to_owned()));

    let requester = Principal::new(REQUESTER);
    let denied = harness.service.user_profile(&ctx("approver-l0"), &requester).await;
    assert!(matches!(denied, Err(WorkflowError::PermissionDenied(_))));
    let by_admin = harness.service.user_profile(&ctx(ADMIN), &requester).await.expect("admin");
    assert!(by_admin.is_some());
}

#[tokio::test]
async fn user_requests_are_filtered_by_creator() {
    let harness = in_memory_harness().await;
    submit(&harness, "Mine").await;
    harness.service.submit(&ctx("someone-else"), "Theirs").await.expect("submit");

    let mine = harness.service.get_user_requests(&Principal::new(REQUESTER)).await.expect("mine");
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].content, "Mine");
    assert_eq!(harness.service.get_all_requests().await.expect("all").len(), 2);
    assert!(harness
        .service
        .get_user_requests(&Principal::new("nobody"))
        .await
        .expect("none")
        .is_empty());
}

async fn race_two_approvers(harness: Harness) {
    for approver in ["racer-a", "racer-b"] {
        harness
            .service
            .assign_approver(&ctx(ADMIN), ApprovalLevel::FIRST, &Principal::new(approver))
            .await
            .expect("assign racer");
    }
    let id = submit(&harness, "Contended request").await;

    let handles: Vec<_> = ["racer-a", "racer-b"]
        .into_iter()
        .map(|approver| {
            let service = Arc::clone(&harness.service);
            let id = id.clone();
            tokio::spawn(async move { service.approve(&ctx(approver), &id, None).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.expect("task joined"));
    }

    let successes = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(successes, 1, "exactly one approval may win: {outcomes:?}");
    for outcome in outcomes.iter().filter_map(|outcome| outcome.as_ref().err()) {
        assert!(
            matches!(outcome, WorkflowError::InvalidState(_) | WorkflowError::PermissionDenied(_)),
            "loser must fail cleanly: {outcome:?}"
        );
    }

    let stored = harness.service.get_request(&id).await.expect("load");
    assert_eq!(stored.approval_records.len(), 1);
    assert_eq!(stored.current_approval_level.value(), 1);
    assert_eq!(stored.version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_approvals_at_one_level_admit_exactly_one_in_memory() {
    race_two_approvers(in_memory_harness().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_approvals_at_one_level_admit_exactly_one_on_sqlite() {
    race_two_approvers(sqlite_harness().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_on_a_multi_connection_pool_admit_exactly_one() {
    const RACERS: usize = 8;
    const ROUNDS: usize = 10;

    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("race.db").display());
    let pool = connect_with_settings(&url, RACERS as u32, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    let service = Arc::new(WorkflowService::sqlite(pool.clone(), Arc::new(InMemoryAuditSink::default())));
    service.bootstrap_admins(&[Principal::new(ADMIN)]).await.expect("bootstrap admin");

    let racers: Vec<String> = (0..RACERS).map(|n| format!("racer-{n}")).collect();
    for racer in &racers {
        service
            .assign_approver(&ctx(ADMIN), ApprovalLevel::FIRST, &Principal::new(racer.as_str()))
            .await
            .expect("assign racer");
    }

    for round in 0..ROUNDS {
        let id = service
            .submit(&ctx(REQUESTER), &format!("Contended request {round}"))
            .await
            .expect("submit")
            .id;

        let handles: Vec<_> = racers
            .iter()
            .cloned()
            .map(|racer| {
                let service = Arc::clone(&service);
                let id = id.clone();
                tokio::spawn(async move { service.approve(&ctx(&racer), &id, None).await })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.expect("task joined"));
        }

        let successes = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
        assert_eq!(successes, 1, "round {round}: exactly one approval may win: {outcomes:?}");
        for error in outcomes.iter().filter_map(|outcome| outcome.as_ref().err()) {
            assert!(
                matches!(error, WorkflowError::InvalidState(_) | WorkflowError::PermissionDenied(_)),
                "round {round}: loser must fail cleanly: {error:?}"
            );
        }

        let stored = service.get_request(&id).await.expect("load");
        assert_eq!(stored.approval_records.len(), 1, "round {round}");
        assert_eq!(stored.version, 1, "round {round}");
        assert_eq!(stored.current_approval_level.value(), 1, "round {round}");
    }

    pool.close().await;
}

#[tokio::test]
async fn submitted_content_is_stored_trimmed() {
    let harness = in_memory_harness().await;

    let id = submit(&harness, "  Oversized flange, 120mm bore \n").await;

    let stored = harness.service.get_request(&id).await.expect("load");
    assert_eq!(stored.content, "Oversized flange, 120mm bore");
}

/// Role store that counts lookups.
#[derive(Default)]
struct CountingRoles {
    inner: InMemoryRoleRepository,
    lookups: AtomicUsize,
}

#[async_trait]
impl RoleRepository for CountingRoles {
    async fn role_of(&self, identity: &Principal) -> Result<Option<UserRole>, RepositoryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.role_of(identity).await
    }

    async fn set_role(
        &self,
        identity: &Principal,
        role: UserRole,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.inner.set_role(identity, role, now).await
    }
}

#[tokio::test]
async fn level_scoped_checks_do_not_consult_roles() {
    let roles = Arc::new(CountingRoles::default());
    let stores = WorkflowStores { roles: roles.clone(), ..WorkflowStores::in_memory() };
    let service = WorkflowService::new(
        stores,
        Arc::new(MonotonicClock::default()),
        Arc::new(InMemoryAuditSink::default()),
    );
    staff(&service).await;
    let id = service.submit(&ctx(REQUESTER), "Thin-wall casting").await.expect("submit").id;
    roles.lookups.store(0, Ordering::SeqCst);

    let denied = service.approve(&ctx("approver-l3"), &id, None).await;
    assert!(matches!(denied, Err(WorkflowError::PermissionDenied(_))));
    service.approve(&ctx("approver-l0"), &id, None).await.expect("level 0 approval");
    let queue = service
        .get_requests_by_level(&ctx("approver-l1"), level(1))
        .await
        .expect("level 1 queue");
    assert_eq!(queue.len(), 1);
    assert!(service.my_approvals(&ctx(REQUESTER)).await.expect("empty queue").is_empty());

    assert_eq!(roles.lookups.load(Ordering::SeqCst), 0);
}
