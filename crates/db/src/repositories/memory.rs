use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use nsmr_core::domain::identity::{Principal, UserProfile, UserRole};
use nsmr_core::domain::level::ApprovalLevel;
use nsmr_core::domain::request::{ManufacturingRequest, RequestId};
use nsmr_core::flows::TransitionOutcome;

use super::{
    ApproverRepository, ProfileRepository, RepositoryError, RequestRepository, RoleRepository,
};

type RequestCell = Arc<Mutex<ManufacturingRequest>>;

/// Request store kept in process memory.
///
/// Every request sits behind its own mutex, so decisions on different requests never
/// wait on each other. The level index only tracks active requests and is updated while
/// the owning request's mutex is held.
#[derive(Default)]
pub struct InMemoryRequestRepository {
    requests: RwLock<HashMap<RequestId, RequestCell>>,
    by_creator: RwLock<HashMap<Principal, Vec<RequestId>>>,
    by_level: RwLock<BTreeMap<ApprovalLevel, BTreeSet<RequestId>>>,
}

impl InMemoryRequestRepository {
    async fn cell(&self, id: &RequestId) -> Option<RequestCell> {
        self.requests.read().await.get(id).cloned()
    }

    async fn snapshot(&self, ids: impl IntoIterator<Item = RequestId>) -> Vec<ManufacturingRequest> {
        let cells: Vec<RequestCell> = {
            let requests = self.requests.read().await;
            ids.into_iter().filter_map(|id| requests.get(&id).cloned()).collect()
        };

        let mut snapshot = Vec::with_capacity(cells.len());
        for cell in cells {
            snapshot.push(cell.lock().await.clone());
        }
        sort_by_creation(&mut snapshot);
        snapshot
    }
}

fn sort_by_creation(requests: &mut [ManufacturingRequest]) {
    requests.sort_by(|left, right| {
        left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
    });
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryRequestRepository {
    async fn create(
        &self,
        creator: &Principal,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<ManufacturingRequest, RepositoryError> {
        let mut requests = self.requests.write().await;
        let mut id = RequestId::generate();
        while requests.contains_key(&id) {
            id = RequestId::generate();
        }

        let request = ManufacturingRequest::submitted(id.clone(), creator.clone(), content, now);
        requests.insert(id.clone(), Arc::new(Mutex::new(request.clone())));
        self.by_creator.write().await.entry(creator.clone()).or_default().push(id.clone());
        self.by_level.write().await.entry(request.current_approval_level).or_default().insert(id);

        Ok(request)
    }

    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<ManufacturingRequest>, RepositoryError> {
        match self.cell(id).await {
            Some(cell) => Ok(Some(cell.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> Result<Vec<ManufacturingRequest>, RepositoryError> {
        let ids: Vec<RequestId> = self.requests.read().await.keys().cloned().collect();
        Ok(self.snapshot(ids).await)
    }

    async fn list_by_creator(
        &self,
        creator: &Principal,
    ) -> Result<Vec<ManufacturingRequest>, RepositoryError> {
        let ids = self.by_creator.read().await.get(creator).cloned().unwrap_or_default();
        Ok(self.snapshot(ids).await)
    }

    async fn list_active_at_level(
        &self,
        level: ApprovalLevel,
    ) -> Result<Vec<ManufacturingRequest>, RepositoryError> {
        let ids = self.by_level.read().await.get(&level).cloned().unwrap_or_default();
        let mut queued = self.snapshot(ids).await;
        queued.retain(|request| request.is_active() && request.current_approval_level == level);
        Ok(queued)
    }

    async fn append_decision(
        &self,
        outcome: &TransitionOutcome,
    ) -> Result<ManufacturingRequest, RepositoryError> {
        let cell = self
            .cell(&outcome.request_id)
            .await
            .ok_or_else(|| RepositoryError::NotFound(outcome.request_id.to_string()))?;

        let mut request = cell.lock().await;
        if request.version != outcome.expected_version || !request.is_active() {
            return Err(RepositoryError::VersionConflict {
                id: outcome.request_id.to_string(),
                expected: outcome.expected_version,
                actual: request.version,
            });
        }

        outcome.apply_to(&mut request);

        let mut by_level = self.by_level.write().await;
        if let Some(queue) = by_level.get_mut(&outcome.from_level) {
            queue.remove(&outcome.request_id);
        }
        if request.is_active() {
            by_level.entry(request.current_approval_level).or_default().insert(request.id.clone());
        }

        Ok(request.clone())
    }
}

#[derive(Default)]
pub struct InMemoryApproverRepository {
    levels: RwLock<BTreeMap<ApprovalLevel, BTreeSet<Principal>>>,
}

#[async_trait::async_trait]
impl ApproverRepository for InMemoryApproverRepository {
    async fn assign(
        &self,
        level: ApprovalLevel,
        approver: &Principal,
        _now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut levels = self.levels.write().await;
        Ok(levels.entry(level).or_default().insert(approver.clone()))
    }

    async fn remove(
        &self,
        level: ApprovalLevel,
        approver: &Principal,
    ) -> Result<bool, RepositoryError> {
        let mut levels = self.levels.write().await;
        Ok(levels.get_mut(&level).map(|set| set.remove(approver)).unwrap_or(false))
    }

    async fn reassign(
        &self,
        level: ApprovalLevel,
        approvers: &BTreeSet<Principal>,
        _now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut levels = self.levels.write().await;
        levels.insert(level, approvers.clone());
        Ok(())
    }

    async fn is_approver(
        &self,
        level: ApprovalLevel,
        identity: &Principal,
    ) -> Result<bool, RepositoryError> {
        let levels = self.levels.read().await;
        Ok(levels.get(&level).is_some_and(|set| set.contains(identity)))
    }

    async fn approvers_of(
        &self,
        level: ApprovalLevel,
    ) -> Result<BTreeSet<Principal>, RepositoryError> {
        let levels = self.levels.read().await;
        Ok(levels.get(&level).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryRoleRepository {
    roles: RwLock<HashMap<Principal, UserRole>>,
}

#[async_trait::async_trait]
impl RoleRepository for InMemoryRoleRepository {
    async fn role_of(&self, identity: &Principal) -> Result<Option<UserRole>, RepositoryError> {
        let roles = self.roles.read().await;
        Ok(roles.get(identity).copied())
    }

    async fn set_role(
        &self,
        identity: &Principal,
        role: UserRole,
        _now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut roles = self.roles.write().await;
        roles.insert(identity.clone(), role);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryProfileRepository {
    profiles: RwLock<HashMap<Principal, UserProfile>>,
}

#[async_trait::async_trait]
impl ProfileRepository for InMemoryProfileRepository {
    async fn find(&self, identity: &Principal) -> Result<Option<UserProfile>, RepositoryError> {
        let profiles = self.profiles.read().await;
        Ok(profiles.get(identity).cloned())
    }

    async fn save(
        &self,
        identity: &Principal,
        profile: UserProfile,
        _now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut profiles = self.profiles.write().await;
        profiles.insert(identity.clone(), profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, Utc};

    use nsmr_core::domain::identity::{Principal, UserProfile, UserRole};
    use nsmr_core::domain::level::ApprovalLevel;
    use nsmr_core::domain::request::{ManufacturingRequest, RequestStatus};
    use nsmr_core::flows::{Decision, DecisionEvent, FlowEngine, TransitionOutcome};

    use crate::repositories::{
        ApproverRepository, InMemoryApproverRepository, InMemoryProfileRepository,
        InMemoryRequestRepository, InMemoryRoleRepository, ProfileRepository, RepositoryError,
        RequestRepository, RoleRepository,
    };

    fn approve(request: &ManufacturingRequest, approver: &str) -> TransitionOutcome {
        FlowEngine::default()
            .apply(
                request,
                &Decision {
                    event: DecisionEvent::Approve,
                    approver: Principal::new(approver),
                    comment: None,
                    decided_at: request.updated_at + Duration::milliseconds(1),
                },
            )
            .expect("approval transition")
    }

    #[tokio::test]
    async fn in_memory_request_repo_create_and_find() {
        let repo = InMemoryRequestRepository::default();
        let creator = Principal::new("requester");

        let created = repo.create(&creator, "Non-standard flange", Utc::now()).await.expect("create");
        let found = repo.find_by_id(&created.id).await.expect("find");

        assert_eq!(found, Some(created.clone()));
        assert_eq!(created.status, RequestStatus::Submitted);
        assert_eq!(repo.list_by_creator(&creator).await.expect("by creator").len(), 1);
        assert!(repo.list_by_creator(&Principal::new("other")).await.expect("other").is_empty());
    }

    #[tokio::test]
    async fn append_decision_moves_request_between_level_queues() {
        let repo = InMemoryRequestRepository::default();
        let created =
            repo.create(&Principal::new("requester"), "Custom alloy", Utc::now()).await.expect("create");

        let updated = repo.append_decision(&approve(&created, "approver-0")).await.expect("append");

        assert_eq!(updated.version, 1);
        assert_eq!(updated.current_approval_level.value(), 1);
        assert!(repo.list_active_at_level(ApprovalLevel::FIRST).await.expect("level 0").is_empty());
        let level_one = ApprovalLevel::new(1).expect("level 1");
        assert_eq!(repo.list_active_at_level(level_one).await.expect("level 1").len(), 1);
    }

    #[tokio::test]
    async fn stale_outcome_is_rejected_without_effect() {
        let repo = InMemoryRequestRepository::default();
        let created =
            repo.create(&Principal::new("requester"), "Custom alloy", Utc::now()).await.expect("create");

        let first = approve(&created, "approver-a");
        let second = approve(&created, "approver-b");
        repo.append_decision(&first).await.expect("first wins");

        let error = repo.append_decision(&second).await.expect_err("second is stale");
        assert!(matches!(error, RepositoryError::VersionConflict { expected: 0, actual: 1, .. }));

        let stored = repo.find_by_id(&created.id).await.expect("find").expect("exists");
        assert_eq!(stored.approval_records.len(), 1);
        assert_eq!(stored.approval_records[0].approver, Principal::new("approver-a"));
    }

    #[tokio::test]
    async fn in_memory_approver_repo_is_idempotent() {
        let repo = InMemoryApproverRepository::default();
        let level = ApprovalLevel::new(3).expect("level");
        let approver = Principal::new("approver-3");

        assert!(repo.assign(level, &approver, Utc::now()).await.expect("assign"));
        assert!(!repo.assign(level, &approver, Utc::now()).await.expect("assign again"));
        assert!(repo.is_approver(level, &approver).await.expect("member"));
        assert!(!repo.is_approver(ApprovalLevel::FIRST, &approver).await.expect("other level"));

        let replacement: BTreeSet<_> = [Principal::new("x"), Principal::new("y")].into();
        repo.reassign(level, &replacement, Utc::now()).await.expect("reassign");
        assert_eq!(repo.approvers_of(level).await.expect("approvers"), replacement);
        assert!(!repo.remove(level, &approver).await.expect("remove absent"));
    }

    #[tokio::test]
    async fn in_memory_role_and_profile_round_trip() {
        let roles = InMemoryRoleRepository::default();
        let profiles = InMemoryProfileRepository::default();
        let identity = Principal::new("plant-admin");

        assert_eq!(roles.role_of(&identity).await.expect("role"), None);
        roles.set_role(&identity, UserRole::Admin, Utc::now()).await.expect("set role");
        assert_eq!(roles.role_of(&identity).await.expect("role"), Some(UserRole::Admin));

        let profile = UserProfile { name: "Plant Admin".to_owned() };
        profiles.save(&identity, profile.clone(), Utc::now()).await.expect("save profile");
        assert_eq!(profiles.find(&identity).await.expect("profile"), Some(profile));
    }
}
