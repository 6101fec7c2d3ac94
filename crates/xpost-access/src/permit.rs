//! Idempotency permits: one per decision, `pending -> approved -> used|failed`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use xpost_store::{PublishStore, StoreError};
use xpost_types::{ExternalId, Permit, PermitStatus};

#[derive(Debug, Error)]
pub enum PermitError {
    #[error("permit '{0}' does not exist")]
    Missing(String),
    #[error("permit '{permit_id}' is {status:?}, expected approved")]
    Invalid {
        permit_id: String,
        status: PermitStatus,
    },
    #[error(
        "permit '{permit_id}' already used with external id '{existing}', refusing '{attempted}'"
    )]
    ExternalIdConflict {
        permit_id: String,
        existing: String,
        attempted: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PermitError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Missing(_) => "permit_missing",
            Self::Invalid { .. } => "permit_invalid",
            Self::ExternalIdConflict { .. } => "permit_external_id_conflict",
            Self::Store(_) => "permit_store_error",
        }
    }
}

/// Permit operations over a shared [`PublishStore`].
#[derive(Clone)]
pub struct PermitRegistry {
    store: Arc<dyn PublishStore>,
}

impl PermitRegistry {
    pub fn new(store: Arc<dyn PublishStore>) -> Self {
        Self { store }
    }

    /// Creates a pending permit, or returns the one already held by `decision_id`.
    pub async fn create(
        &self,
        decision_id: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<Permit, PermitError> {
        Ok(self
            .store
            .create_permit(Permit::new(decision_id, metadata))
            .await?)
    }

    pub async fn approve(&self, permit_id: &str) -> Result<Permit, PermitError> {
        self.transition(permit_id, PermitStatus::Approved, None, None)
            .await
    }

    /// Succeeds only for an approved permit.
    pub async fn verify(&self, permit_id: &str) -> Result<Permit, PermitError> {
        let permit = self
            .store
            .get_permit(permit_id)
            .await?
            .ok_or_else(|| PermitError::Missing(permit_id.to_string()))?;
        if permit.status != PermitStatus::Approved {
            return Err(PermitError::Invalid {
                permit_id: permit.permit_id,
                status: permit.status,
            });
        }
        Ok(permit)
    }

    pub async fn get(&self, permit_id: &str) -> Result<Option<Permit>, PermitError> {
        Ok(self.store.get_permit(permit_id).await?)
    }

    pub async fn get_for_decision(&self, decision_id: &str) -> Result<Option<Permit>, PermitError> {
        Ok(self.store.get_permit_for_decision(decision_id).await?)
    }

    /// Marks the permit used. Repeating with the same id is a no-op; a different
    /// id is a logic error and is logged loudly.
    pub async fn mark_used(
        &self,
        permit_id: &str,
        external_id: &ExternalId,
    ) -> Result<Permit, PermitError> {
        self.transition(permit_id, PermitStatus::Used, Some(external_id), None)
            .await
    }

    pub async fn mark_failed(&self, permit_id: &str, reason: &str) -> Result<Permit, PermitError> {
        self.transition(permit_id, PermitStatus::Failed, None, Some(reason))
            .await
    }

    async fn transition(
        &self,
        permit_id: &str,
        next: PermitStatus,
        external_id: Option<&ExternalId>,
        reason: Option<&str>,
    ) -> Result<Permit, PermitError> {
        match self
            .store
            .transition_permit(permit_id, next, external_id, reason)
            .await
        {
            Ok(permit) => Ok(permit),
            Err(StoreError::PermitNotFound(id)) => Err(PermitError::Missing(id)),
            Err(StoreError::ExternalIdConflict {
                existing,
                attempted,
                ..
            }) => {
                tracing::error!(
                    permit_id,
                    existing = existing.as_str(),
                    attempted = attempted.as_str(),
                    "permit already used with a different external id"
                );
                Err(PermitError::ExternalIdConflict {
                    permit_id: permit_id.to_string(),
                    existing,
                    attempted,
                })
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PermitError, PermitRegistry};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use xpost_store::InMemoryPublishStore;
    use xpost_types::{ExternalId, PermitStatus};

    fn registry() -> PermitRegistry {
        PermitRegistry::new(Arc::new(InMemoryPublishStore::new()))
    }

    #[tokio::test]
    async fn functional_permit_lifecycle_reaches_used() {
        let registry = registry();
        let permit = registry
            .create("d1", HashMap::from([("job_run_id".to_string(), json!("run-1"))]))
            .await
            .expect("create");
        assert_eq!(permit.status, PermitStatus::Pending);

        let error = registry
            .verify(&permit.permit_id)
            .await
            .expect_err("pending is not verified");
        assert!(matches!(
            error,
            PermitError::Invalid {
                status: PermitStatus::Pending,
                ..
            }
        ));

        registry.approve(&permit.permit_id).await.expect("approve");
        registry.verify(&permit.permit_id).await.expect("verify");

        let external_id = ExternalId::parse("999").expect("id");
        let used = registry
            .mark_used(&permit.permit_id, &external_id)
            .await
            .expect("use");
        assert_eq!(used.status, PermitStatus::Used);
        registry
            .mark_used(&permit.permit_id, &external_id)
            .await
            .expect("idempotent use");

        let error = registry
            .verify(&permit.permit_id)
            .await
            .expect_err("used permits no longer verify");
        assert_eq!(error.reason_code(), "permit_invalid");
    }

    #[tokio::test]
    async fn regression_mark_used_with_different_id_is_a_conflict() {
        let registry = registry();
        let permit = registry.create("d1", HashMap::new()).await.expect("create");
        registry.approve(&permit.permit_id).await.expect("approve");
        registry
            .mark_used(&permit.permit_id, &ExternalId::parse("1").expect("id"))
            .await
            .expect("use");
        let error = registry
            .mark_used(&permit.permit_id, &ExternalId::parse("2").expect("id"))
            .await
            .expect_err("conflict");
        assert!(matches!(error, PermitError::ExternalIdConflict { .. }));
    }

    #[tokio::test]
    async fn unit_verify_unknown_permit_is_missing() {
        let error = registry()
            .verify("permit-nope")
            .await
            .expect_err("missing");
        assert!(matches!(error, PermitError::Missing(_)));
    }

    #[tokio::test]
    async fn unit_mark_failed_is_terminal() {
        let registry = registry();
        let permit = registry.create("d1", HashMap::new()).await.expect("create");
        let failed = registry
            .mark_failed(&permit.permit_id, "deadline_exceeded")
            .await
            .expect("fail");
        assert_eq!(failed.reason.as_deref(), Some("deadline_exceeded"));
        let error = registry
            .approve(&permit.permit_id)
            .await
            .expect_err("failed is terminal");
        assert!(matches!(error, PermitError::Store(_)));
    }
}
