//! Acknowledgement store
//!
//! Workflows over the aggregator's organization-wide disable endpoints.
//! Nothing is cached; every call is a round trip to the system of record.

use crate::aggregator::AggregatorApi;
use advisor_core::{
    Acknowledgement, AdvisorError, CompositeRuleId, OrgId, Result, SystemWideRuleDisable, UserId,
};
use advisor_engine::AckIndex;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Result of the acknowledge-post workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub ack: Acknowledgement,
    /// The acknowledgement did not exist before this call
    pub created: bool,
}

#[derive(Clone)]
pub struct AckStore {
    aggregator: Arc<dyn AggregatorApi>,
}

impl AckStore {
    pub fn new(aggregator: Arc<dyn AggregatorApi>) -> Self {
        Self { aggregator }
    }

    /// All acknowledgements of the organization
    pub async fn list(&self, org: OrgId) -> Result<Vec<Acknowledgement>> {
        let records = self.aggregator.list_acks(org).await?;
        debug!(org_id = %org, count = records.len(), "acknowledgements listed");
        Ok(records.into_iter().map(Acknowledgement::from).collect())
    }

    /// Index of acknowledged rules for the visibility predicate
    pub async fn index(&self, org: OrgId) -> Result<AckIndex> {
        let records = self.aggregator.list_acks(org).await?;
        Ok(AckIndex::from_records(&records))
    }

    /// ReadOne for a raw selector; absent ⇒ NotFound
    pub async fn get(&self, org: OrgId, selector: &str) -> Result<Acknowledgement> {
        let rule = CompositeRuleId::parse(selector)?;
        self.read(org, &rule)
            .await?
            .map(Acknowledgement::from)
            .ok_or_else(|| AdvisorError::NotFound(rule.to_string()))
    }

    pub async fn is_acknowledged(&self, org: OrgId, rule: &CompositeRuleId) -> Result<bool> {
        Ok(self.read(org, rule).await?.is_some())
    }

    /// Create-or-return. The returned record always comes from a read
    /// issued after the optional create.
    pub async fn acknowledge(
        &self,
        org: OrgId,
        user: &UserId,
        selector: &str,
        justification: &str,
    ) -> Result<AckOutcome> {
        let rule = CompositeRuleId::parse(selector)?;

        let existed = self.read(org, &rule).await?.is_some();
        if !existed {
            info!(org_id = %org, rule = %rule, "creating acknowledgement");
            self.aggregator
                .create_ack(org, user, &rule, justification)
                .await?;
        }

        let record = self.read(org, &rule).await?.ok_or_else(|| {
            error!(org_id = %org, rule = %rule, "acknowledgement missing right after write");
            AdvisorError::Internal(format!("acknowledgement {} was not stored", rule))
        })?;

        Ok(AckOutcome {
            ack: record.into(),
            created: !existed,
        })
    }

    /// Update justification of an existing acknowledgement
    pub async fn update(
        &self,
        org: OrgId,
        user: &UserId,
        selector: &str,
        justification: &str,
    ) -> Result<Acknowledgement> {
        let rule = CompositeRuleId::parse(selector)?;

        if self.read(org, &rule).await?.is_none() {
            return Err(AdvisorError::NotFound(rule.to_string()));
        }
        self.aggregator
            .update_ack(org, user, &rule, justification)
            .await?;

        self.read(org, &rule)
            .await?
            .map(Acknowledgement::from)
            .ok_or_else(|| AdvisorError::NotFound(rule.to_string()))
    }

    /// Remove an existing acknowledgement; absent ⇒ NotFound without a delete call
    pub async fn delete(&self, org: OrgId, selector: &str) -> Result<()> {
        let rule = CompositeRuleId::parse(selector)?;

        if self.read(org, &rule).await?.is_none() {
            return Err(AdvisorError::NotFound(rule.to_string()));
        }
        info!(org_id = %org, rule = %rule, "deleting acknowledgement");
        self.aggregator.delete_ack(org, &rule).await
    }

    async fn read(
        &self,
        org: OrgId,
        rule: &CompositeRuleId,
    ) -> Result<Option<SystemWideRuleDisable>> {
        self.aggregator.read_ack(org, rule).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AggregatorCall, InMemoryAggregator};
    use advisor_core::ErrorKind;

    const RULE: &str = "ccx_rules_ocp.external.rules.foo|FOO_KEY";

    fn rule() -> CompositeRuleId {
        CompositeRuleId::parse(RULE).unwrap()
    }

    fn store(aggregator: InMemoryAggregator) -> (AckStore, Arc<InMemoryAggregator>) {
        let aggregator = Arc::new(aggregator);
        (AckStore::new(aggregator.clone()), aggregator)
    }

    fn creates(agg: &InMemoryAggregator) -> usize {
        agg.count_calls(|c| matches!(c, AggregatorCall::CreateAck(_)))
    }

    #[tokio::test]
    async fn test_first_acknowledge_creates_once() {
        let (store, agg) = store(InMemoryAggregator::new());

        let outcome = store
            .acknowledge(OrgId(1), &UserId::new("1"), RULE, "justification test")
            .await
            .unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.ack.justification, "justification test");
        assert_eq!(outcome.ack.rule, RULE);
        assert_eq!(creates(&agg), 1);
        assert_eq!(
            agg.calls(),
            vec![
                AggregatorCall::ReadAck(rule()),
                AggregatorCall::CreateAck(rule()),
                AggregatorCall::ReadAck(rule()),
            ]
        );
    }

    #[tokio::test]
    async fn test_existing_acknowledge_skips_create() {
        let (store, agg) = store(InMemoryAggregator::new().with_ack(OrgId(1), &rule(), "old"));

        let outcome = store
            .acknowledge(OrgId(1), &UserId::new("1"), RULE, "new")
            .await
            .unwrap();

        assert!(!outcome.created);
        assert_eq!(outcome.ack.justification, "old");
        assert_eq!(creates(&agg), 0);
    }

    #[tokio::test]
    async fn test_malformed_selector_makes_no_call() {
        let (store, agg) = store(InMemoryAggregator::new());

        for selector in ["foo", "foo|", "|KEY", "foo|bar|baz", "foo-bar|KEY"] {
            let err = store
                .acknowledge(OrgId(1), &UserId::new("1"), selector, "x")
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadRequest);
            assert!(store.delete(OrgId(1), selector).await.is_err());
            assert!(store.get(OrgId(1), selector).await.is_err());
        }
        assert!(agg.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_absent_is_not_found() {
        let (store, agg) = store(InMemoryAggregator::new());

        let err = store.delete(OrgId(1), RULE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            agg.count_calls(|c| matches!(c, AggregatorCall::DeleteAck(_))),
            0
        );
    }

    #[tokio::test]
    async fn test_delete_existing() {
        let (store, agg) = store(InMemoryAggregator::new().with_ack(OrgId(1), &rule(), "x"));

        store.delete(OrgId(1), RULE).await.unwrap();
        assert_eq!(
            agg.count_calls(|c| matches!(c, AggregatorCall::DeleteAck(_))),
            1
        );
        assert!(!store.is_acknowledged(OrgId(1), &rule()).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let (store, _agg) = store(InMemoryAggregator::new().with_ack(OrgId(1), &rule(), "x"));
        let user = UserId::new("1");

        let first = store.update(OrgId(1), &user, RULE, "same").await.unwrap();
        let second = store.update(OrgId(1), &user, RULE, "same").await.unwrap();
        assert_eq!(first.justification, "same");
        assert_eq!(first.justification, second.justification);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_update_absent_is_not_found() {
        let (store, agg) = store(InMemoryAggregator::new());

        let err = store
            .update(OrgId(1), &UserId::new("1"), RULE, "x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            agg.count_calls(|c| matches!(c, AggregatorCall::UpdateAck(_))),
            0
        );
    }

    #[tokio::test]
    async fn test_acks_are_scoped_by_org() {
        let (store, _agg) = store(InMemoryAggregator::new().with_ack(OrgId(1), &rule(), "x"));

        assert_eq!(store.list(OrgId(1)).await.unwrap().len(), 1);
        assert!(store.list(OrgId(2)).await.unwrap().is_empty());
        assert!(store.index(OrgId(1)).await.unwrap().contains(&rule()));
        assert_eq!(
            store.get(OrgId(2), RULE).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_aggregator_down_is_unavailable() {
        let (store, agg) = store(InMemoryAggregator::new());
        agg.set_unavailable(true);

        let err = store.list(OrgId(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(err.to_string(), "Aggregator service is unreachable");
    }
}
