use serde_json::Value;
use std::sync::Arc;
use synapse_monitoring::EngineMetrics;
use tracing::{debug, info, instrument};

use super::session_manager::SessionManager;
use super::ConflictRetry;
use crate::config::EngineConfig;
use crate::domain::identifiers::{ModeId, RuleId, SessionId};
use crate::domain::knowledge::OwnerScope;
use crate::domain::repository::{Storage, Write, WriteBatch};
use crate::domain::rule::{evaluate_rules, visible_rules, Rule, RuleEvaluation};
use crate::{CoreError, CoreResult};

/// Rule administration and evaluation
pub struct RuleEngine {
    storage: Arc<dyn Storage>,
    sessions: Arc<SessionManager>,
    config: Arc<EngineConfig>,
}

impl RuleEngine {
    /// Create a new rule engine
    pub fn new(storage: Arc<dyn Storage>, sessions: Arc<SessionManager>, config: Arc<EngineConfig>) -> Self {
        Self {
            storage,
            sessions,
            config,
        }
    }

    /// Evaluate the rules visible to `scope` against `context`
    #[instrument(skip(self, context), fields(scope = %scope))]
    pub async fn evaluate(&self, scope: OwnerScope, context: &Value) -> CoreResult<RuleEvaluation> {
        let (rules, mode_id) = self.load_rules(scope).await?;
        let evaluation = evaluate_rules(&rules, scope, mode_id, context);
        debug!(
            candidates = rules.len(),
            matched = evaluation.actions.len(),
            unmet_mandatory = evaluation.unmet_mandatory.len(),
            "Rules evaluated"
        );
        EngineMetrics::record_rule_evaluation(
            &scope.to_string(),
            rules.len(),
            evaluation.actions.len(),
            evaluation.unmet_mandatory.len(),
        );
        Ok(evaluation)
    }

    /// Evaluate the owning instance's rules against a session's context
    pub async fn evaluate_for_session(&self, session_id: SessionId) -> CoreResult<RuleEvaluation> {
        let (session, _, context) = self.sessions.evaluation_context(session_id).await?;
        self.evaluate(OwnerScope::Instance(session.instance_id), &context).await
    }

    /// Active rules visible to `scope`, in evaluation order
    pub async fn get_active_rules(&self, scope: OwnerScope) -> CoreResult<Vec<Rule>> {
        let (rules, mode_id) = self.load_rules(scope).await?;
        Ok(visible_rules(&rules, scope, mode_id).into_iter().cloned().collect())
    }

    /// Store a new rule.
    ///
    /// `overrides` is only allowed on instance rules and must name a rule of
    /// the instance's mode.
    #[instrument(skip(self, rule), fields(rule_id = %rule.id, scope = %rule.scope))]
    pub async fn create_rule(&self, rule: Rule) -> CoreResult<RuleId> {
        if rule.version != 0 {
            return Err(CoreError::ValidationError(format!("rule {} is already stored", rule.id)));
        }
        if rule.name.trim().is_empty() {
            return Err(CoreError::ValidationError("rule name must not be empty".into()));
        }
        let mode_id = self.mode_of(rule.scope).await?;
        if let Some(target) = rule.overrides {
            if !rule.is_instance_rule() {
                return Err(CoreError::ValidationError("only instance rules may override".into()));
            }
            let overridden = self
                .storage
                .get_rule(&target)
                .await?
                .ok_or_else(|| CoreError::not_found("Rule", target))?;
            if overridden.scope != OwnerScope::Mode(mode_id) {
                return Err(CoreError::ValidationError(format!(
                    "rule {} does not belong to mode {}",
                    target, mode_id
                )));
            }
        }

        let rule_id = rule.id;
        self.storage.commit(WriteBatch::single(Write::Rule(rule))).await?;
        info!("Rule created");
        Ok(rule_id)
    }

    /// Activate or deactivate a rule
    pub async fn set_rule_active(&self, rule_id: RuleId, active: bool) -> CoreResult<Rule> {
        let mut retry = ConflictRetry::new("set_rule_active", self.config.max_conflict_retries);
        loop {
            let mut rule = self
                .storage
                .get_rule(&rule_id)
                .await?
                .ok_or_else(|| CoreError::not_found("Rule", rule_id))?;
            if rule.active == active {
                return Ok(rule);
            }
            rule.active = active;
            rule.touch();
            match self.storage.commit(WriteBatch::single(Write::Rule(rule.clone()))).await {
                Ok(_) => {
                    rule.version += 1;
                    info!(rule_id = %rule_id, active, "Rule activation changed");
                    return Ok(rule);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }

    pub async fn get_rule(&self, rule_id: RuleId) -> CoreResult<Option<Rule>> {
        Ok(self.storage.get_rule(&rule_id).await?)
    }

    /// One consistent read of every rule that can be visible to `scope`
    async fn load_rules(&self, scope: OwnerScope) -> CoreResult<(Vec<Rule>, Option<ModeId>)> {
        match scope {
            OwnerScope::Mode(mode_id) => {
                self.mode_of(scope).await?;
                Ok((self.storage.rules_for(&mode_id, None).await?, None))
            }
            OwnerScope::Instance(instance_id) => {
                let mode_id = self.mode_of(scope).await?;
                let rules = self.storage.rules_for(&mode_id, Some(&instance_id)).await?;
                Ok((rules, Some(mode_id)))
            }
        }
    }

    /// Mode owning `scope`; fails if the owner does not exist
    async fn mode_of(&self, scope: OwnerScope) -> CoreResult<ModeId> {
        match scope {
            OwnerScope::Mode(mode_id) => self
                .storage
                .get_mode(&mode_id)
                .await?
                .map(|mode| mode.id)
                .ok_or_else(|| CoreError::not_found("AgentMode", mode_id)),
            OwnerScope::Instance(instance_id) => self
                .storage
                .get_instance(&instance_id)
                .await?
                .map(|instance| instance.mode_id)
                .ok_or_else(|| CoreError::not_found("AgentInstance", instance_id)),
        }
    }
}
