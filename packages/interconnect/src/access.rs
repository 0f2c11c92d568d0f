//! Access-control gate.
//!
//! The gate answers three questions (may this actor emit, update state,
//! execute a workflow step). Enforcement is opt-in:
//!
//! - no [`AccessPolicy`] configured → allow
//! - no [`ActorContext`] on the call → allow
//!
//! The policy is injected once, when the interconnect is built.
//!
//! # Permission strings
//!
//! [`PermissionPolicy`] grants by permission strings held by the actor
//! directly or through one of its roles:
//!
//! | Permission                     | Grants                               |
//! |--------------------------------|--------------------------------------|
//! | `*`                            | everything                           |
//! | `emit:<type>` / `emit:*`       | emitting that event type / any       |
//! | `state:<component>` / `state:*`| updating that component's state / any|
//! | `workflow:<component>:<action>`| that action on that component        |
//! | `workflow:<component>:*`       | any action on that component         |
//! | `workflow:*`                   | any workflow step                    |
//!
//! An actor whose id equals a component id may always update that
//! component's own state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::warn;

use crate::core::{ActorContext, ComponentId, Target};

/// Policy provider consulted by the gate.
pub trait AccessPolicy: Send + Sync + 'static {
    fn can_emit(
        &self,
        actor: &ActorContext,
        event_type: &str,
        source: &ComponentId,
        target: Option<&Target>,
    ) -> bool;

    fn can_update_state(&self, actor: &ActorContext, component_id: &ComponentId) -> bool;

    fn can_execute_workflow_step(
        &self,
        actor: &ActorContext,
        component_id: &ComponentId,
        action: &str,
    ) -> bool;
}

/// Permissive-by-default wrapper around an optional policy.
#[derive(Clone, Default)]
pub struct AccessGate {
    policy: Option<Arc<dyn AccessPolicy>>,
}

impl AccessGate {
    /// Gate without a policy: every check passes.
    pub fn permissive() -> Self {
        Self { policy: None }
    }

    pub fn with_policy(policy: Arc<dyn AccessPolicy>) -> Self {
        Self {
            policy: Some(policy),
        }
    }

    pub fn is_enforcing(&self) -> bool {
        self.policy.is_some()
    }

    pub fn can_emit(
        &self,
        actor: Option<&ActorContext>,
        event_type: &str,
        source: &ComponentId,
        target: Option<&Target>,
    ) -> bool {
        let (Some(policy), Some(actor)) = (&self.policy, actor) else {
            return true;
        };
        let allowed = policy.can_emit(actor, event_type, source, target);
        if !allowed {
            warn!(
                actor = %actor.actor_id,
                event_type,
                source = %source,
                target = ?target,
                "emit denied"
            );
        }
        allowed
    }

    pub fn can_update_state(
        &self,
        actor: Option<&ActorContext>,
        component_id: &ComponentId,
    ) -> bool {
        let (Some(policy), Some(actor)) = (&self.policy, actor) else {
            return true;
        };
        let allowed = policy.can_update_state(actor, component_id);
        if !allowed {
            warn!(actor = %actor.actor_id, component = %component_id, "state update denied");
        }
        allowed
    }

    pub fn can_execute_workflow_step(
        &self,
        actor: Option<&ActorContext>,
        component_id: &ComponentId,
        action: &str,
    ) -> bool {
        let (Some(policy), Some(actor)) = (&self.policy, actor) else {
            return true;
        };
        let allowed = policy.can_execute_workflow_step(actor, component_id, action);
        if !allowed {
            warn!(
                actor = %actor.actor_id,
                component = %component_id,
                action,
                "workflow step denied"
            );
        }
        allowed
    }
}

impl std::fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGate")
            .field("enforcing", &self.is_enforcing())
            .finish()
    }
}

/// Rule-based policy over permission strings and role grants.
///
/// # Example
///
/// ```ignore
/// let policy = PermissionPolicy::new()
///     .grant_role("editor", ["emit:*", "state:design-surface"])
///     .grant_role("operator", ["workflow:*"]);
///
/// let hub = InterconnectBuilder::new()
///     .with_access_policy(policy)
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct PermissionPolicy {
    role_grants: HashMap<String, BTreeSet<String>>,
}

impl PermissionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_role<I, S>(mut self, role: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.role_grants
            .entry(role.into())
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    fn holds(&self, actor: &ActorContext, permission: &str) -> bool {
        let direct = actor.permissions.contains(permission);
        direct
            || actor.roles.iter().any(|role| {
                self.role_grants
                    .get(role)
                    .is_some_and(|grants| grants.contains(permission))
            })
    }

    fn holds_any(&self, actor: &ActorContext, candidates: &[String]) -> bool {
        self.holds(actor, "*") || candidates.iter().any(|p| self.holds(actor, p))
    }
}

impl AccessPolicy for PermissionPolicy {
    fn can_emit(
        &self,
        actor: &ActorContext,
        event_type: &str,
        _source: &ComponentId,
        _target: Option<&Target>,
    ) -> bool {
        self.holds_any(actor, &[format!("emit:{}", event_type), "emit:*".into()])
    }

    fn can_update_state(&self, actor: &ActorContext, component_id: &ComponentId) -> bool {
        if actor.actor_id == component_id.as_str() {
            return true;
        }
        self.holds_any(actor, &[format!("state:{}", component_id), "state:*".into()])
    }

    fn can_execute_workflow_step(
        &self,
        actor: &ActorContext,
        component_id: &ComponentId,
        action: &str,
    ) -> bool {
        self.holds_any(
            actor,
            &[
                format!("workflow:{}:{}", component_id, action),
                format!("workflow:{}:*", component_id),
                "workflow:*".into(),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAll;

    impl AccessPolicy for DenyAll {
        fn can_emit(&self, _: &ActorContext, _: &str, _: &ComponentId, _: Option<&Target>) -> bool {
            false
        }
        fn can_update_state(&self, _: &ActorContext, _: &ComponentId) -> bool {
            false
        }
        fn can_execute_workflow_step(&self, _: &ActorContext, _: &ComponentId, _: &str) -> bool {
            false
        }
    }

    fn id(raw: &str) -> ComponentId {
        ComponentId::from(raw)
    }

    #[test]
    fn test_permissive_without_policy() {
        let gate = AccessGate::permissive();
        let actor = ActorContext::new("mallory");

        assert!(!gate.is_enforcing());
        assert!(gate.can_emit(Some(&actor), "ping", &id("a"), None));
        assert!(gate.can_update_state(Some(&actor), &id("a")));
        assert!(gate.can_execute_workflow_step(Some(&actor), &id("a"), "run"));
    }

    #[test]
    fn test_permissive_without_actor() {
        let gate = AccessGate::with_policy(Arc::new(DenyAll));

        assert!(gate.can_emit(None, "ping", &id("a"), None));
        assert!(gate.can_update_state(None, &id("a")));
        assert!(gate.can_execute_workflow_step(None, &id("a"), "run"));
    }

    #[test]
    fn test_policy_applies_with_actor() {
        let gate = AccessGate::with_policy(Arc::new(DenyAll));
        let actor = ActorContext::new("mallory");

        assert!(!gate.can_emit(Some(&actor), "ping", &id("a"), None));
        assert!(!gate.can_update_state(Some(&actor), &id("a")));
        assert!(!gate.can_execute_workflow_step(Some(&actor), &id("a"), "run"));
    }

    #[test]
    fn test_permission_policy_role_grants() {
        let policy = PermissionPolicy::new()
            .grant_role("editor", ["emit:selection-changed", "state:design-surface"])
            .grant_role("operator", ["workflow:catalog:*"]);

        let editor = ActorContext::new("alice").with_role("editor");
        let operator = ActorContext::new("bob").with_role("operator");

        assert!(policy.can_emit(&editor, "selection-changed", &id("a"), None));
        assert!(!policy.can_emit(&editor, "delete-all", &id("a"), None));
        assert!(policy.can_update_state(&editor, &id("design-surface")));
        assert!(!policy.can_update_state(&editor, &id("catalog")));

        assert!(policy.can_execute_workflow_step(&operator, &id("catalog"), "reindex"));
        assert!(!policy.can_execute_workflow_step(&operator, &id("lineage"), "reindex"));
    }

    #[test]
    fn test_permission_policy_direct_and_wildcard() {
        let policy = PermissionPolicy::new();

        let direct = ActorContext::new("carol").with_permission("workflow:lineage:trace");
        assert!(policy.can_execute_workflow_step(&direct, &id("lineage"), "trace"));
        assert!(!policy.can_execute_workflow_step(&direct, &id("lineage"), "purge"));

        let root = ActorContext::new("root").with_permission("*");
        assert!(policy.can_emit(&root, "anything", &id("a"), Some(&Target::All)));
        assert!(policy.can_update_state(&root, &id("b")));
    }

    #[test]
    fn test_owner_may_update_own_state() {
        let policy = PermissionPolicy::new();
        let owner = ActorContext::new("quality-panel");

        assert!(policy.can_update_state(&owner, &id("quality-panel")));
        assert!(!policy.can_update_state(&owner, &id("lineage-graph")));
    }
}
