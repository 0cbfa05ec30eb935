//! Undo stack for a partially applied setup.
//!
//! Each forward step that changes the host pushes the action that reverses
//! it. On failure the stack is unwound newest first. Undo failures are
//! logged and swallowed: the runtime follows a failed ADD with a DEL.

use std::net::IpAddr;

use tracing::{debug, warn};

use super::link::LinkPairManager;
use super::route::RouteManager;
use super::rule::{PriorityRuleManager, RuleSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    /// Delete the host end of a veth pair (takes the peer with it).
    DeleteLink { name: String },
    /// Delete the full-length host route to a pod address.
    DeleteHostRoute { ip: IpAddr, oif: u32 },
    /// Delete a policy rule by exact match.
    DeleteRule(RuleSpec),
}

impl std::fmt::Display for UndoAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeleteLink { name } => write!(f, "delete link {name}"),
            Self::DeleteHostRoute { ip, oif } => write!(f, "delete route {ip} dev {oif}"),
            Self::DeleteRule(spec) => write!(f, "delete rule {spec}"),
        }
    }
}

/// Host-namespace managers the undo actions run against.
pub struct UndoContext<'a> {
    pub links: &'a LinkPairManager,
    pub routes: &'a RouteManager,
    pub rules: &'a PriorityRuleManager,
}

#[derive(Debug, Default)]
pub struct Rollback {
    actions: Vec<UndoAction>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pending actions in the order they will run.
    pub fn pending(&self) -> impl Iterator<Item = &UndoAction> {
        self.actions.iter().rev()
    }

    /// Forget everything; the setup completed.
    pub fn commit(mut self) {
        self.actions.clear();
    }

    /// Run every action, newest first. Returns how many failed.
    pub async fn unwind(mut self, ctx: &UndoContext<'_>) -> usize {
        let mut failed = 0;
        while let Some(action) = self.actions.pop() {
            let res = match &action {
                UndoAction::DeleteLink { name } => ctx.links.destroy(name).await.map(drop),
                UndoAction::DeleteHostRoute { ip, oif } => {
                    ctx.routes.remove_host_route(*ip, *oif).await.map(drop)
                }
                UndoAction::DeleteRule(spec) => ctx.rules.remove(spec).await.map(drop),
            };
            match res {
                Ok(()) => debug!(%action, "rolled back"),
                Err(err) => {
                    failed += 1;
                    warn!(%action, error = %err, "rollback step failed");
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_runs_newest_first() {
        let mut rollback = Rollback::new();
        rollback.push(UndoAction::DeleteLink {
            name: "veth1".to_string(),
        });
        rollback.push(UndoAction::DeleteHostRoute {
            ip: "169.10.0.10".parse().unwrap(),
            oif: 4,
        });
        rollback.push(UndoAction::DeleteRule(RuleSpec::to_container(
            "169.10.0.10".parse().unwrap(),
        )));

        let order: Vec<String> = rollback.pending().map(ToString::to_string).collect();
        assert_eq!(
            order,
            vec![
                "delete rule 512: from all to 169.10.0.10/32 lookup 254",
                "delete route 169.10.0.10 dev 4",
                "delete link veth1",
            ]
        );
        assert_eq!(rollback.len(), 3);
    }

    #[test]
    fn new_stack_is_empty() {
        let rollback = Rollback::new();
        assert!(rollback.is_empty());
        rollback.commit();
    }
}
