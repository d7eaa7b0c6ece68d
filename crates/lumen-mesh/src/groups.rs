//! Per-group leader election.
//!
//! Recomputed wholesale on every check. The authority domain is the
//! configured member list, reachable or not, and there is no failsafe:
//! the highest configured member leads.

use std::collections::BTreeSet;

use lumen_common::types::{ControllerId, GroupId};
use lumen_registry::GroupRecord;

use crate::election::has_highest_id;

/// Changes needed to move from the current led set to the target one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPlan {
    /// Groups this node is a member of.
    pub member_of: Vec<GroupId>,
    /// Groups this node should lead.
    pub to_lead: BTreeSet<GroupId>,
    /// Newly led: `(id, name)`.
    pub become_leader: Vec<(GroupId, String)>,
    /// No longer led.
    pub relinquish: Vec<GroupId>,
}

impl GroupPlan {
    pub fn is_noop(&self) -> bool {
        self.become_leader.is_empty() && self.relinquish.is_empty()
    }
}

pub fn plan(own_id: ControllerId, groups: &[GroupRecord], leading: &[GroupId]) -> GroupPlan {
    let mut plan = GroupPlan::default();

    for group in groups {
        if !group.has_member(own_id) {
            continue;
        }
        plan.member_of.push(group.id);
        if has_highest_id(own_id, group.controller_ids.iter().copied()) {
            plan.to_lead.insert(group.id);
            if !leading.contains(&group.id) {
                plan.become_leader.push((group.id, group.name.clone()));
            }
        }
    }
    plan.member_of.sort();

    plan.relinquish = leading
        .iter()
        .copied()
        .filter(|id| !plan.to_lead.contains(id))
        .collect();
    plan
}
