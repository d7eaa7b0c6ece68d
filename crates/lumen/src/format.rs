//! Human-readable CLI output. `--json` output bypasses this module.

use lumen_mesh::{MeshEvent, MeshStatus};
use lumen_registry::{ControllerInfo, ControllerState, GroupRecord};

/// Format: `ID\tHOSTNAME\tIP\tSTATE`
pub fn host_line(info: &ControllerInfo) {
    println!(
        "{}\t{}\t{}\t{}",
        info.id,
        or_dash(&info.hostname),
        or_dash(&info.ip_address),
        state_label(info.state)
    );
}

/// Format: `ID\tNAME\tMEMBERS`
pub fn group_line(group: &GroupRecord) {
    let members = group
        .controller_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    println!("{}\t{}\t{}", group.id, group.name, members);
}

pub fn identity(id: &str, hostname: &str) {
    println!("id:       {id}");
    println!("hostname: {hostname}");
}

/// Print a mesh event as one line: `[KIND]\tDETAIL`
pub fn event_line(event: &MeshEvent) {
    match event {
        MeshEvent::HostVisible { id, hostname, ip } => {
            println!("[visible]\t{id}\t{hostname}\t{ip}")
        }
        MeshEvent::HostOffline { id } => println!("[offline]\t{id}"),
        MeshEvent::HostExpired { id } => println!("[expired]\t{id}"),
        MeshEvent::LeadershipChanged { is_leader } => {
            println!("[leader]\t{}", if *is_leader { "acquired" } else { "released" })
        }
        MeshEvent::GroupLeadershipChanged { group_id, leading } => println!(
            "[group]\t{group_id}\t{}",
            if *leading { "acquired" } else { "released" }
        ),
    }
}

pub fn status_summary(status: &MeshStatus) {
    println!("{} ({})", status.hostname, status.id);
    println!(
        "  Leader:   {}",
        if status.election.is_leader { "yes" } else { "no" }
    );
    println!("  Visible:  {}/{}", status.visible, status.known);
    if !status.leading_groups.is_empty() {
        let groups = status
            .leading_groups
            .iter()
            .map(|g| g.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!("  Leading:  {groups}");
    }
}

fn state_label(state: ControllerState) -> &'static str {
    match state {
        ControllerState::NotFound => "not-found",
        ControllerState::Incomplete => "incomplete",
        ControllerState::Offline => "offline",
        ControllerState::Online => "online",
    }
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}
