use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use lumen_common::types::GroupId;
use lumen_mdns::Message;
use lumen_registry::GroupRecord;

use crate::error::Result;
use crate::node::{MeshCore, MeshStatus};
use crate::pinger::ProbeResult;

/// Requests the facade sends into the running core.
pub enum MeshCommand {
    Status {
        reply: oneshot::Sender<MeshStatus>,
    },
    RelinquishLeadership {
        reply: oneshot::Sender<bool>,
    },
    CheckGroupLeadership {
        reply: oneshot::Sender<()>,
    },
    ForgetControllers {
        reply: oneshot::Sender<Result<usize>>,
    },
    SetGroup {
        group: GroupRecord,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveGroup {
        group_id: GroupId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Inputs the loop serializes onto the core.
pub struct RuntimeChannels {
    pub messages: mpsc::UnboundedReceiver<Message>,
    pub probes: mpsc::UnboundedReceiver<ProbeResult>,
    pub commands: mpsc::Receiver<MeshCommand>,
}

/// Drive `core` until `cancel` fires, then withdraw its announcements.
///
/// The first tick happens one interval after start, giving the host
/// announcement time to go out before the first browse.
pub async fn run(
    mut core: MeshCore,
    period: Duration,
    mut channels: RuntimeChannels,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let elapsed = now.duration_since(last_tick).as_secs_f64().round() as u64;
                last_tick = now;
                core.tick(elapsed);
            }
            Some(message) = channels.messages.recv() => {
                let response = core.on_message(&message);
                if !response.is_handled() {
                    tracing::trace!("Message not handled");
                }
            }
            Some(result) = channels.probes.recv() => {
                core.on_probe_result(&result);
            }
            Some(command) = channels.commands.recv() => {
                handle_command(&mut core, command);
            }
        }
    }

    core.shutdown();
}

fn handle_command(core: &mut MeshCore, command: MeshCommand) {
    match command {
        MeshCommand::Status { reply } => {
            let _ = reply.send(core.status());
        }
        MeshCommand::RelinquishLeadership { reply } => {
            let _ = reply.send(core.relinquish_leadership());
        }
        MeshCommand::CheckGroupLeadership { reply } => {
            core.check_group_leadership();
            let _ = reply.send(());
        }
        MeshCommand::ForgetControllers { reply } => {
            let _ = reply.send(core.forget_controllers());
        }
        MeshCommand::SetGroup { group, reply } => {
            let _ = reply.send(core.set_group(group));
        }
        MeshCommand::RemoveGroup { group_id, reply } => {
            let _ = reply.send(core.remove_group(group_id));
        }
    }
}
