//! The state reconciler.
//!
//! Polls remote state for a set of process handles, grouped by instance,
//! with one combined status command per instance. Each returned
//! `uid,pid,state[(n)]` line updates the matching process's pid and
//! lifecycle state. In blocking mode the poll repeats on a fixed interval
//! until every tracked process has been seen at least once and matches
//! the caller's target mask; non-blocking mode polls exactly once. The
//! remote report is authoritative — no transition legality is enforced.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use airlift_core::entity::{InstanceId, RunState, SharedProcess, StateMask};
use airlift_core::registry::Inventory;
use airlift_remote::traits::{ConnectTarget, RemoteConnection, RemoteExecutor};

use crate::error::EngineResult;
use crate::fanout::{self, fan_out};

/// Fixed interval between polls in blocking mode.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Strips the parenthetical suffix a state token may carry ("aborted(1)").
fn paren_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([0-9]+\)").expect("static regex"))
}

/// Polls instances for process state.
pub struct Reconciler<R: RemoteExecutor> {
    executor: R,
    poll_interval: Duration,
}

impl<R: RemoteExecutor> Reconciler<R> {
    pub fn new(executor: R) -> Self {
        Self {
            executor,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the poll interval (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll once and record the best-known state of every process.
    pub async fn refresh(
        &self,
        inventory: &Arc<Inventory>,
        processes: &[SharedProcess],
    ) -> EngineResult<()> {
        self.reconcile(inventory, processes, StateMask::ANY, false)
            .await
    }

    /// Block until every process has been retrieved and its state is
    /// within `mask`.
    pub async fn wait_for(
        &self,
        inventory: &Arc<Inventory>,
        processes: &[SharedProcess],
        mask: StateMask,
    ) -> EngineResult<()> {
        self.reconcile(inventory, processes, mask, true).await
    }

    async fn reconcile(
        &self,
        inventory: &Arc<Inventory>,
        processes: &[SharedProcess],
        mask: StateMask,
        block: bool,
    ) -> EngineResult<()> {
        // Group handles by owning instance; each group is one worker with
        // its own connection.
        let mut groups: HashMap<InstanceId, Vec<SharedProcess>> = HashMap::new();
        for process in processes {
            let instance_id = process.read().await.instance;
            groups.entry(instance_id).or_default().push(process.clone());
        }

        let interval = self.poll_interval;
        let work: Vec<(InstanceId, Vec<SharedProcess>)> = groups.into_iter().collect();
        let results = fan_out(work, |instance_id, group| {
            let executor = self.executor.clone();
            let inventory = inventory.clone();
            async move {
                poll_instance(&executor, &inventory, instance_id, group, mask, block, interval)
                    .await
            }
        })
        .await;
        fanout::successes(results);
        Ok(())
    }
}

/// Poll one instance's processes until satisfied (or once).
async fn poll_instance<R: RemoteExecutor>(
    executor: &R,
    inventory: &Arc<Inventory>,
    instance_id: InstanceId,
    group: Vec<SharedProcess>,
    mask: StateMask,
    block: bool,
    interval: Duration,
) -> EngineResult<()> {
    let instance = inventory.instances[instance_id].read().await.clone();
    let target = ConnectTarget::for_instance(&instance)?;
    let conn = executor.connect(&target).await?;

    // Per-uid tracking: seen in at least one reply, and state matched.
    let mut retrieved: HashMap<String, bool> = HashMap::new();
    let mut matched: HashMap<String, bool> = HashMap::new();
    for process in &group {
        let uid = process.read().await.uid.clone();
        retrieved.insert(uid.clone(), false);
        matched.insert(uid, false);
    }

    loop {
        let command = status_command(&group).await;
        debug!(instance = %instance.name, command = %command, "polling state");
        let output = conn.exec(&command).await?;

        for line in output.stdout.lines() {
            let Some((uid, pid, state_token)) = parse_status_line(line) else {
                warn!(line, "malformed status line");
                continue;
            };
            if !retrieved.contains_key(uid) {
                // Benign: batched updates can answer for runs this call
                // did not ask about.
                debug!(uid, "status for unrequested uid");
                continue;
            }

            let state = match RunState::parse(state_token) {
                Some(state) => state,
                None => {
                    warn!(token = state_token, "unrecognized remote state");
                    RunState::Unknown
                }
            };

            for process in &group {
                let mut process = process.write().await;
                if process.uid != uid {
                    continue;
                }
                // Batched launches have no pid until the remote side
                // reports one.
                if process.pid.is_none() {
                    process.pid = pid;
                }
                process.state = state;
                debug!(uid = %process.uid, state = ?state, pid = ?process.pid, "process updated");
            }
            retrieved.insert(uid.to_string(), true);
            matched.insert(uid.to_string(), mask.contains(state));
        }

        if !block {
            return Ok(());
        }
        let all_retrieved = retrieved.values().all(|&seen| seen);
        if all_retrieved && matched.values().all(|&ok| ok) {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

/// One combined status invocation listing every process of the group.
async fn status_command(group: &[SharedProcess]) -> String {
    let mut command = String::from("$HOME/run/state.sh");
    for process in group {
        let process = process.read().await;
        let pid = process
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".to_string());
        command.push_str(&format!(
            " {} {} {} {pid} \"{}\"",
            process.env_name, process.job_hash, process.uid, process.output_file
        ));
    }
    command
}

/// Split `uid,pid,state[(n)]`; returns the state token with the
/// parenthetical stripped.
fn parse_status_line(line: &str) -> Option<(&str, Option<u32>, &str)> {
    let mut parts = line.trim().splitn(3, ',');
    let uid = parts.next()?;
    let pid_token = parts.next()?;
    let state_raw = parts.next()?;
    let pid = pid_token.parse::<u32>().ok();
    let state = match paren_suffix().find(state_raw) {
        Some(m) => &state_raw[..m.start()],
        None => state_raw,
    };
    Some((uid, pid, state.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_status_line() {
        let (uid, pid, state) = parse_status_line("abc123,4242,running").unwrap();
        assert_eq!(uid, "abc123");
        assert_eq!(pid, Some(4242));
        assert_eq!(state, "running");
    }

    #[test]
    fn strips_parenthetical_suffix() {
        let (_, _, state) = parse_status_line("abc,none,aborted(137)").unwrap();
        assert_eq!(state, "aborted");
        assert_eq!(RunState::parse(state), Some(RunState::Aborted));
    }

    #[test]
    fn none_pid_token_maps_to_no_pid() {
        let (_, pid, _) = parse_status_line("abc,none,wait").unwrap();
        assert_eq!(pid, None);
        let (_, pid, _) = parse_status_line("abc,None,wait").unwrap();
        assert_eq!(pid, None);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse_status_line("only-one-field").is_none());
        assert!(parse_status_line("two,fields").is_none());
        assert!(parse_status_line("").is_none());
    }

    #[test]
    fn case_insensitive_state_tokens() {
        let (_, _, state) = parse_status_line("abc,1,DONE").unwrap();
        assert_eq!(RunState::parse(state), Some(RunState::Done));
    }
}
