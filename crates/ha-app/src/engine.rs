//! The state-and-action engine.
//!
//! Tracks the last-known role of every configured VRRP session, dispatches
//! go-active actions to a bounded worker pool on inactive-to-active edges,
//! and runs the periodic consistency check that re-asserts the cloud side
//! for every session currently believed active.
//!
//! Concurrency model: observations arrive serialized from the single
//! telemetry stream and are the only writer of session state; the
//! consistency check only reads. Worker tasks never touch session state,
//! they only execute the immutable action bound at dispatch time.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use ha_aws::{AwsError, CloudClient};
use ha_common::{DisconnectReason, VrrpEvent, VrrpRole, VrrpSession};
use ha_telemetry::TelemetryHandler;

use crate::config::{Action, ActionTable};

/// Fixed size of the go-active worker pool. Matches the maximum number of
/// supported sessions, balancing parallel dispatch against excessive
/// context switching. Bounded, so a misbehaving peer cannot exhaust
/// resources.
pub const WORKER_POOL_SIZE: usize = 8;

pub struct Engine {
    actions: ActionTable,
    sessions: DashMap<VrrpSession, VrrpRole>,
    cloud: Arc<dyn CloudClient>,
    pool: Arc<Semaphore>,
    check_interval: Duration,
}

impl Engine {
    /// Build the engine with every configured session inactive.
    pub fn new(actions: ActionTable, cloud: Arc<dyn CloudClient>, check_interval: Duration) -> Self {
        let sessions = actions
            .sessions()
            .map(|session| (session.clone(), VrrpRole::Inactive))
            .collect();
        Self {
            actions,
            sessions,
            cloud,
            pool: Arc::new(Semaphore::new(WORKER_POOL_SIZE)),
            check_interval,
        }
    }

    /// Confirm every cloud resource referenced by a registered action
    /// exists. Called once at startup; failures are fatal.
    pub async fn validate_resources(&self) -> Result<(), AwsError> {
        for (session, action) in self.actions.iter() {
            match action {
                Action::ActivateVip(vip) => {
                    self.cloud.indexed_eni(vip.device_index)?;
                }
                Action::UpdateRouteTable(route) => {
                    self.cloud.validate_route_table(&route.route_table_id).await?;
                    self.cloud
                        .validate_network_interface(&route.target_network_interface)
                        .await?;
                }
            }
            info!(session = %session, action = %action, "Registered action");
        }
        Ok(())
    }

    /// The current role of a configured session.
    pub fn role(&self, session: &VrrpSession) -> Option<VrrpRole> {
        self.sessions.get(session).map(|role| *role)
    }

    /// Record one role observation, dispatching the bound action on an
    /// inactive-to-active edge. Never blocks on the cloud: the action runs
    /// on the worker pool.
    pub fn observe(&self, event: VrrpEvent) {
        let Some(action) = self.actions.get(&event.session) else {
            debug!(session = %event.session, "Ignoring event for unregistered session");
            return;
        };
        let prior = self
            .sessions
            .insert(event.session.clone(), event.role)
            .unwrap_or(VrrpRole::Inactive);
        debug!(
            session = %event.session,
            role = %event.role,
            prior = %prior,
            "VRRP state observation"
        );
        if prior == VrrpRole::Inactive && event.role == VrrpRole::Active {
            self.dispatch_go_active(event.session, action.clone());
        }
    }

    /// Submit a go-active task to the worker pool.
    fn dispatch_go_active(&self, session: VrrpSession, action: Action) {
        if self.pool.available_permits() == 0 {
            // Unexpected with a pool sized to the session count; may
            // indicate workers getting stuck.
            warn!(
                "Worker pool for performing actions is full, \
                 go-active events may be delayed"
            );
        }
        let cloud = Arc::clone(&self.cloud);
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let _permit = match pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // pool closed, shutting down
            };
            info!(session = %session, action = %action, "Go active");
            match execute(cloud.as_ref(), &action, false).await {
                Ok(()) => info!(session = %session, "Successful go-active"),
                Err(err) => {
                    // Not retried here: the next consistency check pass
                    // picks up the discrepancy while the session remains
                    // active.
                    error!(
                        session = %session,
                        action = %action,
                        error = %err,
                        "Go-active action failed"
                    );
                }
            }
        });
    }

    /// Run consistency checks until the process exits.
    ///
    /// Runs in the caller's task, never on the worker pool, so a slow
    /// pass cannot delay edge-triggered go-active dispatch.
    pub async fn run_consistency_checks(&self) {
        info!(
            interval_seconds = self.check_interval.as_secs(),
            "Starting consistency checks"
        );
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; consume
        // it so the first pass happens one interval after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.check_consistency_once().await;
        }
    }

    /// One consistency-check pass: re-assert the cloud side (with
    /// precheck) for every session currently believed active.
    pub async fn check_consistency_once(&self) {
        for session in self.actions.sessions() {
            let active = self
                .sessions
                .get(session)
                .map(|role| *role == VrrpRole::Active)
                .unwrap_or(false);
            if !active {
                continue;
            }
            let Some(action) = self.actions.get(session) else {
                continue;
            };
            debug!(session = %session, "Performing consistency check");
            if let Err(err) = execute(self.cloud.as_ref(), action, true).await {
                error!(
                    session = %session,
                    action = %action,
                    error = %err,
                    "Consistency check action failed"
                );
            }
        }
    }
}

impl TelemetryHandler for Engine {
    fn on_connect(&self, peer: &str) {
        info!(peer = %peer, "Telemetry peer connected");
    }

    fn handle_event(&self, event: VrrpEvent) {
        self.observe(event);
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        // With the peer gone the local view is stale; the peer may have
        // promoted the other router. Resetting stops the consistency
        // check from fighting the now-active partner. The peer re-sends
        // current state on reconnect.
        debug!(reason = %reason, "Marking all VRRP sessions as inactive");
        for mut entry in self.sessions.iter_mut() {
            *entry.value_mut() = VrrpRole::Inactive;
        }
    }
}

async fn execute(
    cloud: &dyn CloudClient,
    action: &Action,
    precheck: bool,
) -> Result<(), AwsError> {
    match action {
        Action::ActivateVip(vip) => cloud.assign_vip(vip.device_index, vip.vip, precheck).await,
        Action::UpdateRouteTable(route) => {
            cloud
                .update_route_table(
                    &route.route_table_id,
                    route.destination,
                    &route.target_network_interface,
                    precheck,
                )
                .await
        }
    }
}
