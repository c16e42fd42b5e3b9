//! Comms: liveness of the control channel with the front-end.
//!
//! The front-end side is bootstrapped by a transient `<script>` (see
//! [`bootstrap`]) which opens a Jupyter "comm" back to the kernel. This module
//! owns the kernel side of that connection:
//!
//! - installing the bootstrap script, and re-installing it when the
//!   connection went stale (e.g. the browser reloaded)
//! - the `comm_open` / `comm_close` handshake
//! - heartbeat ping/pong used to confirm the front-end is still listening
//! - routing of `comm_msg` by `data.address`
//!
//! All state lives behind a single lock. The lock is held for the whole of
//! each entry point except while waiting on a heartbeat, so that the pong
//! (which arrives through [`CommChannel::handle_message`] on another task) can
//! get in and resolve it.

pub mod bootstrap;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::latch::Latch;
use crate::message::{DisplayData, Message};

/// Protocol-private address of a heartbeat request.
pub const HEARTBEAT_PING_ADDRESS: &str = "#heartbeat/ping";

/// Protocol-private address of a heartbeat reply.
pub const HEARTBEAT_PONG_ADDRESS: &str = "#heartbeat/pong";

/// Comm target the bootstrap script opens.
pub const DEFAULT_TARGET_NAME: &str = "gonb_comm";

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(500);

/// Silence after which an installed connection is re-confirmed.
pub const HEARTBEAT_REQUEST_THRESHOLD: Duration = Duration::from_secs(1);

const MIME_TEXT_HTML: &str = "text/html";

#[derive(Debug, Clone)]
pub struct CommsConfig {
    pub target_name: String,
    pub heartbeat_timeout: Duration,
    pub heartbeat_threshold: Duration,
    /// Replaces the built-in bootstrap script.
    pub bootstrap_script: Option<String>,
}

impl CommsConfig {
    pub fn new() -> Self {
        Self {
            target_name: DEFAULT_TARGET_NAME.to_string(),
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            heartbeat_threshold: HEARTBEAT_REQUEST_THRESHOLD,
            bootstrap_script: None,
        }
    }

    pub fn with_target_name(mut self, target_name: impl Into<String>) -> Self {
        self.target_name = target_name.into();
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_heartbeat_threshold(mut self, threshold: Duration) -> Self {
        self.heartbeat_threshold = threshold;
        self
    }

    pub fn with_bootstrap_script(mut self, script: impl Into<String>) -> Self {
        self.bootstrap_script = Some(script.into());
        self
    }

    fn script(&self) -> String {
        match &self.bootstrap_script {
            Some(script) => script.clone(),
            None => bootstrap::default_script(&self.target_name),
        }
    }
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("failed to publish bootstrap script: {0}")]
    Install(#[source] anyhow::Error),
    #[error("failed to send comm_msg: {0}")]
    Send(#[source] anyhow::Error),
    #[error("failed to send comm_close: {0}")]
    Close(#[source] anyhow::Error),
    #[error("comm channel is not open")]
    NotOpened,
}

#[derive(Default)]
struct CommState {
    /// Bootstrap script handed to the front-end. Installed doesn't mean
    /// connected: the comm_open may still be on its way, or never come.
    installed: bool,

    /// Display id of the transient output holding the bootstrap script, so it
    /// can be blanked once the connection is up.
    transient_display_id: String,

    opened: bool,
    comm_id: String,

    last_activity: Option<Instant>,

    /// Present exactly while a heartbeat ping is outstanding.
    pending_heartbeat: Option<Arc<Latch<bool>>>,
}

impl CommState {
    fn recently_active(&self, threshold: Duration) -> bool {
        self.last_activity
            .is_some_and(|at| at.elapsed() <= threshold)
    }

    fn reset(&mut self) {
        self.comm_id.clear();
        self.opened = false;
        self.installed = false;
    }
}

/// Snapshot of the channel state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommStatus {
    pub installed: bool,
    pub opened: bool,
    pub comm_id: String,
    pub transient_display_id: String,
    pub heartbeat_pending: bool,
}

/// Kernel side of the front-end control channel. One per kernel.
pub struct CommChannel {
    config: CommsConfig,
    state: Mutex<CommState>,
}

impl CommChannel {
    pub fn new(config: CommsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CommState::default()),
        }
    }

    pub fn config(&self) -> &CommsConfig {
        &self.config
    }

    pub async fn status(&self) -> CommStatus {
        let state = self.state.lock().await;
        CommStatus {
            installed: state.installed,
            opened: state.opened,
            comm_id: state.comm_id.clone(),
            transient_display_id: state.transient_display_id.clone(),
            heartbeat_pending: state.pending_heartbeat.is_some(),
        }
    }

    /// Makes sure the bootstrap script is installed in the front-end.
    ///
    /// Cheap when the front-end was heard from recently. Otherwise an open
    /// connection is confirmed with a heartbeat; if that times out the
    /// connection is considered stale and the script is published again
    /// under a new transient display id.
    pub async fn ensure_installed(&self, msg: &dyn Message) -> Result<(), CommsError> {
        let mut state = self.state.lock().await;

        if state.installed {
            if state.recently_active(self.config.heartbeat_threshold) {
                tracing::debug!("Comms already installed");
                return Ok(());
            }

            if state.opened && !state.comm_id.is_empty() {
                tracing::debug!(comm_id = %state.comm_id, "Confirming comms installation with heartbeat");
                let (guard, heartbeat) = self
                    .send_heartbeat_ping_locked(state, msg, self.config.heartbeat_timeout)
                    .await?;
                state = guard;
                if heartbeat {
                    tracing::debug!("Heartbeat pong received, comms healthy");
                    return Ok(());
                }
                tracing::debug!("Heartbeat timed out, not heard back");
            }

            // Likely a stale connection (browser reloaded): start over.
            state.reset();
        }

        self.install_locked(&mut state, msg).await
    }

    async fn install_locked(
        &self,
        state: &mut CommState,
        msg: &dyn Message,
    ) -> Result<(), CommsError> {
        let display_id = uuid::Uuid::new_v4().to_string();
        state.transient_display_id = display_id.clone();

        let data = DisplayData::new()
            .with_data(MIME_TEXT_HTML, bootstrap::as_html(&self.config.script()))
            .with_display_id(display_id);

        match msg.publish_update_display_data(data).await {
            Ok(()) => {
                state.installed = true;
                state.last_activity = Some(Instant::now());
                tracing::info!(
                    display_id = %state.transient_display_id,
                    "Installed comms bootstrap script, waiting for connection"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to publish comms bootstrap script, widgets won't work");
                Err(CommsError::Install(e))
            }
        }
    }

    /// Handles a `comm_open` from the front-end.
    ///
    /// Opens addressed to another target, or without a `comm_id`, are not for
    /// us: they are ignored without error.
    pub async fn handle_open(&self, msg: &dyn Message) -> Result<(), CommsError> {
        let mut state = self.state.lock().await;

        let content = msg.content();
        if !content.is_object() {
            tracing::debug!("Ignored comm_open without content");
            return Ok(());
        }

        match content.get("target_name").and_then(Value::as_str) {
            Some(target) if target == self.config.target_name => {}
            other => {
                tracing::debug!(target_name = ?other, "Ignored comm_open for unknown target");
                return Ok(());
            }
        }

        let Some(comm_id) = content
            .get("comm_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        else {
            tracing::debug!("Ignored comm_open without comm_id");
            return Ok(());
        };
        let comm_id = comm_id.to_string();

        if state.opened {
            self.close_locked(&mut state, msg).await?;
        }

        // Blank the bootstrap script so it isn't saved with the notebook.
        if !state.transient_display_id.is_empty() {
            let erase = DisplayData::new()
                .with_data(MIME_TEXT_HTML, "")
                .with_display_id(state.transient_display_id.clone());
            if let Err(e) = msg.publish_update_display_data(erase).await {
                tracing::warn!(error = %e, "Failed to erase comms bootstrap script");
            }
        }

        state.comm_id = comm_id;
        state.opened = true;
        state.installed = true;
        state.last_activity = Some(Instant::now());
        tracing::info!(comm_id = %state.comm_id, "Comm opened");

        self.send_locked(&state, msg, json!({ "open_ack": true }))
            .await
    }

    /// Handles a `comm_msg` from the front-end.
    pub async fn handle_message(&self, msg: &dyn Message) -> Result<(), CommsError> {
        let mut state = self.state.lock().await;

        let content = msg.content();
        let Some(fields) = content.as_object() else {
            tracing::warn!("Ignored comm_msg without content");
            return Ok(());
        };

        let Some(comm_id) = fields.get("comm_id").and_then(Value::as_str) else {
            tracing::warn!("Ignored comm_msg without comm_id");
            return Ok(());
        };
        if comm_id.is_empty() || comm_id != state.comm_id {
            tracing::warn!(
                comm_id,
                expected = %state.comm_id,
                "Ignored comm_msg for a different comm_id"
            );
            return Ok(());
        }

        let Some(address) = content.pointer("/data/address").and_then(Value::as_str) else {
            tracing::warn!(comm_id, "Ignored comm_msg without data.address");
            return Ok(());
        };

        state.last_activity = Some(Instant::now());

        match address {
            // Either address counts as proof of life.
            HEARTBEAT_PONG_ADDRESS | HEARTBEAT_PING_ADDRESS => {
                Self::handle_pong_locked(&state);
                Ok(())
            }
            _ => {
                tracing::warn!(address, "comm_msg dropped, no recipients for address");
                Ok(())
            }
        }
    }

    /// Closes the connection with the front-end, sending a `comm_close`.
    pub async fn close(&self, msg: &dyn Message) -> Result<(), CommsError> {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state, msg).await
    }

    async fn close_locked(&self, state: &mut CommState, msg: &dyn Message) -> Result<(), CommsError> {
        if !state.opened {
            tracing::debug!("Comm not opened, nothing to close");
            return Ok(());
        }
        tracing::debug!(comm_id = %state.comm_id, "Closing comm");
        let result = msg
            .reply("comm_close", json!({ "comm_id": state.comm_id }))
            .await;
        state.reset();
        result.map_err(CommsError::Close)
    }

    /// Sends `data` to the front-end as a `comm_msg` on the open comm.
    pub async fn send(&self, msg: &dyn Message, data: Value) -> Result<(), CommsError> {
        let state = self.state.lock().await;
        if !state.opened {
            return Err(CommsError::NotOpened);
        }
        self.send_locked(&state, msg, data).await
    }

    async fn send_locked(
        &self,
        state: &CommState,
        msg: &dyn Message,
        data: Value,
    ) -> Result<(), CommsError> {
        let content = json!({
            "comm_id": state.comm_id,
            "data": data,
        });
        tracing::debug!(comm_id = %state.comm_id, "Sending comm_msg");
        msg.publish("comm_msg", content)
            .await
            .map_err(CommsError::Send)
    }

    /// Sends a heartbeat ping and waits for the pong.
    ///
    /// Returns `true` if the pong arrived in time, `false` if it timed out.
    /// If a ping is already outstanding this joins it, and the outstanding
    /// ping's timeout applies instead of `timeout`.
    pub async fn send_heartbeat_and_wait(
        &self,
        msg: &dyn Message,
        timeout: Duration,
    ) -> Result<bool, CommsError> {
        let state = self.state.lock().await;
        let (_state, heartbeat) = self.send_heartbeat_ping_locked(state, msg, timeout).await?;
        Ok(heartbeat)
    }

    /// Releases `state` while waiting and returns it reacquired.
    async fn send_heartbeat_ping_locked<'a>(
        &'a self,
        mut state: MutexGuard<'a, CommState>,
        msg: &dyn Message,
        timeout: Duration,
    ) -> Result<(MutexGuard<'a, CommState>, bool), CommsError> {
        let outstanding = state
            .pending_heartbeat
            .as_ref()
            .filter(|latch| !latch.is_triggered())
            .cloned();

        let latch = match outstanding {
            Some(latch) => {
                tracing::warn!("Heartbeat ping requested while one is outstanding, reusing it");
                latch
            }
            None => {
                tracing::debug!("Sending heartbeat ping");
                self.send_locked(
                    &state,
                    msg,
                    json!({ "address": HEARTBEAT_PING_ADDRESS, "value": true }),
                )
                .await?;

                let latch = Arc::new(Latch::new());
                state.pending_heartbeat = Some(Arc::clone(&latch));
                let timer = Arc::clone(&latch);
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    // No-op if the pong got there first.
                    timer.trigger(false);
                });
                latch
            }
        };

        drop(state);
        let heartbeat = latch.wait().await;
        let mut state = self.state.lock().await;

        // Another ping may have been started in between: only clear our own.
        if state
            .pending_heartbeat
            .as_ref()
            .is_some_and(|pending| Arc::ptr_eq(pending, &latch))
        {
            state.pending_heartbeat = None;
        }
        Ok((state, heartbeat))
    }

    fn handle_pong_locked(state: &CommState) {
        match &state.pending_heartbeat {
            Some(latch) => {
                tracing::debug!("Heartbeat pong received");
                latch.trigger(true);
            }
            None => tracing::warn!("Heartbeat pong received with no ping outstanding"),
        }
    }
}

impl Default for CommChannel {
    fn default() -> Self {
        Self::new(CommsConfig::default())
    }
}
