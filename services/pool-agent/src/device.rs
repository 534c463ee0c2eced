//! Device RPC surface.
//!
//! A [`Device`] is a simulated client living inside one worker process.
//! Every operation is a bounded call through the remote call facade.
//! Session facts (login, remote id, fingerprint) are cached on first use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use devpool_proto::{AssetsVersion, MessageInfo, Reaction, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, RpcError};
use crate::rpc::RemoteEntity;
use crate::worker::WorkerProcess;

/// Width remote ids are padded to.
pub const DEVICE_ID_WIDTH: usize = 16;

/// Left-pads a remote device id with `0` to [`DEVICE_ID_WIDTH`] characters.
///
/// Workers sometimes render ids without leading zeros, while consumers
/// expect fixed-width ids.
pub fn normalize_device_id(raw: &str) -> String {
    format!("{:0>width$}", raw, width = DEVICE_ID_WIDTH)
}

/// Account a device logs in with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

/// Settings for devices created by the pool.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub action_timeout: Duration,
    pub login_settle_delay: Duration,
}

#[derive(Debug, Default)]
struct SessionFacts {
    credentials: Option<LoginCredentials>,
    remote_id: Option<String>,
    fingerprint: Option<String>,
}

pub struct Device {
    name: String,
    host: Arc<WorkerProcess>,
    remote: RemoteEntity,
    facts: Mutex<SessionFacts>,
    login_settle_delay: Duration,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("endpoint", &self.remote.name())
            .field("host", &self.host.name())
            .finish()
    }
}

impl Device {
    /// Asks `host` to create a device named `name`.
    pub async fn spawn_on(
        host: Arc<WorkerProcess>,
        name: &str,
        options: &DeviceOptions,
    ) -> Result<Self, DeviceError> {
        let device_ref = spawn_remote(&host, name, options.action_timeout).await?;
        let remote = RemoteEntity::new(device_ref.name().to_string(), options.action_timeout);
        remote.attach(device_ref).await;

        info!(worker = %host.name(), device = remote.name(), name, "Device spawned");
        Ok(Self {
            name: name.to_string(),
            host,
            remote,
            facts: Mutex::new(SessionFacts::default()),
            login_settle_delay: options.login_settle_delay,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Re-creates the device on its host, after the host was restarted.
    ///
    /// Cached session facts belong to the old remote device and are dropped.
    pub async fn respawn(&self) -> Result<(), DeviceError> {
        let endpoint =
            spawn_remote(&self.host, &self.name, self.remote.default_timeout()).await?;
        self.remote.attach(endpoint).await;
        *self.facts.lock().await = SessionFacts::default();
        self.destroyed.store(false, Ordering::SeqCst);
        info!(worker = %self.host.name(), name = %self.name, "Device respawned");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Arc<WorkerProcess> {
        &self.host
    }

    pub async fn has_logged_in_user(&self) -> bool {
        self.facts.lock().await.credentials.is_some()
    }

    pub async fn logged_in_as(&self) -> Option<String> {
        self.facts
            .lock()
            .await
            .credentials
            .as_ref()
            .map(|c| c.email.clone())
    }

    /// Sends `request` and expects a `Successful` reply.
    async fn expect_success(&self, request: Request) -> Result<Option<String>, DeviceError> {
        let op = request.op();
        match self.remote.ask(request).await? {
            Response::Successful { response } => Ok(response),
            Response::Failed { reason } => Err(RpcError::Remote {
                endpoint: self.remote.name().to_string(),
                op,
                reason,
            }
            .into()),
            other => Err(self.unexpected("successful", &other).into()),
        }
    }

    async fn expect_text(&self, request: Request) -> Result<String, DeviceError> {
        let op = request.op();
        self.expect_success(request).await?.ok_or_else(|| {
            RpcError::Remote {
                endpoint: self.remote.name().to_string(),
                op,
                reason: "empty response".to_string(),
            }
            .into()
        })
    }

    fn unexpected(&self, expected: &'static str, got: &Response) -> RpcError {
        RpcError::UnexpectedResponse {
            endpoint: self.remote.name().to_string(),
            expected,
            got: got.kind(),
        }
    }

    /// Logs in unless a user is already logged in.
    pub async fn log_in(&self, credentials: &LoginCredentials) -> Result<(), DeviceError> {
        if self.has_logged_in_user().await {
            debug!(device = self.remote.name(), "Already logged in");
            return Ok(());
        }

        let request = Request::Login {
            email: credentials.email.clone(),
            password: credentials.password.clone(),
        };
        match self.remote.ask(request).await? {
            Response::Successful { .. } => {}
            Response::Failed { reason } => {
                return Err(DeviceError::LoginRejected {
                    email: credentials.email.clone(),
                    reason,
                })
            }
            other => return Err(self.unexpected("successful", &other).into()),
        }

        self.facts.lock().await.credentials = Some(credentials.clone());
        info!(device = self.remote.name(), email = %credentials.email, "Logged in");

        // Key generation on the remote side finishes shortly after login.
        tokio::time::sleep(self.login_settle_delay).await;
        Ok(())
    }

    pub async fn set_label(&self, label: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::SetLabel {
            label: label.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn send_text(&self, conv_id: &str, text: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::SendText {
            conv_id: conv_id.to_string(),
            text: text.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn send_image(&self, conv_id: &str, path: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::SendImage {
            conv_id: conv_id.to_string(),
            path: path.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn send_giphy(&self, conv_id: &str, query: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::SendGiphy {
            conv_id: conv_id.to_string(),
            query: query.to_string(),
        })
        .await
        .map(drop)
    }

    /// Knock.
    pub async fn send_ping(&self, conv_id: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::Knock {
            conv_id: conv_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn typing(&self, conv_id: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::Typing {
            conv_id: conv_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn clear_conversation(&self, conv_id: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::ClearConversation {
            conv_id: conv_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn mute(&self, conv_id: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::MuteConversation {
            conv_id: conv_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn unmute(&self, conv_id: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::UnmuteConversation {
            conv_id: conv_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn archive(&self, conv_id: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::ArchiveConversation {
            conv_id: conv_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn unarchive(&self, conv_id: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::UnarchiveConversation {
            conv_id: conv_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn send_file(
        &self,
        conv_id: &str,
        path: &str,
        mime: &str,
    ) -> Result<(), DeviceError> {
        self.expect_success(Request::SendFile {
            conv_id: conv_id.to_string(),
            path: path.to_string(),
            mime: mime.to_string(),
        })
        .await
        .map(drop)
    }

    /// Deletes a message locally.
    pub async fn delete_message(&self, conv_id: &str, message_id: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::DeleteMessage {
            conv_id: conv_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await
        .map(drop)
    }

    /// Recalls a message for every participant.
    pub async fn delete_message_everywhere(
        &self,
        conv_id: &str,
        message_id: &str,
    ) -> Result<(), DeviceError> {
        self.expect_success(Request::RecallMessage {
            conv_id: conv_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn update_message(&self, message_id: &str, text: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::UpdateText {
            message_id: message_id.to_string(),
            text: text.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn conversation_messages(
        &self,
        conv_id: &str,
    ) -> Result<Vec<MessageInfo>, DeviceError> {
        let request = Request::GetMessages {
            conv_id: conv_id.to_string(),
        };
        match self.remote.ask(request).await? {
            Response::Messages { messages } => Ok(messages),
            Response::Failed { reason } => Err(RpcError::Remote {
                endpoint: self.remote.name().to_string(),
                op: "get_messages",
                reason,
            }
            .into()),
            other => Err(self.unexpected("messages", &other).into()),
        }
    }

    /// Reacts to a message with `like` or `unlike`.
    pub async fn react(
        &self,
        conv_id: &str,
        message_id: &str,
        reaction: &str,
    ) -> Result<(), DeviceError> {
        let reaction: Reaction = reaction.parse()?;
        self.expect_success(Request::SetReaction {
            conv_id: conv_id.to_string(),
            message_id: message_id.to_string(),
            reaction,
        })
        .await
        .map(drop)
    }

    pub async fn share_location(
        &self,
        conv_id: &str,
        lon: f32,
        lat: f32,
        address: &str,
        zoom: i32,
    ) -> Result<(), DeviceError> {
        self.expect_success(Request::SendLocation {
            conv_id: conv_id.to_string(),
            lon,
            lat,
            address: address.to_string(),
            zoom,
        })
        .await
        .map(drop)
    }

    pub async fn set_ephemeral(
        &self,
        conv_id: &str,
        expiration_ms: u64,
    ) -> Result<(), DeviceError> {
        self.expect_success(Request::SetEphemeral {
            conv_id: conv_id.to_string(),
            expiration_ms,
        })
        .await
        .map(drop)
    }

    pub async fn mark_ephemeral_read(
        &self,
        conv_id: &str,
        message_id: &str,
    ) -> Result<(), DeviceError> {
        self.expect_success(Request::MarkEphemeralRead {
            conv_id: conv_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await
        .map(drop)
    }

    /// Remote numeric id, normalized to a fixed width. Cached.
    pub async fn remote_id(&self) -> Result<String, DeviceError> {
        if let Some(id) = self.facts.lock().await.remote_id.clone() {
            return Ok(id);
        }

        let id = normalize_device_id(&self.expect_text(Request::GetDeviceId).await?);
        self.facts.lock().await.remote_id = Some(id.clone());
        Ok(id)
    }

    /// Fingerprint of the device's identity key. Cached.
    pub async fn fingerprint(&self) -> Result<String, DeviceError> {
        if let Some(fingerprint) = self.facts.lock().await.fingerprint.clone() {
            return Ok(fingerprint);
        }

        let fingerprint = self.expect_text(Request::GetFingerprint).await?;
        self.facts.lock().await.fingerprint = Some(fingerprint.clone());
        Ok(fingerprint)
    }

    /// Selects the assets protocol, `2` or `3`.
    pub async fn set_assets_version(&self, version: &str) -> Result<(), DeviceError> {
        let version: AssetsVersion = version.parse()?;
        self.expect_success(Request::SetAssetsVersion { version })
            .await
            .map(drop)
    }

    pub async fn cancel_connection(&self, user_id: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::CancelConnection {
            user_id: user_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn unique_username(&self) -> Result<String, DeviceError> {
        self.expect_text(Request::GetUserName).await
    }

    pub async fn update_unique_username(&self, name: &str) -> Result<(), DeviceError> {
        self.expect_success(Request::UpdateUserName {
            name: name.to_string(),
        })
        .await
        .map(drop)
    }

    /// Sends the remote teardown signal. Only the first call sends it.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.remote.tell(Request::Stop).await {
            Ok(()) => debug!(device = self.remote.name(), "Device destroyed"),
            Err(e) => warn!(device = self.remote.name(), error = %e, "Failed to destroy device"),
        }
    }

    /// Runs one [`DeviceAction`].
    pub async fn perform(&self, action: DeviceAction) -> Result<ActionOutcome, DeviceError> {
        use DeviceAction as A;

        let done = |r: Result<(), DeviceError>| r.map(|()| ActionOutcome::Done);
        match action {
            A::LogIn(credentials) => done(self.log_in(&credentials).await),
            A::SetLabel { label } => done(self.set_label(&label).await),
            A::SendText { conv_id, text } => done(self.send_text(&conv_id, &text).await),
            A::SendImage { conv_id, path } => done(self.send_image(&conv_id, &path).await),
            A::SendGiphy { conv_id, query } => done(self.send_giphy(&conv_id, &query).await),
            A::SendPing { conv_id } => done(self.send_ping(&conv_id).await),
            A::Typing { conv_id } => done(self.typing(&conv_id).await),
            A::ClearConversation { conv_id } => done(self.clear_conversation(&conv_id).await),
            A::Mute { conv_id } => done(self.mute(&conv_id).await),
            A::Unmute { conv_id } => done(self.unmute(&conv_id).await),
            A::Archive { conv_id } => done(self.archive(&conv_id).await),
            A::Unarchive { conv_id } => done(self.unarchive(&conv_id).await),
            A::SendFile {
                conv_id,
                path,
                mime,
            } => done(self.send_file(&conv_id, &path, &mime).await),
            A::DeleteMessage {
                conv_id,
                message_id,
            } => done(self.delete_message(&conv_id, &message_id).await),
            A::DeleteMessageEverywhere {
                conv_id,
                message_id,
            } => done(self.delete_message_everywhere(&conv_id, &message_id).await),
            A::UpdateMessage { message_id, text } => {
                done(self.update_message(&message_id, &text).await)
            }
            A::ConversationMessages { conv_id } => self
                .conversation_messages(&conv_id)
                .await
                .map(ActionOutcome::Messages),
            A::React {
                conv_id,
                message_id,
                reaction,
            } => done(self.react(&conv_id, &message_id, &reaction).await),
            A::ShareLocation {
                conv_id,
                lon,
                lat,
                address,
                zoom,
            } => done(self.share_location(&conv_id, lon, lat, &address, zoom).await),
            A::SetEphemeral {
                conv_id,
                expiration_ms,
            } => done(self.set_ephemeral(&conv_id, expiration_ms).await),
            A::MarkEphemeralRead {
                conv_id,
                message_id,
            } => done(self.mark_ephemeral_read(&conv_id, &message_id).await),
            A::RemoteId => self.remote_id().await.map(ActionOutcome::Text),
            A::Fingerprint => self.fingerprint().await.map(ActionOutcome::Text),
            A::SetAssetsVersion { version } => done(self.set_assets_version(&version).await),
            A::CancelConnection { user_id } => done(self.cancel_connection(&user_id).await),
            A::UniqueUsername => self.unique_username().await.map(ActionOutcome::Text),
            A::UpdateUniqueUsername { name } => done(self.update_unique_username(&name).await),
        }
    }
}

async fn spawn_remote(
    host: &WorkerProcess,
    name: &str,
    timeout: Duration,
) -> Result<Arc<dyn crate::rpc::Endpoint>, DeviceError> {
    let spawn_failed = |source| DeviceError::SpawnFailed {
        name: name.to_string(),
        worker: host.name().to_string(),
        source,
    };

    let endpoint = host
        .endpoint()
        .await
        .ok_or_else(|| spawn_failed(RpcError::NotConnected(host.name().to_string())))?;
    let request = Request::SpawnDevice {
        name: name.to_string(),
    };
    match crate::rpc::call(endpoint.as_ref(), request, timeout).await {
        Ok(Response::DeviceSpawned { device_ref }) => Ok(endpoint.child(&device_ref)),
        Ok(Response::Failed { reason }) => Err(spawn_failed(RpcError::Remote {
            endpoint: endpoint.name().to_string(),
            op: "spawn_device",
            reason,
        })),
        Ok(other) => Err(spawn_failed(RpcError::UnexpectedResponse {
            endpoint: endpoint.name().to_string(),
            expected: "device_spawned",
            got: other.kind(),
        })),
        Err(e) => Err(spawn_failed(e)),
    }
}

/// An operation run against a leased device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeviceAction {
    LogIn(LoginCredentials),
    SetLabel { label: String },
    SendText { conv_id: String, text: String },
    SendImage { conv_id: String, path: String },
    SendGiphy { conv_id: String, query: String },
    SendPing { conv_id: String },
    Typing { conv_id: String },
    ClearConversation { conv_id: String },
    Mute { conv_id: String },
    Unmute { conv_id: String },
    Archive { conv_id: String },
    Unarchive { conv_id: String },
    SendFile { conv_id: String, path: String, mime: String },
    DeleteMessage { conv_id: String, message_id: String },
    DeleteMessageEverywhere { conv_id: String, message_id: String },
    UpdateMessage { message_id: String, text: String },
    ConversationMessages { conv_id: String },
    React {
        conv_id: String,
        message_id: String,
        reaction: String,
    },
    ShareLocation {
        conv_id: String,
        lon: f32,
        lat: f32,
        address: String,
        zoom: i32,
    },
    SetEphemeral { conv_id: String, expiration_ms: u64 },
    MarkEphemeralRead { conv_id: String, message_id: String },
    RemoteId,
    Fingerprint,
    SetAssetsVersion { version: String },
    CancelConnection { user_id: String },
    UniqueUsername,
    UpdateUniqueUsername { name: String },
}

impl DeviceAction {
    /// Everything except logging in needs an active session.
    pub fn requires_login(&self) -> bool {
        !matches!(self, DeviceAction::LogIn(_))
    }
}

/// Result of a [`DeviceAction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ActionOutcome {
    Done,
    Text(String),
    Messages(Vec<MessageInfo>),
}
