//! In-memory simulated devices.
//!
//! Each device keeps just enough state to answer the requests the agent
//! sends: a login, a random numeric id, a fingerprint, a username and a
//! per-conversation message log.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use devpool_proto::{AssetsVersion, MessageInfo, Request, Response};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// One simulated client.
#[derive(Debug)]
pub struct SimDevice {
    name: String,
    label: Option<String>,
    user: Option<String>,
    remote_id: u64,
    fingerprint: String,
    username: String,
    assets: AssetsVersion,
    conversations: HashMap<String, Vec<MessageInfo>>,
    muted: HashSet<String>,
    archived: HashSet<String>,
    ephemeral: HashMap<String, u64>,
}

impl SimDevice {
    fn new(name: &str) -> Self {
        let remote_id: u64 = rand::random();
        let fingerprint = hex::encode(Sha256::digest(format!("{}:{:x}", name, remote_id)));
        Self {
            name: name.to_string(),
            label: None,
            user: None,
            remote_id,
            fingerprint,
            username: format!("user{}", rand::random::<u32>()),
            assets: AssetsVersion::V3,
            conversations: HashMap::new(),
            muted: HashSet::new(),
            archived: HashSet::new(),
            ephemeral: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn is_muted(&self, conv_id: &str) -> bool {
        self.muted.contains(conv_id)
    }

    pub fn is_archived(&self, conv_id: &str) -> bool {
        self.archived.contains(conv_id)
    }

    pub fn assets_version(&self) -> AssetsVersion {
        self.assets
    }

    pub fn ephemeral_timeout(&self, conv_id: &str) -> Option<u64> {
        self.ephemeral.get(conv_id).copied()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn post(&mut self, conv_id: &str, kind: &str) -> Response {
        let message = MessageInfo {
            message_id: uuid::Uuid::new_v4().to_string(),
            time_ms: Utc::now().timestamp_millis(),
            kind: kind.to_string(),
        };
        let id = message.message_id.clone();
        self.conversations
            .entry(conv_id.to_string())
            .or_default()
            .push(message);
        Response::ok_with(id)
    }

    fn find_message(&mut self, message_id: &str) -> Option<&mut MessageInfo> {
        self.conversations
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|m| m.message_id == message_id)
    }

    fn remove_message(&mut self, conv_id: &str, message_id: &str) -> Response {
        let Some(messages) = self.conversations.get_mut(conv_id) else {
            return Response::failed(format!("unknown conversation {}", conv_id));
        };
        let before = messages.len();
        messages.retain(|m| m.message_id != message_id);
        if messages.len() == before {
            Response::failed(format!("unknown message {}", message_id))
        } else {
            Response::ok()
        }
    }

    fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Echo { msg } => return Response::Echo { msg },
            Request::SetLabel { label } => {
                self.label = Some(label);
                return Response::ok();
            }
            Request::Login { email, password } => {
                if password.is_empty() {
                    return Response::failed("invalid credentials");
                }
                info!(device = %self.name, %email, "Logged in");
                self.user = Some(email);
                return Response::ok();
            }
            _ => {}
        }

        if self.user.is_none() {
            return Response::failed("no user is logged in");
        }

        match request {
            Request::SendText { conv_id, .. } => self.post(&conv_id, "text"),
            Request::SendImage { conv_id, .. } => self.post(&conv_id, "image"),
            Request::SendGiphy { conv_id, .. } => self.post(&conv_id, "giphy"),
            Request::Knock { conv_id } => self.post(&conv_id, "knock"),
            Request::SendFile { conv_id, .. } => self.post(&conv_id, "file"),
            Request::SendLocation { conv_id, .. } => self.post(&conv_id, "location"),
            Request::Typing { .. } | Request::CancelConnection { .. } => Response::ok(),
            Request::ClearConversation { conv_id } => {
                self.conversations.remove(&conv_id);
                Response::ok()
            }
            Request::MuteConversation { conv_id } => {
                self.muted.insert(conv_id);
                Response::ok()
            }
            Request::UnmuteConversation { conv_id } => {
                self.muted.remove(&conv_id);
                Response::ok()
            }
            Request::ArchiveConversation { conv_id } => {
                self.archived.insert(conv_id);
                Response::ok()
            }
            Request::UnarchiveConversation { conv_id } => {
                self.archived.remove(&conv_id);
                Response::ok()
            }
            Request::DeleteMessage {
                conv_id,
                message_id,
            }
            | Request::RecallMessage {
                conv_id,
                message_id,
            } => self.remove_message(&conv_id, &message_id),
            Request::UpdateText { message_id, .. } => match self.find_message(&message_id) {
                Some(message) => {
                    message.kind = "text_edited".to_string();
                    Response::ok()
                }
                None => Response::failed(format!("unknown message {}", message_id)),
            },
            Request::GetMessages { conv_id } => Response::Messages {
                messages: self
                    .conversations
                    .get(&conv_id)
                    .cloned()
                    .unwrap_or_default(),
            },
            Request::SetReaction { message_id, .. } => match self.find_message(&message_id) {
                Some(_) => Response::ok(),
                None => Response::failed(format!("unknown message {}", message_id)),
            },
            Request::SetEphemeral {
                conv_id,
                expiration_ms,
            } => {
                self.ephemeral.insert(conv_id, expiration_ms);
                Response::ok()
            }
            Request::MarkEphemeralRead {
                conv_id,
                message_id,
            } => self.remove_message(&conv_id, &message_id),
            // Rendered without leading zeros on purpose.
            Request::GetDeviceId => Response::ok_with(format!("{:x}", self.remote_id)),
            Request::GetFingerprint => Response::ok_with(self.fingerprint.clone()),
            Request::SetAssetsVersion { version } => {
                self.assets = version;
                Response::ok()
            }
            Request::GetUserName => Response::ok_with(self.username.clone()),
            Request::UpdateUserName { name } => {
                if name.trim().is_empty() {
                    return Response::failed("username must not be empty");
                }
                self.username = name;
                Response::ok()
            }
            other => Response::failed(format!("'{}' is not a device request", other.op())),
        }
    }
}

/// Devices hosted by this worker, keyed by device reference.
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: HashMap<String, SimDevice>,
    next_ref: u64,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, device_ref: &str) -> Option<&SimDevice> {
        self.devices.get(device_ref)
    }

    /// Handles a request addressed to the worker itself.
    pub fn handle_worker(&mut self, request: Request) -> Response {
        match request {
            Request::Echo { msg } => Response::Echo { msg },
            Request::SpawnDevice { name } => {
                self.next_ref += 1;
                let device_ref = format!("d{}", self.next_ref);
                self.devices.insert(device_ref.clone(), SimDevice::new(&name));
                info!(device = %device_ref, %name, "Device spawned");
                Response::DeviceSpawned { device_ref }
            }
            other => Response::failed(format!("'{}' is not a worker request", other.op())),
        }
    }

    /// Handles a request addressed to one device.
    pub fn handle_device(&mut self, device_ref: &str, request: Request) -> Response {
        if matches!(request, Request::Stop) {
            return match self.devices.remove(device_ref) {
                Some(device) => {
                    info!(device = %device_ref, name = %device.name, "Device stopped");
                    Response::Stopped
                }
                None => Response::failed(format!("unknown device {}", device_ref)),
            };
        }

        match self.devices.get_mut(device_ref) {
            Some(device) => {
                debug!(device = %device_ref, op = request.op(), "Handling request");
                device.handle(request)
            }
            None => Response::failed(format!("unknown device {}", device_ref)),
        }
    }

    /// Drops every device.
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpool_proto::Reaction;

    fn spawn(table: &mut DeviceTable, name: &str) -> String {
        match table.handle_worker(Request::SpawnDevice {
            name: name.to_string(),
        }) {
            Response::DeviceSpawned { device_ref } => device_ref,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn login(table: &mut DeviceTable, device_ref: &str) {
        let response = table.handle_device(
            device_ref,
            Request::Login {
                email: "a@example.com".to_string(),
                password: "secret".to_string(),
            },
        );
        assert_eq!(response, Response::ok());
    }

    #[test]
    fn test_actions_require_login() {
        let mut table = DeviceTable::new();
        let device = spawn(&mut table, "alpha");

        let response = table.handle_device(&device, Request::GetDeviceId);
        assert!(matches!(response, Response::Failed { .. }));

        login(&mut table, &device);
        assert!(matches!(
            table.handle_device(&device, Request::GetDeviceId),
            Response::Successful { response: Some(_) }
        ));
    }

    #[test]
    fn test_same_name_gives_distinct_devices() {
        let mut table = DeviceTable::new();
        let first = spawn(&mut table, "alpha");
        let second = spawn(&mut table, "alpha");

        assert_ne!(first, second);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_message_lifecycle() {
        let mut table = DeviceTable::new();
        let device = spawn(&mut table, "beta");
        login(&mut table, &device);

        let message_id = match table.handle_device(
            &device,
            Request::SendText {
                conv_id: "c1".to_string(),
                text: "hello".to_string(),
            },
        ) {
            Response::Successful { response: Some(id) } => id,
            other => panic!("unexpected {:?}", other),
        };

        let reacted = table.handle_device(
            &device,
            Request::SetReaction {
                conv_id: "c1".to_string(),
                message_id: message_id.clone(),
                reaction: Reaction::Like,
            },
        );
        assert_eq!(reacted, Response::ok());

        match table.handle_device(
            &device,
            Request::GetMessages {
                conv_id: "c1".to_string(),
            },
        ) {
            Response::Messages { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].kind, "text");
            }
            other => panic!("unexpected {:?}", other),
        }

        let deleted = table.handle_device(
            &device,
            Request::DeleteMessage {
                conv_id: "c1".to_string(),
                message_id: message_id.clone(),
            },
        );
        assert_eq!(deleted, Response::ok());

        let again = table.handle_device(
            &device,
            Request::DeleteMessage {
                conv_id: "c1".to_string(),
                message_id,
            },
        );
        assert!(matches!(again, Response::Failed { .. }));
    }

    #[test]
    fn test_stop_removes_device() {
        let mut table = DeviceTable::new();
        let device = spawn(&mut table, "gamma");

        assert_eq!(table.handle_device(&device, Request::Stop), Response::Stopped);
        assert!(table.is_empty());
        assert!(matches!(
            table.handle_device(&device, Request::Stop),
            Response::Failed { .. }
        ));
    }

    #[test]
    fn test_fingerprint_is_stable_sha256_hex() {
        let mut table = DeviceTable::new();
        let device = spawn(&mut table, "delta");
        login(&mut table, &device);

        let first = table.handle_device(&device, Request::GetFingerprint);
        let second = table.handle_device(&device, Request::GetFingerprint);
        assert_eq!(first, second);
        match first {
            Response::Successful {
                response: Some(fingerprint),
            } => assert_eq!(fingerprint.len(), 64),
            other => panic!("unexpected {:?}", other),
        }
    }
}
