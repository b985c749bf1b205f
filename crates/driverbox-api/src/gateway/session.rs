//! Registered subordinate connections and their in-flight controls

use super::{GatewayPayload, PayloadType};
use dashmap::DashMap;
use driverbox_core::{DeviceData, DeviceModel};
use driverbox_plugin::PluginError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway key error")]
    GatewayKey,

    #[error("self register")]
    SelfRegister,

    #[error("already registered")]
    AlreadyRegistered,

    #[error("gateway is not registered")]
    NotRegistered,

    #[error("device id error")]
    DeviceId,

    #[error("{0}")]
    Sync(String),

    /// Local write requested by the master failed
    #[error("{0}")]
    Control(String),
}

type ControlWaiter = oneshot::Sender<Result<(), String>>;

/// One registered subordinate
pub struct Session {
    connection_id: Uuid,
    gateway_key: String,
    outbox: mpsc::UnboundedSender<GatewayPayload>,
    pending: Mutex<VecDeque<ControlWaiter>>,
    /// Models received ahead of the devices that use them
    models: Mutex<Vec<DeviceModel>>,
}

impl Session {
    #[must_use]
    pub fn new(
        connection_id: Uuid,
        gateway_key: impl Into<String>,
        outbox: mpsc::UnboundedSender<GatewayPayload>,
    ) -> Self {
        Self {
            connection_id,
            gateway_key: gateway_key.into(),
            outbox,
            pending: Mutex::new(VecDeque::new()),
            models: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn gateway_key(&self) -> &str {
        &self.gateway_key
    }

    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Send a `control` frame and wait for the matching `controlRes`
    ///
    /// The wire carries no request id, so responses are matched in order.
    pub async fn control(&self, data: DeviceData) -> Result<(), PluginError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            let mut payload = GatewayPayload::new(PayloadType::Control);
            payload.gateway_key.clone_from(&self.gateway_key);
            payload.device_data = Some(data);
            if self.outbox.send(payload).is_err() {
                return Err(PluginError::TransportClosed(self.gateway_key.clone()));
            }
            pending.push_back(tx);
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(PluginError::Remote(reason)),
            Err(_) => Err(PluginError::TransportClosed(self.gateway_key.clone())),
        }
    }

    /// Hand a `controlRes` to the oldest waiting control
    ///
    /// Waiters that gave up (timed out) are skipped. Returns false when no
    /// control was waiting.
    pub fn resolve_control(&self, result: Result<(), String>) -> bool {
        let mut pending = self.pending.lock();
        while let Some(waiter) = pending.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            return waiter.send(result).is_ok();
        }
        false
    }

    pub fn stash_models(&self, models: Vec<DeviceModel>) {
        let mut stash = self.models.lock();
        for model in models {
            match stash.iter_mut().find(|m| m.name == model.name) {
                Some(existing) => *existing = model,
                None => stash.push(model),
            }
        }
    }

    #[must_use]
    pub fn stashed_model(&self, name: &str) -> Option<DeviceModel> {
        self.models.lock().iter().find(|m| m.name == name).cloned()
    }
}

/// Registered subordinates by gateway key
#[derive(Default)]
pub struct GatewaySessions {
    sessions: DashMap<String, Arc<Session>>,
}

impl GatewaySessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; a key held by another live connection is refused
    pub fn register(&self, session: Arc<Session>) -> Result<(), GatewayError> {
        match self.sessions.entry(session.gateway_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().connection_id != session.connection_id {
                    return Err(GatewayError::AlreadyRegistered);
                }
                entry.insert(session);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(session);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, gateway_key: &str) -> Option<Arc<Session>> {
        self.sessions.get(gateway_key).map(|s| s.clone())
    }

    /// Remove the key if it belongs to this connection
    pub fn remove(&self, gateway_key: &str, connection_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .remove_if(gateway_key, |_, s| s.connection_id == connection_id)
            .map(|(_, s)| s)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driverbox_core::PointData;
    use std::time::Duration;

    fn session(key: &str) -> (Arc<Session>, mpsc::UnboundedReceiver<GatewayPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Session::new(Uuid::new_v4(), key, tx)), rx)
    }

    #[tokio::test]
    async fn test_control_waits_for_response() {
        let (session, mut outbox) = session("sub-1");
        let waiting = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .control(DeviceData::new("sub-1/meter", vec![PointData::new("relay", 1)]))
                    .await
            })
        };

        let frame = outbox.recv().await.unwrap();
        assert_eq!(frame.kind, PayloadType::Control);
        assert_eq!(frame.device_data.unwrap().id, "sub-1/meter");

        assert!(session.resolve_control(Ok(())));
        assert!(waiting.await.unwrap().is_ok());
        assert!(!session.resolve_control(Ok(())));
    }

    #[tokio::test]
    async fn test_control_errors() {
        let (session, mut outbox) = session("sub-1");
        let waiting = {
            let session = session.clone();
            tokio::spawn(async move { session.control(DeviceData::new("sub-1/x", vec![])).await })
        };
        outbox.recv().await.unwrap();
        session.resolve_control(Err("device id error".into()));
        assert!(matches!(
            waiting.await.unwrap(),
            Err(PluginError::Remote(reason)) if reason == "device id error"
        ));

        drop(outbox);
        assert!(matches!(
            session.control(DeviceData::new("sub-1/x", vec![])).await,
            Err(PluginError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_abandoned_control_is_skipped() {
        let (session, mut outbox) = session("sub-1");
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            session.control(DeviceData::new("sub-1/a", vec![])),
        )
        .await;
        assert!(abandoned.is_err());

        let waiting = {
            let session = session.clone();
            tokio::spawn(async move { session.control(DeviceData::new("sub-1/b", vec![])).await })
        };
        outbox.recv().await.unwrap();
        outbox.recv().await.unwrap();
        assert!(session.resolve_control(Ok(())));
        assert!(waiting.await.unwrap().is_ok());
    }

    #[test]
    fn test_one_connection_per_key() {
        let sessions = GatewaySessions::new();
        let (first, _rx1) = session("sub-1");
        let (second, _rx2) = session("sub-1");
        sessions.register(first.clone()).unwrap();
        sessions.register(first.clone()).unwrap();
        assert_eq!(
            sessions.register(second.clone()).unwrap_err(),
            GatewayError::AlreadyRegistered
        );

        assert!(sessions.remove("sub-1", second.connection_id()).is_none());
        assert!(sessions.remove("sub-1", first.connection_id()).is_some());
        sessions.register(second).unwrap();
        assert_eq!(sessions.keys(), vec!["sub-1"]);
    }
}
