use crate::codec;
use crate::connection::LinkHandle;
use crate::model::Command;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    NotConnected,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected to the remote controller"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Sends operator commands over the current connection. Commands are never
/// queued for a later connection: when the link is down the caller finds
/// out straight away.
#[derive(Clone)]
pub struct CommandDispatcher {
    link: LinkHandle,
}

impl CommandDispatcher {
    pub fn new(link: LinkHandle) -> Self {
        Self { link }
    }

    pub fn send(&self, command: Command) -> Result<(), DispatchError> {
        let diagnostics = self.link.diagnostics();
        if !self.link.is_connected() {
            diagnostics.command_rejected();
            tracing::warn!(%command, "command rejected: not connected");
            return Err(DispatchError::NotConnected);
        }

        if let Err(err) = self.link.write(codec::encode(command)) {
            diagnostics.command_rejected();
            tracing::warn!(%command, error = %err, "command rejected: link closed");
            return Err(DispatchError::NotConnected);
        }

        diagnostics.command_sent();
        tracing::info!(%command, "command sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::ScriptedConnector;
    use crate::connection::{ConnectionManager, LinkState};
    use crate::diagnostics::Diagnostics;
    use crate::store::StateStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn manager() -> (
        ConnectionManager<ScriptedConnector>,
        crate::connection::testing::Script,
    ) {
        let diagnostics = Arc::new(Diagnostics::default());
        let store = StateStore::new(diagnostics.clone());
        let (connector, script) = ScriptedConnector::new();
        let manager = ConnectionManager::new(
            "ws://remote.test/ws",
            Duration::from_millis(50),
            connector,
            store,
            diagnostics,
        );
        (manager, script)
    }

    async fn connected(manager: &ConnectionManager<ScriptedConnector>) {
        let mut rx = manager.handle().watch_state();
        timeout(Duration::from_secs(2), rx.wait_for(|s| *s == LinkState::Connected))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn connected_send_writes_one_command_message() {
        let (manager, script) = manager();
        let mut peer = script.accept();
        manager.start();
        connected(&manager).await;

        let dispatcher = CommandDispatcher::new(manager.handle());
        dispatcher.send(Command::Reset).unwrap();
        dispatcher.send(Command::ForceGreenB).unwrap();

        assert_eq!(
            peer.from_client.recv().await.as_deref(),
            Some(r#"{"command":"RESET"}"#)
        );
        assert_eq!(
            peer.from_client.recv().await.as_deref(),
            Some(r#"{"command":"FORCE_GREEN_B"}"#)
        );
        assert_eq!(manager.handle().diagnostics().report().commands_sent, 2);

        manager.stop().await;
    }

    #[tokio::test]
    async fn send_without_connection_fails_and_writes_nothing() {
        let (manager, script) = manager();
        let dispatcher = CommandDispatcher::new(manager.handle());
        assert_eq!(dispatcher.send(Command::Pause), Err(DispatchError::NotConnected));

        let mut peer = script.accept();
        manager.start();
        connected(&manager).await;
        manager.stop().await;

        assert_eq!(dispatcher.send(Command::Resume), Err(DispatchError::NotConnected));
        assert!(peer.from_client.recv().await.is_none());

        let report = manager.handle().diagnostics().report();
        assert_eq!(report.commands_rejected, 2);
        assert_eq!(report.commands_sent, 0);
    }

    #[tokio::test]
    async fn send_after_remote_close_fails() {
        let (manager, script) = manager();
        let peer = script.accept();
        manager.start();
        connected(&manager).await;

        drop(peer);
        let mut rx = manager.handle().watch_state();
        timeout(Duration::from_secs(2), rx.wait_for(|s| !s.is_connected()))
            .await
            .unwrap()
            .unwrap();

        let dispatcher = CommandDispatcher::new(manager.handle());
        assert_eq!(
            dispatcher.send(Command::TriggerEmergency),
            Err(DispatchError::NotConnected)
        );
        manager.stop().await;
    }
}
