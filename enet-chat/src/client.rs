//! Chat client: connects to one server, prints what it receives, sends typed lines.

use std::time::Duration;

use enet_bridge::{Event, EventDispatcher, EventType};
use tracing::{info, warn};

use crate::config::Config;
use crate::session::{open_bridge, Outgoing, Role, Session};

pub struct ClientRole {
    server: i64,
    connected: bool,
    leaving: bool,
    outgoing: Vec<Outgoing>,
    output: Vec<String>,
}

impl ClientRole {
    /// `server` is the peer handle returned by `connect`.
    pub fn new(server: i64) -> Self {
        Self {
            server,
            connected: false,
            leaving: false,
            outgoing: Vec::new(),
            output: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn on_connect(&mut self, _event: &Event) -> anyhow::Result<()> {
        self.connected = true;
        self.output.push("Connected to server!".to_string());
        Ok(())
    }

    fn on_disconnect(&mut self, event: &Event) -> anyhow::Result<()> {
        if !self.connected && !self.leaving {
            warn!(data = event.data, "connection attempt failed");
        }
        self.connected = false;
        self.output.push("Disconnected from server".to_string());
        Ok(())
    }

    fn on_receive(&mut self, event: &Event) -> anyhow::Result<()> {
        let packet = event
            .packet
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("receive event without packet"))?;
        self.output
            .push(format!("Server: {}", packet.data_as_string()));
        Ok(())
    }
}

impl Role for ClientRole {
    fn register(dispatcher: &mut EventDispatcher<Self>) {
        dispatcher
            .on(EventType::Connect, ClientRole::on_connect)
            .on(EventType::Disconnect, ClientRole::on_disconnect)
            .on(EventType::Receive, ClientRole::on_receive);
    }

    fn on_line(&mut self, line: &str) {
        if !self.connected {
            self.output.push("Not connected yet...".to_string());
            return;
        }
        self.outgoing.push(Outgoing::Send {
            peer: self.server,
            text: line.to_string(),
        });
    }

    fn on_quit(&mut self) {
        self.leaving = true;
        if self.connected {
            self.outgoing.push(Outgoing::Disconnect { peer: self.server });
            self.connected = false;
        }
    }

    fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outgoing)
    }

    fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }
}

/// Create an ephemeral client host and start connecting to `server:port`.
pub fn open(cfg: &Config, server: &str, port: u16) -> anyhow::Result<Session<ClientRole>> {
    let mut bridge = open_bridge()?;
    let host = bridge.create_host_bound(None, 0, 1, cfg.channels, 0, 0);
    if host == 0 {
        anyhow::bail!("could not create client host");
    }
    let peer = bridge.connect(host, server, i32::from(port), cfg.channels, 0);
    if peer == 0 {
        anyhow::bail!("failed to connect to {}:{}", server, port);
    }
    info!("connecting to {}:{}...", server, port);
    Ok(Session::new(
        bridge,
        host,
        ClientRole::new(peer),
        Duration::from_millis(cfg.poll_millis),
    ))
}
