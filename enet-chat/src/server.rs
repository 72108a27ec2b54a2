//! Chat server: greets each client on its first message, echoes everything back, and broadcasts
//! operator input to all connected clients.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use enet_bridge::{Event, EventDispatcher, EventType};
use tracing::info;

use crate::config::Config;
use crate::session::{open_bridge, Outgoing, Role, Session};

pub const WELCOME: &str = "Welcome to the server! You are connected.";

#[derive(Default)]
pub struct ServerRole {
    /// Peer handle -> "host:port" of every connected client.
    clients: HashMap<i64, String>,
    welcomed: HashSet<i64>,
    outgoing: Vec<Outgoing>,
}

impl ServerRole {
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn label(&self, event: &Event) -> String {
        match &event.peer {
            Some(p) => self
                .clients
                .get(&p.handle)
                .cloned()
                .unwrap_or_else(|| p.address.to_string()),
            None => "?".to_string(),
        }
    }

    fn on_connect(&mut self, event: &Event) -> anyhow::Result<()> {
        let peer = event
            .peer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("connect event without peer"))?;
        self.clients.insert(peer.handle, peer.address.to_string());
        info!(client = %peer.address, total = self.clients.len(), "client connected");
        Ok(())
    }

    fn on_disconnect(&mut self, event: &Event) -> anyhow::Result<()> {
        let peer = event
            .peer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("disconnect event without peer"))?;
        let label = self.label(event);
        self.clients.remove(&peer.handle);
        self.welcomed.remove(&peer.handle);
        info!(client = %label, total = self.clients.len(), "client disconnected");
        Ok(())
    }

    fn on_receive(&mut self, event: &Event) -> anyhow::Result<()> {
        let (Some(peer), Some(packet)) = (&event.peer, &event.packet) else {
            anyhow::bail!("receive event without peer or packet");
        };
        let message = packet.data_as_string();
        info!(client = %self.label(event), channel = event.channel_id, "{}", message);
        if self.welcomed.insert(peer.handle) {
            self.outgoing.push(Outgoing::Send {
                peer: peer.handle,
                text: WELCOME.to_string(),
            });
        }
        self.outgoing.push(Outgoing::Send {
            peer: peer.handle,
            text: format!("Echo: {}", message),
        });
        Ok(())
    }
}

impl Role for ServerRole {
    fn register(dispatcher: &mut EventDispatcher<Self>) {
        dispatcher
            .on(EventType::Connect, ServerRole::on_connect)
            .on(EventType::Disconnect, ServerRole::on_disconnect)
            .on(EventType::Receive, ServerRole::on_receive);
    }

    fn on_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if self.clients.is_empty() {
            info!("no clients connected to send message to");
            return;
        }
        info!(clients = self.clients.len(), "broadcasting: {}", line);
        self.outgoing.push(Outgoing::Broadcast(line.to_string()));
    }

    fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outgoing)
    }
}

/// Bind the server host described by `cfg`.
pub fn open(cfg: &Config) -> anyhow::Result<Session<ServerRole>> {
    let mut bridge = open_bridge()?;
    let host = bridge.create_host(
        Some(&cfg.host),
        i32::from(cfg.port),
        cfg.max_clients,
        cfg.channels,
        0,
        0,
    );
    if host == 0 {
        anyhow::bail!("could not create server host on {}:{}", cfg.host, cfg.port);
    }
    let bound = bridge
        .host_address(host)
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!(bind = %bound, max_clients = cfg.max_clients, "server started");
    Ok(Session::new(
        bridge,
        host,
        ServerRole::default(),
        Duration::from_millis(cfg.poll_millis),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use enet_bridge::{packet_flags, Address, Packet, Peer};

    fn event(kind: EventType, handle: i64, text: Option<&str>) -> Event {
        Event {
            kind: kind.as_raw(),
            peer: Some(Peer {
                handle,
                address: Address::new("10.0.0.1", 5000 + handle as i32),
            }),
            channel_id: 0,
            data: 0,
            packet: text.map(|t| Packet {
                handle: 1,
                data: t.as_bytes().to_vec(),
                flags: packet_flags::RELIABLE,
            }),
        }
    }

    fn dispatcher() -> EventDispatcher<ServerRole> {
        let mut d = EventDispatcher::new();
        ServerRole::register(&mut d);
        d
    }

    #[test]
    fn first_message_gets_welcome_then_echo() {
        let mut d = dispatcher();
        let mut role = ServerRole::default();
        d.dispatch(&mut role, &event(EventType::Connect, 1, None));
        assert_eq!(role.client_count(), 1);

        d.dispatch(&mut role, &event(EventType::Receive, 1, Some("hi")));
        assert_eq!(
            role.take_outgoing(),
            vec![
                Outgoing::Send {
                    peer: 1,
                    text: WELCOME.to_string()
                },
                Outgoing::Send {
                    peer: 1,
                    text: "Echo: hi".to_string()
                },
            ]
        );
        d.dispatch(&mut role, &event(EventType::Receive, 1, Some("again")));
        assert_eq!(
            role.take_outgoing(),
            vec![Outgoing::Send {
                peer: 1,
                text: "Echo: again".to_string()
            }]
        );
    }

    #[test]
    fn reconnecting_client_is_welcomed_again() {
        let mut d = dispatcher();
        let mut role = ServerRole::default();
        d.dispatch(&mut role, &event(EventType::Connect, 1, None));
        d.dispatch(&mut role, &event(EventType::Receive, 1, Some("x")));
        d.dispatch(&mut role, &event(EventType::Disconnect, 1, None));
        assert_eq!(role.client_count(), 0);
        role.take_outgoing();
        d.dispatch(&mut role, &event(EventType::Connect, 1, None));
        d.dispatch(&mut role, &event(EventType::Receive, 1, Some("y")));
        assert_eq!(role.take_outgoing().len(), 2);
    }

    #[test]
    fn operator_lines_broadcast_only_with_clients() {
        let mut d = dispatcher();
        let mut role = ServerRole::default();
        role.on_line("nobody hears this");
        role.on_line("   ");
        assert!(role.take_outgoing().is_empty());
        d.dispatch(&mut role, &event(EventType::Connect, 3, None));
        role.on_line("  hello all ");
        assert_eq!(
            role.take_outgoing(),
            vec![Outgoing::Broadcast("hello all".to_string())]
        );
    }

    #[test]
    fn message_text_stops_at_nul() {
        let mut d = dispatcher();
        let mut role = ServerRole::default();
        d.dispatch(&mut role, &event(EventType::Receive, 2, Some("abc\0junk")));
        let out = role.take_outgoing();
        assert_eq!(
            out.last(),
            Some(&Outgoing::Send {
                peer: 2,
                text: "Echo: abc".to_string()
            })
        );
    }
}
