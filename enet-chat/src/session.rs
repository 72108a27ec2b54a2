//! Event loop shared by the server and client roles. The bridge lives on one blocking thread;
//! stdin lines and shutdown arrive as commands over a channel.

use std::time::Duration;

use enet_bridge::{
    packet_flags, poll_event, Bridge, DatagramEngine, EventDispatcher, ModelRuntime,
};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

pub type ChatBridge = Bridge<DatagramEngine, ModelRuntime>;

/// Chat traffic always travels reliably on channel 0.
pub const CHAT_CHANNEL: i8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Line(String),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Send { peer: i64, text: String },
    Broadcast(String),
    Disconnect { peer: i64 },
}

/// Application behavior on top of the loop: event handlers plus reactions to input.
pub trait Role: Sized {
    fn register(dispatcher: &mut EventDispatcher<Self>);

    fn on_line(&mut self, line: &str);

    /// Called once before the host is destroyed.
    fn on_quit(&mut self) {}

    fn take_outgoing(&mut self) -> Vec<Outgoing>;

    /// Lines for the terminal.
    fn take_output(&mut self) -> Vec<String> {
        Vec::new()
    }
}

pub struct Session<R: Role> {
    bridge: ChatBridge,
    host: i64,
    role: R,
    dispatcher: EventDispatcher<R>,
    poll_millis: i32,
    sink: Box<dyn FnMut(String) + Send>,
}

impl<R: Role> Session<R> {
    pub fn new(bridge: ChatBridge, host: i64, role: R, poll: Duration) -> Self {
        let mut dispatcher = EventDispatcher::new();
        R::register(&mut dispatcher);
        Self {
            bridge,
            host,
            role,
            dispatcher,
            poll_millis: i32::try_from(poll.as_millis()).unwrap_or(i32::MAX),
            sink: Box::new(|line| println!("{}", line)),
        }
    }

    /// Send terminal lines somewhere other than stdout.
    pub fn with_output<F>(mut self, sink: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        self.sink = Box::new(sink);
        self
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn bridge(&self) -> &ChatBridge {
        &self.bridge
    }

    pub fn host(&self) -> i64 {
        self.host
    }

    /// Wait up to `wait_millis` for the first event, drain the rest without blocking, then send
    /// whatever the handlers queued. Returns the number of events handled.
    pub fn step(&mut self, wait_millis: i32) -> usize {
        let mut handled = 0;
        let mut wait = wait_millis;
        while let Some(event) = poll_event(&mut self.bridge, self.host, wait) {
            self.dispatcher.dispatch(&mut self.role, &event);
            handled += 1;
            wait = 0;
        }
        self.apply();
        handled
    }

    pub fn input(&mut self, line: &str) {
        self.role.on_line(line);
        self.apply();
    }

    /// Run until `Quit` arrives or every command sender is gone, then tear down.
    pub fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        loop {
            match commands.try_recv() {
                Ok(Command::Line(line)) => {
                    self.input(&line);
                    continue;
                }
                Ok(Command::Quit) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            self.step(self.poll_millis);
        }
        self.finish();
    }

    /// Let the role say goodbye, give the farewell a moment to leave, then release everything.
    pub fn finish(mut self) -> ModelRuntime {
        self.role.on_quit();
        self.apply();
        for _ in 0..10 {
            self.step(10);
        }
        self.bridge.destroy(self.host);
        self.bridge.deinitialize();
        self.bridge.detach()
    }

    fn apply(&mut self) {
        for line in self.role.take_output() {
            (self.sink)(line);
        }
        let outgoing = self.role.take_outgoing();
        if outgoing.is_empty() {
            return;
        }
        for action in outgoing {
            match action {
                Outgoing::Send { peer, text } => {
                    let rc = self.bridge.send(
                        self.host,
                        peer,
                        CHAT_CHANNEL,
                        text.as_bytes(),
                        packet_flags::RELIABLE,
                    );
                    if rc != 0 {
                        warn!(peer, "message not sent");
                    }
                }
                Outgoing::Broadcast(text) => self.bridge.broadcast(
                    self.host,
                    CHAT_CHANNEL,
                    text.as_bytes(),
                    packet_flags::RELIABLE,
                ),
                Outgoing::Disconnect { peer } => self.bridge.disconnect_peer(self.host, peer, 0),
            }
        }
        self.bridge.flush(self.host);
        debug!(host = self.host, "flushed");
    }
}

/// Attach and initialize a bridge for one chat process.
pub fn open_bridge() -> anyhow::Result<ChatBridge> {
    let mut bridge = Bridge::attach(DatagramEngine::new(), ModelRuntime::new())?;
    if bridge.initialize() != 0 {
        anyhow::bail!("transport engine failed to initialize");
    }
    Ok(bridge)
}
