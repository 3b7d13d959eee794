//! Boundary to the console/event relay.
//!
//! Environments publish here; the relay (websocket fan-out) subscribes. The
//! channel is lossy for slow subscribers and publishing never blocks.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::types::ServerId;

const CHANNEL_CAPACITY: usize = 1024;
const DRAIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    ConsoleOutput(String),
    ConsoleAttached,
    ConsoleDetached,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerEvent {
    pub server: ServerId,
    pub kind: EventKind,
}

/// Daemon-wide event bus. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Per-server publishing handle.
    pub fn emitter(&self, server: ServerId) -> Emitter {
        Emitter {
            server,
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes events tagged with one server's identifier.
#[derive(Clone)]
pub struct Emitter {
    server: ServerId,
    tx: broadcast::Sender<ServerEvent>,
}

impl Emitter {
    pub fn publish(&self, kind: EventKind) {
        // No subscribers is fine.
        let _ = self.tx.send(ServerEvent {
            server: self.server.clone(),
            kind,
        });
    }

    pub fn console_line(&self, line: impl Into<String>) {
        self.publish(EventKind::ConsoleOutput(line.into()));
    }
}

/// Relay console lines to `emitter` until `done` resolves.
///
/// Lines already buffered when `done` fires are still delivered, so output
/// printed right before an exit is not lost.
pub(crate) fn forward_console<F>(
    mut lines: broadcast::Receiver<String>,
    done: F,
    emitter: Emitter,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::pin!(done);
        loop {
            tokio::select! {
                line = lines.recv() => match line {
                    Ok(line) => emitter.console_line(line),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = &mut done => {
                    while let Ok(Ok(line)) = tokio::time::timeout(DRAIN_GRACE, lines.recv()).await {
                        emitter.console_line(line);
                    }
                    break;
                }
            }
        }
        emitter.publish(EventKind::ConsoleDetached);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_tags_events_with_server() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emitter(ServerId::from("abc")).console_line("hello");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.server, ServerId::from("abc"));
        assert_eq!(event.kind, EventKind::ConsoleOutput("hello".into()));
    }

    #[test]
    fn publishing_without_subscribers_does_not_fail() {
        let bus = EventBus::new();
        bus.emitter(ServerId::from("abc"))
            .publish(EventKind::ConsoleAttached);
    }

    #[tokio::test]
    async fn forwarder_drains_buffered_lines_after_done() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (tx, lines) = broadcast::channel(16);
        tx.send("last words".to_string()).unwrap();

        let task = forward_console(lines, async {}, bus.emitter(ServerId::from("abc")));
        task.await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap().kind,
            EventKind::ConsoleOutput("last words".into())
        );
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ConsoleDetached);
    }
}
