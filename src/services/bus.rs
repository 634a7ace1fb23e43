//! Per-Request Event Bus
//!
//! A bounded FIFO of [`Event`]s with one consumer (the message
//! orchestrator) and many producers (middleware, the workflow driver).
//! Producers that would exceed capacity wait until the consumer drains.
//!
//! The bus travels as an ambient task-local handle so middleware deep
//! inside agent internals can emit without threading the bus through every
//! signature. Task-locals are scoped per request, so concurrent requests
//! never collide.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::models::Event;
use crate::utils::error::{AppError, AppResult};

/// Bounded capacity of a request's event queue
pub const BUS_CAPACITY: usize = 1024;

/// Producer handle to a request's event queue.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    closed: Arc<AtomicBool>,
}

/// Consumer side; exactly one per request.
pub struct BusReceiver {
    rx: mpsc::Receiver<Event>,
}

impl EventBus {
    pub fn new() -> (Self, BusReceiver) {
        Self::with_capacity(BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, BusReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            BusReceiver { rx },
        )
    }

    /// Enqueue an event, waiting for space under back-pressure.
    /// Fails with `BusClosed` after [`EventBus::close`].
    pub async fn emit(&self, event: Event) -> AppResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::BusClosed);
        }
        self.tx.send(event).await.map_err(|_| AppError::BusClosed)
    }

    /// Terminate the stream: enqueue the `done` sentinel exactly once and
    /// reject subsequent emits.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Event::Done).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl BusReceiver {
    /// Receive the next event. `None` once all producers are gone.
    /// Consumers iterate until [`Event::Done`].
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

tokio::task_local! {
    static CURRENT_BUS: EventBus;
}

/// Run `fut` with `bus` installed as the ambient request bus.
pub async fn with_bus<F>(bus: EventBus, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_BUS.scope(bus, fut).await
}

/// The ambient bus for the current request, if one is installed.
/// Offline execution (no handle) leaves middleware silent.
pub fn current_bus() -> Option<EventBus> {
    CURRENT_BUS.try_with(|bus| bus.clone()).ok()
}

/// Emit on the ambient bus if present; `BusClosed` is logged and discarded.
pub async fn emit_ambient(event: Event) {
    if let Some(bus) = current_bus() {
        if let Err(err) = bus.emit(event).await {
            tracing::debug!("event dropped: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_preserve_program_order() {
        let (bus, mut rx) = EventBus::new();
        bus.emit(Event::AgentInvoked {
            agent: "a".into(),
        })
        .await
        .unwrap();
        bus.emit(Event::Stream {
            executor_id: "x".into(),
            text: "t".into(),
            seq: 0,
        })
        .await
        .unwrap();
        bus.close().await;

        assert!(matches!(rx.recv().await, Some(Event::AgentInvoked { .. })));
        assert!(matches!(rx.recv().await, Some(Event::Stream { .. })));
        assert!(matches!(rx.recv().await, Some(Event::Done)));
    }

    #[tokio::test]
    async fn test_emit_after_close_is_rejected() {
        let (bus, mut rx) = EventBus::new();
        bus.close().await;
        let err = bus
            .emit(Event::AgentInvoked {
                agent: "late".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BusClosed));

        // Only the sentinel is delivered.
        assert!(matches!(rx.recv().await, Some(Event::Done)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (bus, mut rx) = EventBus::new();
        bus.close().await;
        bus.close().await;
        assert!(matches!(rx.recv().await, Some(Event::Done)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_producer_blocks_until_drained() {
        let (bus, mut rx) = EventBus::with_capacity(1);
        bus.emit(Event::Done).await.unwrap();

        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.emit(Event::AgentInvoked {
                    agent: "blocked".into(),
                })
                .await
            })
        };

        // The producer cannot finish until the consumer makes room.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        rx.recv().await.unwrap();
        producer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ambient_handle_is_scoped() {
        assert!(current_bus().is_none());

        let (bus, mut rx) = EventBus::new();
        with_bus(bus, async {
            emit_ambient(Event::AgentInvoked {
                agent: "scoped".into(),
            })
            .await;
        })
        .await;

        assert!(matches!(rx.recv().await, Some(Event::AgentInvoked { .. })));
        assert!(current_bus().is_none());
    }

    #[tokio::test]
    async fn test_emit_without_handle_is_silent() {
        // Outside any scope this must be a no-op, not a panic.
        emit_ambient(Event::Done).await;
    }
}
