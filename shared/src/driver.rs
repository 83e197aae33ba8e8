//! One tokio task per moving entity
//!
//! Ticks, incoming updates and local move requests all go through the same
//! unbounded queue, so a composer is never ticked while an update is being
//! applied and readers always get a consistent snapshot.

use crate::composer::MovementComposer;
use crate::geometry::{Point, Position};
use crate::message::MovementUpdate;
use crate::state::{MovementSnapshot, PersistedMovement};
use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum DriverCommand {
    Tick,
    Update(MovementUpdate),
    MoveTo(Point),
    RotateTo(f64),
    Teleport(Position),
    Restore(PersistedMovement),
    Snapshot(oneshot::Sender<MovementSnapshot>),
    OutboundUpdate(oneshot::Sender<MovementUpdate>),
    Persist(oneshot::Sender<PersistedMovement>),
    Shutdown,
}

pub struct SyncDriver {
    commands: mpsc::UnboundedSender<DriverCommand>,
    task: JoinHandle<MovementComposer>,
}

impl SyncDriver {
    /// Moves the composer into a new task. Must be called inside a tokio runtime.
    pub fn spawn(composer: MovementComposer) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(composer, receiver));
        Self { commands, task }
    }

    /// Returns false once the task has stopped.
    pub fn send(&self, command: DriverCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn tick(&self) -> bool {
        self.send(DriverCommand::Tick)
    }

    pub fn apply_update(&self, update: MovementUpdate) -> bool {
        self.send(DriverCommand::Update(update))
    }

    pub fn move_to(&self, destination: Point) -> bool {
        self.send(DriverCommand::MoveTo(destination))
    }

    pub fn rotate_to(&self, orientation: f64) -> bool {
        self.send(DriverCommand::RotateTo(orientation))
    }

    pub fn teleport(&self, position: Position) -> bool {
        self.send(DriverCommand::Teleport(position))
    }

    pub fn restore(&self, persisted: PersistedMovement) -> bool {
        self.send(DriverCommand::Restore(persisted))
    }

    /// Position and motion flags as of every command queued before this call.
    pub async fn snapshot(&self) -> Option<MovementSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(DriverCommand::Snapshot(tx)) {
            return None;
        }
        rx.await.ok()
    }

    /// The update a peer would receive from [`MovementComposer::get_update`].
    pub async fn outbound_update(&self) -> Option<MovementUpdate> {
        let (tx, rx) = oneshot::channel();
        if !self.send(DriverCommand::OutboundUpdate(tx)) {
            return None;
        }
        rx.await.ok()
    }

    pub async fn persisted(&self) -> Option<PersistedMovement> {
        let (tx, rx) = oneshot::channel();
        if !self.send(DriverCommand::Persist(tx)) {
            return None;
        }
        rx.await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Stops the task after the queued commands and hands the composer back.
    pub async fn shutdown(self) -> Option<MovementComposer> {
        let _ = self.commands.send(DriverCommand::Shutdown);
        self.task.await.ok()
    }
}

async fn run(
    mut composer: MovementComposer,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
) -> MovementComposer {
    while let Some(command) = commands.recv().await {
        match command {
            DriverCommand::Tick => composer.tick(),
            DriverCommand::Update(update) => composer.set_update(&update),
            DriverCommand::MoveTo(destination) => composer.move_to(destination),
            DriverCommand::RotateTo(orientation) => composer.rotate_to(orientation),
            DriverCommand::Teleport(position) => composer.set_position(position),
            DriverCommand::Restore(persisted) => composer.restore(persisted),
            DriverCommand::Snapshot(reply) => {
                let _ = reply.send(composer.snapshot());
            }
            DriverCommand::OutboundUpdate(reply) => {
                let _ = reply.send(composer.get_update());
            }
            DriverCommand::Persist(reply) => {
                let _ = reply.send(composer.persist());
            }
            DriverCommand::Shutdown => break,
        }
    }

    debug!("Movement driver stopped");
    composer
}
