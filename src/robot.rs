use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::game::Game;
use crate::locks::{Credential, OpenOutcome};
use crate::maze::{Direction, Position, RobotDef};

/// Speeds are clamped so a script cannot stall its own queue forever with
/// `setSpeed(0)`.
pub(crate) const MIN_SPEED: f64 = 0.01;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Pen {
    pub color: String,
    pub size: i64,
}

impl Default for Pen {
    fn default() -> Self {
        Self {
            color: "black".to_string(),
            size: 1,
        }
    }
}

/// Partial pen update: absent fields keep their previous value.
#[derive(Clone, Debug, Default)]
pub struct PenUpdate {
    pub color: Option<String>,
    pub size: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RobotState {
    pub name: String,
    pub position: Position,
    pub direction: Direction,
    pub speed: f64,
    /// Item ids in pickup order.
    pub inventory: Vec<String>,
    pub pen: Option<Pen>,
    pub color: Option<String>,
}

impl RobotState {
    pub fn from_def(def: &RobotDef) -> Self {
        Self {
            name: def.name.clone(),
            position: def.position,
            direction: def.direction,
            speed: def.speed,
            inventory: Vec::new(),
            pen: None,
            color: def.color.clone(),
        }
    }

    pub fn apply_pen(&mut self, update: Option<&PenUpdate>) {
        match update {
            None => self.pen = None,
            Some(update) => {
                let mut pen = self.pen.take().unwrap_or_default();
                if let Some(color) = &update.color {
                    pen.color = color.clone();
                }
                if let Some(size) = update.size {
                    pen.size = size;
                }
                self.pen = Some(pen);
            }
        }
    }
}

/// One queued robot action. Turns carry no world effect beyond orientation
/// and skip the pacing delay; everything else waits out `1s / speed` before
/// it is applied.
#[derive(Clone, Debug)]
pub enum Action {
    MoveForward,
    TurnLeft,
    TurnRight,
    Pickup,
    Drop { item_id: String },
    OpenDoor { credential: Credential },
    SetPen { update: Option<PenUpdate> },
}

impl Action {
    pub fn is_paced(&self) -> bool {
        !matches!(self, Action::TurnLeft | Action::TurnRight)
    }
}

#[derive(Clone, Debug)]
pub enum ActionReply {
    /// `false` when the destination was a wall, a closed door, or outside
    /// the grid.
    Moved(bool),
    Turned,
    /// Id of the collected item, or `None` when the cell held nothing
    /// collectible.
    PickedUp(Option<String>),
    Dropped(bool),
    Door(OpenOutcome),
    PenSet,
    /// The game was torn down while this action sat in the queue.
    Aborted,
}

pub struct ActionRequest {
    pub action: Action,
    /// Absent for fire-and-forget submissions (listener re-entrancy).
    pub reply: Option<oneshot::Sender<ActionReply>>,
}

pub type ActionSender = mpsc::UnboundedSender<ActionRequest>;

/// The per-robot action pump: drains this robot's FIFO, paces each paced
/// action by the speed in effect at dequeue time, applies it to the shared
/// world, fires the resulting events, then resolves the caller. Actions of
/// one robot therefore complete strictly in call order while robots pace
/// independently.
pub(crate) fn spawn_pump(game: Game, robot: String, mut rx: mpsc::UnboundedReceiver<ActionRequest>) {
    let rt = game.runtime().clone();
    rt.spawn(async move {
        while let Some(req) = rx.recv().await {
            if req.action.is_paced() {
                // Re-read speed on every dequeue so setSpeed applies to the
                // next action, never retroactively.
                let speed = game.robot_speed(&robot).unwrap_or(1.0).max(MIN_SPEED);
                tokio::time::sleep(Duration::from_secs_f64(1.0 / speed)).await;
            }
            if !game.is_alive() {
                if let Some(tx) = req.reply {
                    let _ = tx.send(ActionReply::Aborted);
                }
                continue;
            }
            let (reply, events) = game.apply_action(&robot, &req.action);
            if !events.is_empty() {
                // Listeners may issue bridge calls, so they run on a
                // blocking thread, marked as a delivery thread: any robot
                // verb a handler issues from there is queued without
                // waiting, since this pump (and any peer pump delivering
                // at the same time) is parked on this await.
                let join =
                    tokio::task::spawn_blocking(move || crate::game::deliver_from_pump(events));
                let _ = join.await;
            }
            if let Some(tx) = req.reply {
                let _ = tx.send(reply);
            }
        }
    });
}
