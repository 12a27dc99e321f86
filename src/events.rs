use std::collections::HashMap;
use std::sync::Arc;

use rhai::{Dynamic, FnPtr, AST};
use tracing::warn;

use crate::maze::Position;

/// The closed set of notification kinds the engine delivers. Matching on
/// this enum is exhaustive, so wiring a new kind forces every dispatch site
/// to say what it does with it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EventKind {
    Move,
    Leave,
    Pickup,
    Activate,
    Deactivate,
    RobotCreated,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Move => "move",
            EventKind::Leave => "leave",
            EventKind::Pickup => "pickup",
            EventKind::Activate => "activate",
            EventKind::Deactivate => "deactivate",
            EventKind::RobotCreated => "robot_created",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "move" => Some(EventKind::Move),
            "leave" => Some(EventKind::Leave),
            "pickup" => Some(EventKind::Pickup),
            "activate" => Some(EventKind::Activate),
            "deactivate" => Some(EventKind::Deactivate),
            "robot_created" => Some(EventKind::RobotCreated),
            _ => None,
        }
    }
}

/// Listener scope: one entity instance, or the game itself.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum EntityKey {
    Game,
    Robot(String),
    Door(String),
    Item(String),
    Plate(String),
}

#[derive(Clone, Debug)]
pub struct GameEvent {
    pub kind: EventKind,
    pub entity: EntityKey,
    /// Robot that triggered the event, when one did.
    pub robot: Option<String>,
    pub position: Option<Position>,
    pub item: Option<String>,
}

impl GameEvent {
    /// Shape handed to script listeners: a map with the kind plus whichever
    /// of robot / position / item apply.
    pub fn to_dynamic(&self) -> Dynamic {
        let mut map = rhai::Map::new();
        map.insert("kind".into(), self.kind.as_str().into());
        if let Some(robot) = &self.robot {
            map.insert("robot".into(), robot.clone().into());
        }
        if let Some(pos) = self.position {
            map.insert("x".into(), Dynamic::from_int(pos.x as i64));
            map.insert("y".into(), Dynamic::from_int(pos.y as i64));
        }
        if let Some(item) = &self.item {
            map.insert("item".into(), item.clone().into());
        }
        Dynamic::from_map(map)
    }
}

/// Handler registered from a sandboxed script. The engine and AST keep the
/// `FnPtr` callable from the action-pump tasks after the registering script
/// has moved on.
#[derive(Clone)]
pub struct ScriptListener {
    pub script_name: String,
    pub engine: Arc<rhai::Engine>,
    pub ast: Arc<AST>,
    pub handler: FnPtr,
}

#[derive(Clone)]
pub enum Listener {
    Native(Arc<dyn Fn(&GameEvent) + Send + Sync>),
    Script(ScriptListener),
}

/// Typed registry: (entity, kind) to the ordered handler list. Delivery is
/// synchronous at mutation time; the caller snapshots the list under the
/// state lock and fires it after releasing the lock.
#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<(EntityKey, EventKind), Vec<Listener>>,
}

impl EventBus {
    pub fn register(&mut self, entity: EntityKey, kind: EventKind, listener: Listener) {
        self.listeners
            .entry((entity, kind))
            .or_default()
            .push(listener);
    }

    pub fn listeners_for(&self, entity: &EntityKey, kind: EventKind) -> Vec<Listener> {
        self.listeners
            .get(&(entity.clone(), kind))
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

/// Fires `listeners` in registration order. A failing listener is logged
/// and skipped; the mutation that produced the event has already been
/// committed and later listeners still run.
pub fn deliver(event: &GameEvent, listeners: &[Listener]) {
    for listener in listeners {
        match listener {
            Listener::Native(f) => f(event),
            Listener::Script(script) => {
                let result: Result<Dynamic, _> = script.handler.call(
                    script.engine.as_ref(),
                    script.ast.as_ref(),
                    (event.to_dynamic(),),
                );
                if let Err(err) = result {
                    warn!(
                        script = %script.script_name,
                        kind = event.kind.as_str(),
                        "event listener failed: {err}"
                    );
                }
            }
        }
    }
}
