use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::maze::Maze;

/// Hook invoked once per logical state change. The host wires this to its
/// render pump; the engine never batches or debounces.
pub type NotifyFn = Arc<dyn Fn() + Send + Sync>;

/// Single source of truth for door / item state. Robots and plates mutate
/// the world only through these entry points so every change hits the
/// notify hook.
pub struct WorldState {
    door_states: HashMap<String, bool>,
    revealed_items: HashSet<String>,
    collected_items: HashSet<String>,
    notify: NotifyFn,
}

/// Owned copy of the mutable world state. Handing out copies keeps callers
/// off the internal containers and on the notify path.
#[derive(Clone, Debug, Serialize)]
pub struct WorldSnapshot {
    pub door_states: HashMap<String, bool>,
    pub revealed_items: Vec<String>,
    pub collected_items: Vec<String>,
}

impl WorldState {
    pub fn new(maze: &Maze, notify: NotifyFn) -> Self {
        let mut world = Self {
            door_states: HashMap::new(),
            revealed_items: HashSet::new(),
            collected_items: HashSet::new(),
            notify,
        };
        world.reset(maze);
        world
    }

    /// Rebuilds door state from the maze definition and reseeds the item
    /// sets. Safe to call again on maze reload; nothing from the previous
    /// maze survives.
    pub fn reset(&mut self, maze: &Maze) {
        self.door_states = maze
            .doors
            .iter()
            .map(|d| (d.id.clone(), d.is_open))
            .collect();
        self.collected_items.clear();
        self.revealed_items = maze
            .items
            .iter()
            .filter(|i| i.revealed)
            .map(|i| i.id.clone())
            .collect();
    }

    pub fn is_door_open(&self, id: &str) -> bool {
        self.door_states.get(id).copied().unwrap_or(false)
    }

    pub fn open_door(&mut self, id: &str) {
        let Some(open) = self.door_states.get_mut(id) else {
            return;
        };
        *open = true;
        (self.notify)();
    }

    pub fn close_door(&mut self, id: &str) {
        let Some(open) = self.door_states.get_mut(id) else {
            return;
        };
        *open = false;
        (self.notify)();
    }

    pub fn is_item_collected(&self, id: &str) -> bool {
        self.collected_items.contains(id)
    }

    pub fn collect_item(&mut self, id: &str) {
        self.collected_items.insert(id.to_string());
        (self.notify)();
    }

    /// Reverse of `collect_item`, for the robot `drop` action.
    pub fn drop_item(&mut self, id: &str) {
        self.collected_items.remove(id);
        (self.notify)();
    }

    pub fn is_item_revealed(&self, id: &str) -> bool {
        self.revealed_items.contains(id)
    }

    pub fn reveal_item(&mut self, id: &str) {
        self.revealed_items.insert(id.to_string());
        (self.notify)();
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        let mut revealed: Vec<String> = self.revealed_items.iter().cloned().collect();
        let mut collected: Vec<String> = self.collected_items.iter().cloned().collect();
        revealed.sort();
        collected.sort();
        WorldSnapshot {
            door_states: self.door_states.clone(),
            revealed_items: revealed,
            collected_items: collected,
        }
    }
}
