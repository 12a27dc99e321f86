pub mod compat;
pub mod vm;

use std::sync::{Arc, Mutex};

use serde::Serialize;

pub const DEFAULT_RHAI_MAX_OPERATIONS: u64 = 500_000;
pub const DEFAULT_RHAI_MAX_CALL_LEVELS: usize = 64;

/// Task-boundary failure of one sandboxed script. Kept separate from an
/// explicit `game.fail(...)`: a script error stops that script only, never
/// the run.
#[derive(Clone, Debug, Serialize)]
pub struct ScriptError {
    pub script_name: String,
    pub robot: Option<String>,
    pub error_message: String,
}

/// Shared collection the script tasks report into.
#[derive(Clone, Default)]
pub struct ScriptErrors {
    inner: Arc<Mutex<Vec<ScriptError>>>,
}

impl ScriptErrors {
    pub fn push(&self, error: ScriptError) {
        self.inner.lock().unwrap().push(error);
    }

    pub fn snapshot(&self) -> Vec<ScriptError> {
        self.inner.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
