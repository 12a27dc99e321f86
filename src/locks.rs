use serde::Serialize;

use crate::maze::Lock;

/// Credential presented with an `openDoor` call, lowered from the script
/// bridge: nothing, a password string, or a held item's id.
#[derive(Clone, Debug, PartialEq)]
pub enum Credential {
    None,
    Password(String),
    Item(String),
}

/// Non-throwing open result. Scripts branch on `success`; `message` is the
/// learner-facing explanation on refusal.
#[derive(Clone, Debug, Serialize)]
pub struct OpenOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OpenOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// The door authorization state machine. Pure over its inputs: the caller
/// applies the transition to the world when `success` comes back true.
/// An already-open door succeeds with no state change. A matching item
/// credential is not consumed; the robot keeps it.
pub fn evaluate_open(
    already_open: bool,
    lock: &Lock,
    credential: &Credential,
    inventory: &[String],
) -> OpenOutcome {
    if already_open {
        return OpenOutcome::success();
    }
    match lock {
        Lock::None => OpenOutcome::success(),
        Lock::Password { secret } => match credential {
            Credential::Password(given) if given == secret => OpenOutcome::success(),
            Credential::Password(_) => OpenOutcome::refused("wrong password"),
            _ => OpenOutcome::refused("this door needs a password"),
        },
        Lock::Item { required_item_id } => match credential {
            Credential::Item(id) if id == required_item_id => {
                if inventory.iter().any(|held| held == id) {
                    OpenOutcome::success()
                } else {
                    OpenOutcome::refused("you are not holding that item")
                }
            }
            Credential::Item(_) => OpenOutcome::refused("that item does not fit this lock"),
            _ => OpenOutcome::refused("this door needs an item"),
        },
    }
}
