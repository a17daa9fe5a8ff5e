//! Playout engine
//!
//! Owns the two rendering surfaces and enforces the PVW/PGM lifecycle:
//! TAKE, MIX, CLEAR and FREEZE. Lifecycle events are broadcast so the outer
//! wiring can rebind captures, drive the as-run log and fan state out to
//! control clients without the engine knowing any of them.

mod playout;

pub use playout::PlayoutEngine;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::template::TemplatePayload;

/// The four playout states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    Idle,
    PvwLoaded,
    OnAir,
    Frozen,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::PvwLoaded => "pvw-loaded",
            EngineState::OnAir => "on-air",
            EngineState::Frozen => "frozen",
        }
    }

    /// True while the program output carries a template.
    pub fn is_on_air(&self) -> bool {
        matches!(self, EngineState::OnAir | EngineState::Frozen)
    }
}

/// Atomic view of the engine. Consumers never observe a partially-updated
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub pvw_template: Option<TemplatePayload>,
    pub pgm_template: Option<TemplatePayload>,
    pub pvw_ready: bool,
    pub pgm_ready: bool,
    pub mixing: bool,
}

/// Lifecycle events broadcast to subscribers in emission order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Fires on every state change or variable-set update.
    State(EngineSnapshot),
    Load(TemplatePayload),
    Update(HashMap<String, String>),
    UpdatePgm(HashMap<String, String>),
    Take,
    Clear,
    Freeze(bool),
    MixStart {
        duration: Duration,
        outgoing: String,
        incoming: String,
    },
    MixCancel,
    Next,
}
