use crate::types::{RelayCommand, SafetyState};

/// Inputs that gate whether the owner's request may reach the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlGate {
    pub safety: SafetyState,
    pub schedule_active: bool,
    pub manual_override_active: bool,
}

impl ControlGate {
    pub fn effective_active(&self) -> bool {
        self.schedule_active || self.manual_override_active
    }

    pub fn permits_heat(&self) -> bool {
        !self.safety.is_tripped() && self.effective_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arbitration {
    pub output: bool,
    /// Output differs from the previous arbitration, or a republish was forced.
    pub changed: bool,
    /// An `ON` request is being held back by the gate.
    pub rejected: bool,
}

/// Owns the authoritative relay bit.
#[derive(Debug, Clone, Default)]
pub struct RelayArbiter {
    output: bool,
}

impl RelayArbiter {
    pub fn output(&self) -> bool {
        self.output
    }

    pub fn arbitrate(
        &mut self,
        requested: RelayCommand,
        gate: ControlGate,
        force_republish: bool,
    ) -> Arbitration {
        let permitted = gate.permits_heat();
        let output = requested.is_on() && permitted;
        let changed = output != self.output || force_republish;
        self.output = output;

        Arbitration {
            output,
            changed,
            rejected: requested.is_on() && !permitted,
        }
    }
}
