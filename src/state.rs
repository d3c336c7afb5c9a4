// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session state machine.
//!
//! The functions of this module are pure: they decide whether an operation is legal in a given
//! state and which state it leads to, but apply nothing themselves. [`SessionState::Error`] is
//! absorbing, which is enforced by [`SessionState::transition`].

use std::fmt;

use crate::session::Port;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    StartInput,
    StartOutput,
    Start,
    Drc,
    DrcLastFlag,
    Drain,
    DrainLastFlag,
    DrcDrain,
    DrcDrainLastFlag,
    DrainStartInput,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Open => "OPEN",
            SessionState::StartInput => "START_INPUT",
            SessionState::StartOutput => "START_OUTPUT",
            SessionState::Start => "START",
            SessionState::Drc => "DRC",
            SessionState::DrcLastFlag => "DRC_LAST_FLAG",
            SessionState::Drain => "DRAIN",
            SessionState::DrainLastFlag => "DRAIN_LAST_FLAG",
            SessionState::DrcDrain => "DRC_DRAIN",
            SessionState::DrcDrainLastFlag => "DRC_DRAIN_LAST_FLAG",
            SessionState::DrainStartInput => "DRAIN_START_INPUT",
            SessionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

impl SessionState {
    /// Move to `new`, unless the current state is [`SessionState::Error`].
    ///
    /// Returns `true` if the state changed.
    pub fn transition(&mut self, new: SessionState, session_id: u32) -> bool {
        if *self == SessionState::Error {
            if new != SessionState::Error {
                log::debug!(
                    "[{:08x}] ignoring transition to {} while in error state",
                    session_id,
                    new
                );
            }
            return false;
        }
        if *self != new {
            log::debug!("[{:08x}] state {} -> {}", session_id, self, new);
        }
        *self = new;
        true
    }
}

/// Outcome of a legality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allow {
    Disallow,
    Allow,
    Defer,
    Discard,
    Ignore,
}

/// Streaming status of the ports of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingPorts([bool; 4]);

impl StreamingPorts {
    fn slot(port: Port) -> usize {
        match port {
            Port::Input => 0,
            Port::Output => 1,
            Port::InputMeta => 2,
            Port::OutputMeta => 3,
        }
    }

    pub fn is_streaming(&self, port: Port) -> bool {
        self.0[Self::slot(port)]
    }

    pub fn set(&mut self, port: Port, streaming: bool) {
        self.0[Self::slot(port)] = streaming;
    }
}

pub fn allow_streamon(state: SessionState, port: Port) -> bool {
    use SessionState::*;

    match port {
        Port::Input | Port::InputMeta => matches!(state, Open | StartOutput),
        Port::Output | Port::OutputMeta => matches!(state, Open | StartInput | DrainStartInput),
    }
}

pub fn allow_streamoff(port: Port, streaming: &StreamingPorts) -> Allow {
    match port {
        Port::Input | Port::Output => {
            if streaming.is_streaming(port) {
                Allow::Allow
            } else {
                Allow::Ignore
            }
        }
        Port::InputMeta | Port::OutputMeta => {
            if streaming.is_streaming(port.data_port()) {
                Allow::Disallow
            } else if !streaming.is_streaming(port) {
                Allow::Ignore
            } else {
                Allow::Allow
            }
        }
    }
}

pub fn allow_qbuf(state: SessionState, port: Port, streaming: &StreamingPorts) -> Allow {
    use SessionState::*;

    if !streaming.is_streaming(port) {
        return Allow::Defer;
    }

    match port {
        // Metadata buffers are sent along with their data buffer.
        Port::InputMeta | Port::OutputMeta => Allow::Defer,
        Port::Input => match state {
            Open | StartOutput => Allow::Defer,
            Error => Allow::Disallow,
            _ => Allow::Allow,
        },
        Port::Output => match state {
            Open | StartInput | DrainStartInput => Allow::Defer,
            Error => Allow::Disallow,
            _ => Allow::Allow,
        },
    }
}

pub fn allow_stop(state: SessionState) -> Allow {
    use SessionState::*;

    match state {
        Start | Drc | DrcLastFlag | DrcDrain => Allow::Allow,
        StartInput => Allow::Ignore,
        _ => Allow::Disallow,
    }
}

pub fn allow_start(state: SessionState) -> bool {
    use SessionState::*;

    matches!(state, DrainLastFlag | DrcLastFlag | DrcDrainLastFlag)
}

pub fn allow_input_psc(state: SessionState) -> Allow {
    use SessionState::*;

    match state {
        Start | StartInput | Drain => Allow::Allow,
        Drc | DrcLastFlag | DrcDrain | DrcDrainLastFlag | DrainStartInput => Allow::Defer,
        Open | StartOutput => Allow::Discard,
        _ => Allow::Disallow,
    }
}

pub fn allow_last_flag(state: SessionState) -> bool {
    use SessionState::*;

    matches!(state, Drc | Drain | DrcDrain)
}

/// Target of a stream-on transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamonTarget {
    pub state: SessionState,
    /// A pending input port settings change must be applied before landing on `state`.
    pub replay_input_psc: bool,
}

pub fn streamon_target(state: SessionState, port: Port) -> StreamonTarget {
    use SessionState::*;

    let (new, replay) = match port {
        Port::InputMeta | Port::OutputMeta => (state, false),
        Port::Input => match state {
            Open => (StartInput, false),
            StartOutput => (Start, false),
            _ => (Error, false),
        },
        Port::Output => match state {
            Open => (StartOutput, false),
            StartInput => (Start, false),
            DrainStartInput => (Drain, true),
            _ => (Error, false),
        },
    };

    StreamonTarget {
        state: new,
        replay_input_psc: replay,
    }
}

pub fn streamoff_target(state: SessionState, port: Port) -> SessionState {
    use SessionState::*;

    match port {
        Port::InputMeta | Port::OutputMeta => state,
        Port::Input => match state {
            StartInput => Open,
            Start | Drc | DrcLastFlag | Drain | DrainLastFlag | DrcDrain | DrcDrainLastFlag
            | DrainStartInput => StartOutput,
            _ => Error,
        },
        Port::Output => match state {
            StartOutput => Open,
            Start | Drain | DrainLastFlag | Drc | DrcLastFlag | DrcDrain => StartInput,
            DrcDrainLastFlag => DrainStartInput,
            _ => Error,
        },
    }
}

/// State reached by a drain command, `None` if draining is a misuse in `state`.
pub fn stop_target(state: SessionState) -> Option<SessionState> {
    use SessionState::*;

    match state {
        Start => Some(Drain),
        Drc => Some(DrcDrain),
        DrcDrain | DrcLastFlag => Some(DrcDrainLastFlag),
        _ => None,
    }
}

/// State reached by a start command before any pending input port settings change is replayed.
pub fn start_target(state: SessionState) -> Option<SessionState> {
    use SessionState::*;

    match state {
        DrainLastFlag | DrcLastFlag => Some(Start),
        DrcDrainLastFlag => Some(Drain),
        _ => None,
    }
}

/// State reached once a pending input port settings change has been replayed from `state`,
/// instead of `target`.
pub fn after_input_psc_replay(state: SessionState, target: SessionState) -> SessionState {
    use SessionState::*;

    match state {
        DrcDrainLastFlag | DrainStartInput => DrcDrain,
        DrcLastFlag => Drc,
        _ => target,
    }
}

pub fn input_psc_target(state: SessionState) -> Option<SessionState> {
    use SessionState::*;

    match state {
        // The output port is not started yet.
        StartInput => Some(StartInput),
        Start => Some(Drc),
        Drain => Some(DrcDrain),
        _ => None,
    }
}

pub fn last_flag_target(state: SessionState) -> Option<SessionState> {
    use SessionState::*;

    match state {
        Drc => Some(DrcLastFlag),
        Drain => Some(DrainLastFlag),
        DrcDrain => Some(DrcDrainLastFlag),
        _ => None,
    }
}
