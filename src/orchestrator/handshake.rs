//! Command/acknowledge handshake with the controller.
//!
//! The controller drives the per-pixel sequence by asserting one of three
//! boolean command tags; the application acknowledges each by asserting the
//! paired response tag once the work is done, and clears the response when
//! the controller deasserts the command. Each command owns an explicit
//! state machine so a command that deasserts before completion leaves no
//! stale acknowledgement behind.

use crate::tags::TagId;

/// The three controller-issued pixel commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Position confirmed; set up the meter for the pixel.
    InitializePixel,
    /// Pulse train finished; harvest the meter buffer.
    CapturePixel,
    /// Classify the captured data and publish the pixel result.
    ProcessPixel,
}

impl Command {
    pub const ALL: &'static [Command] = &[
        Command::InitializePixel,
        Command::CapturePixel,
        Command::ProcessPixel,
    ];

    /// Tag the controller asserts to issue this command.
    pub fn command_tag(self) -> TagId {
        match self {
            Command::InitializePixel => TagId::InitializePixel,
            Command::CapturePixel => TagId::CapturePixel,
            Command::ProcessPixel => TagId::ProcessPixel,
        }
    }

    /// Tag the application asserts to acknowledge completion.
    pub fn response_tag(self) -> TagId {
        match self {
            Command::InitializePixel => TagId::PixelInitialized,
            Command::CapturePixel => TagId::PixelCaptured,
            Command::ProcessPixel => TagId::PixelProcessed,
        }
    }
}

/// Handshake phase for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Command deasserted, response deasserted.
    #[default]
    Idle,
    /// Command seen asserted; handler not yet dispatched.
    Received,
    /// Handler running.
    Busy,
    /// Handler finished; response asserted, waiting for the controller to
    /// deassert the command.
    Acknowledged,
}

/// Transition effects the orchestrator must carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAction {
    None,
    /// Run the command's handler, then assert the response tag.
    Dispatch,
    /// Deassert the response tag.
    ClearResponse,
}

/// Per-command handshake tracker.
#[derive(Debug, Default)]
pub struct Handshake {
    state: HandshakeState,
}

impl Handshake {
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Feed a new level of the command tag and get the required action.
    ///
    /// A rising edge in `Idle` dispatches; a falling edge clears the response
    /// whether or not the handler completed, so an aborted command never
    /// leaves a response asserted. Repeated levels are ignored.
    pub fn on_command_level(&mut self, asserted: bool) -> HandshakeAction {
        match (self.state, asserted) {
            (HandshakeState::Idle, true) => {
                self.state = HandshakeState::Received;
                HandshakeAction::Dispatch
            }
            (HandshakeState::Received | HandshakeState::Busy, false)
            | (HandshakeState::Acknowledged, false) => {
                self.state = HandshakeState::Idle;
                HandshakeAction::ClearResponse
            }
            _ => HandshakeAction::None,
        }
    }

    /// The handler has been dispatched.
    pub fn mark_busy(&mut self) {
        if self.state == HandshakeState::Received {
            self.state = HandshakeState::Busy;
        }
    }

    /// The handler finished and the response tag was asserted.
    pub fn mark_acknowledged(&mut self) {
        if self.state == HandshakeState::Busy {
            self.state = HandshakeState::Acknowledged;
        }
    }

    /// Force back to idle, e.g. on abort or session teardown.
    pub fn reset(&mut self) {
        self.state = HandshakeState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle() {
        let mut hs = Handshake::default();
        assert_eq!(hs.on_command_level(true), HandshakeAction::Dispatch);
        hs.mark_busy();
        hs.mark_acknowledged();
        assert_eq!(hs.state(), HandshakeState::Acknowledged);
        assert_eq!(hs.on_command_level(false), HandshakeAction::ClearResponse);
        assert_eq!(hs.state(), HandshakeState::Idle);
    }

    #[test]
    fn falling_edge_before_completion_still_clears() {
        let mut hs = Handshake::default();
        assert_eq!(hs.on_command_level(true), HandshakeAction::Dispatch);
        hs.mark_busy();
        // Controller withdraws the command mid-handler.
        assert_eq!(hs.on_command_level(false), HandshakeAction::ClearResponse);
        assert_eq!(hs.state(), HandshakeState::Idle);
    }

    #[test]
    fn repeated_levels_are_ignored() {
        let mut hs = Handshake::default();
        assert_eq!(hs.on_command_level(false), HandshakeAction::None);
        assert_eq!(hs.on_command_level(true), HandshakeAction::Dispatch);
        assert_eq!(hs.on_command_level(true), HandshakeAction::None);
    }

    #[test]
    fn command_tags_pair_up() {
        assert_eq!(
            Command::InitializePixel.response_tag(),
            TagId::PixelInitialized
        );
        assert_eq!(Command::CapturePixel.response_tag(), TagId::PixelCaptured);
        assert_eq!(Command::ProcessPixel.response_tag(), TagId::PixelProcessed);
    }
}
