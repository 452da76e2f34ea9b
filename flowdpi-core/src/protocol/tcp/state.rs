//! TCP connection state machine.
//!
//! The machine is a pure function of (state, direction, flag class). Any
//! combination without an entry is a self-loop. RST never reaches the table:
//! the decoder forces both the previous and the current state to
//! [`TcpState::Closed`] on its own.

use std::fmt;

use crate::flow::FlowDirection;

/// Connection phase as seen by a passive observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TcpState {
    /// No segment seen yet.
    #[default]
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
    TimeWait,
    Closed,
}

impl TcpState {
    /// Return a string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TcpState::Listen => "listen",
            TcpState::SynSent => "syn_sent",
            TcpState::SynReceived => "syn_received",
            TcpState::Established => "established",
            TcpState::FinWait1 => "fin_wait_1",
            TcpState::FinWait2 => "fin_wait_2",
            TcpState::Closing => "closing",
            TcpState::CloseWait => "close_wait",
            TcpState::LastAck => "last_ack",
            TcpState::TimeWait => "time_wait",
            TcpState::Closed => "closed",
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control flags of a segment, reduced to what drives the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpFlagClass {
    /// None of SYN, FIN or ACK.
    Invalid,
    Syn,
    SynAck,
    Ack,
    /// FIN, with or without ACK.
    Fin,
}

impl TcpFlagClass {
    pub fn classify(syn: bool, ack: bool, fin: bool) -> Self {
        match (syn, ack, fin) {
            (true, true, _) => TcpFlagClass::SynAck,
            (true, false, _) => TcpFlagClass::Syn,
            (false, _, true) => TcpFlagClass::Fin,
            (false, true, false) => TcpFlagClass::Ack,
            (false, false, false) => TcpFlagClass::Invalid,
        }
    }
}

/// Next state for a segment, or `None` to stay in `state`.
pub fn next_state(
    state: TcpState,
    direction: FlowDirection,
    class: TcpFlagClass,
) -> Option<TcpState> {
    use FlowDirection::{Backward, Forward};
    use TcpFlagClass as F;
    use TcpState::*;

    match (state, direction, class) {
        // First segment of a flow; anything but SYN means it started
        // before the capture did
        (Listen, _, F::Syn) => Some(SynSent),
        (Listen, _, F::SynAck) => Some(SynReceived),
        (Listen, _, F::Ack) => Some(Established),
        (Listen, _, F::Fin) => Some(FinWait1),

        // Handshake
        (SynSent, Backward, F::SynAck) | (SynSent, Backward, F::Syn) => Some(SynReceived),
        (SynReceived, Forward, F::Ack) => Some(Established),
        (SynReceived, Forward, F::Fin) => Some(FinWait1),

        // Active close by the initiator
        (Established, Forward, F::Fin) => Some(FinWait1),
        (FinWait1, Backward, F::Ack) => Some(FinWait2),
        (FinWait1, Backward, F::Fin) => Some(Closing),
        (Closing, Forward, F::Ack) => Some(Closed),
        (FinWait2, Backward, F::Fin) => Some(TimeWait),
        (TimeWait, Forward, F::Ack) => Some(Closed),

        // Active close by the responder
        (Established, Backward, F::Fin) => Some(CloseWait),
        (CloseWait, Forward, F::Fin) => Some(LastAck),
        (LastAck, Backward, F::Ack) => Some(Closed),

        // Port reuse after a completed connection
        (Closed, _, F::Syn) => Some(SynSent),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FlowDirection::{Backward, Forward};

    const ALL_STATES: [TcpState; 11] = [
        TcpState::Listen,
        TcpState::SynSent,
        TcpState::SynReceived,
        TcpState::Established,
        TcpState::FinWait1,
        TcpState::FinWait2,
        TcpState::Closing,
        TcpState::CloseWait,
        TcpState::LastAck,
        TcpState::TimeWait,
        TcpState::Closed,
    ];

    const ALL_CLASSES: [TcpFlagClass; 5] = [
        TcpFlagClass::Invalid,
        TcpFlagClass::Syn,
        TcpFlagClass::SynAck,
        TcpFlagClass::Ack,
        TcpFlagClass::Fin,
    ];

    fn run(steps: &[(FlowDirection, TcpFlagClass)]) -> TcpState {
        steps.iter().fold(TcpState::Listen, |state, &(dir, class)| {
            next_state(state, dir, class).unwrap_or(state)
        })
    }

    // Test 1: Flag classification
    #[test]
    fn test_classify() {
        assert_eq!(TcpFlagClass::classify(true, true, false), TcpFlagClass::SynAck);
        assert_eq!(TcpFlagClass::classify(true, false, false), TcpFlagClass::Syn);
        assert_eq!(TcpFlagClass::classify(true, false, true), TcpFlagClass::Syn);
        assert_eq!(TcpFlagClass::classify(false, true, true), TcpFlagClass::Fin);
        assert_eq!(TcpFlagClass::classify(false, false, true), TcpFlagClass::Fin);
        assert_eq!(TcpFlagClass::classify(false, true, false), TcpFlagClass::Ack);
        assert_eq!(TcpFlagClass::classify(false, false, false), TcpFlagClass::Invalid);
    }

    // Test 2: Three-way handshake and four-way teardown
    #[test]
    fn test_handshake_and_teardown() {
        let established = run(&[
            (Forward, TcpFlagClass::Syn),
            (Backward, TcpFlagClass::SynAck),
            (Forward, TcpFlagClass::Ack),
        ]);
        assert_eq!(established, TcpState::Established);

        let closed = run(&[
            (Forward, TcpFlagClass::Syn),
            (Backward, TcpFlagClass::SynAck),
            (Forward, TcpFlagClass::Ack),
            (Forward, TcpFlagClass::Fin),
            (Backward, TcpFlagClass::Ack),
            (Backward, TcpFlagClass::Fin),
            (Forward, TcpFlagClass::Ack),
        ]);
        assert_eq!(closed, TcpState::Closed);
    }

    // Test 3: Teardown started by the responder
    #[test]
    fn test_passive_close() {
        let state = run(&[
            (Forward, TcpFlagClass::Syn),
            (Backward, TcpFlagClass::SynAck),
            (Forward, TcpFlagClass::Ack),
            (Backward, TcpFlagClass::Fin),
        ]);
        assert_eq!(state, TcpState::CloseWait);

        let state = next_state(state, Forward, TcpFlagClass::Fin).unwrap();
        assert_eq!(state, TcpState::LastAck);
        assert_eq!(
            next_state(state, Backward, TcpFlagClass::Ack),
            Some(TcpState::Closed)
        );
    }

    // Test 4: Mid-stream pickup
    #[test]
    fn test_mid_stream_ack_establishes() {
        assert_eq!(
            next_state(TcpState::Listen, Forward, TcpFlagClass::Ack),
            Some(TcpState::Established)
        );
    }

    // Test 5: Closed only leaves on a new SYN
    #[test]
    fn test_closed_is_sticky() {
        for class in ALL_CLASSES {
            for dir in [Forward, Backward] {
                let next = next_state(TcpState::Closed, dir, class);
                if class == TcpFlagClass::Syn {
                    assert_eq!(next, Some(TcpState::SynSent));
                } else {
                    assert_eq!(next, None);
                }
            }
        }
    }

    // Test 6: Same inputs, same output
    #[test]
    fn test_transition_is_pure() {
        for state in ALL_STATES {
            for dir in [Forward, Backward] {
                for class in ALL_CLASSES {
                    assert_eq!(next_state(state, dir, class), next_state(state, dir, class));
                }
            }
        }
    }

    #[test]
    fn test_invalid_class_never_moves() {
        for state in ALL_STATES {
            for dir in [Forward, Backward] {
                assert_eq!(next_state(state, dir, TcpFlagClass::Invalid), None);
            }
        }
    }
}
