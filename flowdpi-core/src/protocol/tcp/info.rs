//! Per-flow TCP state.

use std::fmt;

use super::state::TcpState;

/// Connection quality timers, all in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TcpQos {
    /// Time of the SYN that opened the connection.
    pub syn_time: Option<i64>,
    /// SYN to first ACK.
    pub connection_setup_time: Option<i64>,
    /// Last time the initiator sent payload.
    pub last_client_data_time: Option<i64>,
    /// Initiator payload to responder payload.
    pub application_response_time: Option<i64>,
    /// Resets per second of flow lifetime.
    pub reset_rate: f64,
    pub last_sample_time: i64,
}

/// TCP state attached to a flow for its whole life.
#[derive(Debug, Clone, Default)]
pub struct TcpInfo {
    pub state_prev: TcpState,
    pub state_curr: TcpState,
    /// Expected next sequence number, indexed by flow direction; `None`
    /// until that direction sent its first segment.
    pub seq_num: [Option<u32>; 2],
    pub syn: u32,
    pub syn_ack: u32,
    pub ack: u32,
    pub fin: u32,
    pub rst: u32,
    pub push: u32,
    /// Segments whose sequence number did not match the expected one.
    pub out_of_sequence: u32,
    pub qos: TcpQos,
}

impl TcpInfo {
    /// Both the previous and the current state are closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state_prev == TcpState::Closed && self.state_curr == TcpState::Closed
    }
}

impl fmt::Display for TcpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} S({})SA({})A({})F({})R({})P({})Seq({},{})",
            self.state_curr,
            self.syn,
            self.syn_ack,
            self.ack,
            self.fin,
            self.rst,
            self.push,
            self.seq_num[0].unwrap_or_default(),
            self.seq_num[1].unwrap_or_default()
        )
    }
}
