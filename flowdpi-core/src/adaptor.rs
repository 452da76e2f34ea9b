//! Persistence adaptors.
//!
//! A [`DatabaseAdaptor`] mirrors the flow table into an external store. The
//! transport decoders call `insert` when a flow is created, `update` every
//! few packets and `remove` when the flow is retired. Adaptor failures are
//! logged and never interrupt packet processing.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::error::{AdaptorError, Result};
use crate::flow::Flow;

/// Default number of packets between two updates of the same flow.
pub const DEFAULT_PACKET_SAMPLING: u64 = 64;

/// External store mirroring the flow table.
pub trait DatabaseAdaptor: Send {
    fn connect(&mut self, connection: &str) -> Result<()>;
    fn insert(&mut self, key: &str);
    fn update(&mut self, key: &str, data: &str);
    fn remove(&mut self, key: &str);
}

/// TCP part of a [`FlowRecord`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TcpRecord {
    pub state: &'static str,
    pub syn: u32,
    pub syn_ack: u32,
    pub ack: u32,
    pub fin: u32,
    pub rst: u32,
    pub push: u32,
}

/// Serializable snapshot of a flow.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FlowRecord {
    pub bytes: u64,
    pub packets: u64,
    pub duration_us: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<&'static str>,
    pub reject: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpRecord>,
}

impl FlowRecord {
    pub fn from_flow(flow: &Flow) -> Self {
        Self {
            bytes: flow.total_bytes,
            packets: flow.total_packets,
            duration_us: flow.duration(),
            ipset: flow.ipset().map(|set| set.name().to_string()),
            anomaly: (!flow.anomaly().is_none()).then(|| flow.anomaly().as_str()),
            reject: flow.is_reject() || flow.is_partial_reject(),
            tcp: flow.tcp_info().map(|info| TcpRecord {
                state: info.state_curr.as_str(),
                syn: info.syn,
                syn_ack: info.syn_ack,
                ack: info.ack,
                fin: info.fin,
                rst: info.rst,
                push: info.push,
            }),
        }
    }

    pub fn to_json(&self) -> std::result::Result<String, AdaptorError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Push a flow update to `adaptor`, logging serialization failures.
pub(crate) fn write_update(adaptor: &mut dyn DatabaseAdaptor, flow: &Flow) {
    match FlowRecord::from_flow(flow).to_json() {
        Ok(data) => adaptor.update(&flow.tuple().to_string(), &data),
        Err(e) => warn!(flow = %flow.tuple(), error = %e, "cannot encode flow update"),
    }
}

/// Tell `adaptor` to drop `flow`, unless it already was.
pub(crate) fn remove_once(adaptor: &mut dyn DatabaseAdaptor, flow: &mut Flow) {
    if !flow.is_adaptor_removed() {
        adaptor.remove(&flow.tuple().to_string());
        flow.set_adaptor_removed(true);
    }
}

/// Adaptor appending one JSON object per operation to a file.
///
/// `connect` takes the path of the file to create.
#[derive(Debug, Default)]
pub struct JsonLinesAdaptor {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    writes: u64,
}

#[derive(Serialize)]
struct Operation<'a> {
    op: &'static str,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl JsonLinesAdaptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations written so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn write(&mut self, op: &'static str, key: &str, data: Option<&str>) {
        let Some(writer) = self.writer.as_mut() else {
            warn!(op, key, "{}", AdaptorError::NotConnected);
            return;
        };

        let data = data.and_then(|d| serde_json::from_str(d).ok());
        let line = match serde_json::to_string(&Operation { op, key, data }) {
            Ok(line) => line,
            Err(e) => {
                warn!(op, key, error = %e, "cannot encode adaptor operation");
                return;
            }
        };

        if let Err(e) = writeln!(writer, "{line}") {
            warn!(path = ?self.path, error = %e, "adaptor write failed");
            return;
        }
        self.writes += 1;
    }
}

impl DatabaseAdaptor for JsonLinesAdaptor {
    fn connect(&mut self, connection: &str) -> Result<()> {
        let file = File::create(connection).map_err(|e| AdaptorError::Connect {
            target: connection.to_string(),
            reason: e.to_string(),
        })?;
        self.path = Some(PathBuf::from(connection));
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn insert(&mut self, key: &str) {
        self.write("insert", key, None);
    }

    fn update(&mut self, key: &str, data: &str) {
        self.write("update", key, Some(data));
    }

    fn remove(&mut self, key: &str) {
        self.write("remove", key, None);
    }
}

impl Drop for JsonLinesAdaptor {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
