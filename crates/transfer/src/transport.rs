use serde::{Deserialize, Serialize};

/// Transport the device uses to reach the cloud.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[default]
    Amqp,
    AmqpWebSockets,
    Mqtt,
    MqttWebSockets,
    Http,
}

impl TransportType {
    /// Largest message the transport accepts, in bytes.
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::Amqp | Self::AmqpWebSockets => 256 * 1024,
            Self::Mqtt | Self::MqttWebSockets => 256 * 1024,
            Self::Http => 256 * 1024,
        }
    }

    /// Bytes reserved for message properties and the JSON envelope.
    fn envelope_overhead(&self) -> usize {
        match self {
            Self::Amqp | Self::AmqpWebSockets => 4 * 1024,
            Self::Mqtt | Self::MqttWebSockets => 2 * 1024,
            Self::Http => 8 * 1024,
        }
    }
}

/// Chunk size policy for one transfer.
///
/// Computed once from the transport active when the transfer starts and
/// never renegotiated per chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    transport: TransportType,
    chunk_size: usize,
}

impl ChunkPolicy {
    /// Payload bytes per chunk such that the base64-encoded chunk plus its
    /// envelope fits in one message.
    pub fn for_transport(transport: TransportType) -> Self {
        let budget = transport.max_message_size() - transport.envelope_overhead();
        // base64 expands 3 bytes into 4.
        let chunk_size = budget / 4 * 3;
        Self {
            transport,
            chunk_size,
        }
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks needed for `len` bytes.
    pub fn chunk_count(&self, len: u64) -> u64 {
        len.div_ceil(self.chunk_size as u64)
    }
}
