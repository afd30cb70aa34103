//! Node discovery
//!
//! One discovery cycle sends the broadcast, performs a single bounded read and
//! turns whatever arrived into device records. Cycles share no state, so
//! callers that want more results simply run another one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    checksum,
    frame::{parse_node_identification, split_frames},
    DeviceRecord, FrameCodec, ProtocolError, Transport,
};

/// Discovery cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryState {
    /// No cycle in progress
    Idle,
    /// Sending the node discovery broadcast
    Broadcasting,
    /// Waiting on the single bounded read
    AwaitingResponses,
    /// Responses parsed, records about to be handed back
    ResultsReady,
}

/// What happened to the slices seen during one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    /// Broadcast bytes the transport accepted
    pub bytes_written: usize,
    /// Bytes returned by the read
    pub bytes_read: usize,
    /// Candidate frames produced by splitting
    pub frames_seen: usize,
    /// Records returned to the caller
    pub records: usize,
    /// Slices too short to hold a node identification
    pub skipped_short: usize,
    /// Slices whose checksum did not match
    pub checksum_failures: usize,
    /// Parsed records with no name or address
    pub empty_records: usize,
}

impl DiscoveryStats {
    /// Slices that were dropped for any reason
    pub fn dropped(&self) -> usize {
        self.skipped_short + self.checksum_failures + self.empty_records
    }
}

/// Runs broadcast-then-collect cycles
#[derive(Debug, Clone)]
pub struct DiscoveryProtocol {
    codec: FrameCodec,
    verify_checksums: bool,
    state: DiscoveryState,
    last_stats: DiscoveryStats,
    last_path: Vec<DiscoveryState>,
}

impl DiscoveryProtocol {
    /// Create an idle protocol. `verify_checksums` drops responses whose
    /// checksum does not match.
    pub fn new(codec: FrameCodec, verify_checksums: bool) -> Self {
        Self {
            codec,
            verify_checksums,
            state: DiscoveryState::Idle,
            last_stats: DiscoveryStats::default(),
            last_path: Vec::new(),
        }
    }

    /// Current state; always `Idle` between cycles
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Counters from the most recent cycle
    pub fn last_stats(&self) -> DiscoveryStats {
        self.last_stats
    }

    /// States entered during the most recent cycle, in order
    pub fn last_path(&self) -> &[DiscoveryState] {
        &self.last_path
    }

    fn transition(&mut self, next: DiscoveryState) {
        debug!("discovery: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.last_path.push(next);
    }

    /// Broadcast, read once, and return the devices that answered
    ///
    /// An empty read is not an error. Transport failures are returned and
    /// leave the protocol idle.
    pub fn run<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        write_timeout: Duration,
        read_timeout: Duration,
        buffer_capacity: usize,
    ) -> Result<Vec<DeviceRecord>, ProtocolError> {
        let result = self.cycle(transport, write_timeout, read_timeout, buffer_capacity);
        self.transition(DiscoveryState::Idle);
        result
    }

    fn cycle<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        write_timeout: Duration,
        read_timeout: Duration,
        buffer_capacity: usize,
    ) -> Result<Vec<DeviceRecord>, ProtocolError> {
        self.last_stats = DiscoveryStats::default();
        self.last_path.clear();

        self.transition(DiscoveryState::Broadcasting);
        let broadcast = self.codec.encode_broadcast_discovery();
        let written = transport
            .write(&broadcast, write_timeout)
            .map_err(unavailable)?;
        self.last_stats.bytes_written = written;
        if written != broadcast.len() {
            return Err(ProtocolError::TransportUnavailable(format!(
                "short write: {} of {} bytes",
                written,
                broadcast.len()
            )));
        }

        self.transition(DiscoveryState::AwaitingResponses);
        let mut buffer = vec![0u8; buffer_capacity];
        let n = transport.read(&mut buffer, read_timeout)?.min(buffer.len());
        debug!("discovery: read {} bytes: {:02x?}", n, &buffer[..n]);

        let records = self.collect(&buffer, n);
        self.last_stats.bytes_written = written;
        self.transition(DiscoveryState::ResultsReady);
        Ok(records)
    }

    /// Turn a receive buffer into records, counting everything dropped
    ///
    /// Replaces [`Self::last_stats`] with the counts for this buffer.
    pub fn collect(&mut self, buffer: &[u8], actual_len: usize) -> Vec<DeviceRecord> {
        let mut stats = DiscoveryStats {
            bytes_read: actual_len.min(buffer.len()),
            ..Default::default()
        };
        let mut records = Vec::new();

        for raw in split_frames(buffer, actual_len) {
            stats.frames_seen += 1;
            let frame = self.codec.unescape(raw);

            let Some(record) = parse_node_identification(&frame) else {
                debug!("discovery: skipping {} byte slice", frame.len());
                stats.skipped_short += 1;
                continue;
            };

            if self.verify_checksums {
                if let Err(e) = checksum::verify(&frame) {
                    warn!("discovery: dropping response from {}: {}", record.mac(), e);
                    stats.checksum_failures += 1;
                    continue;
                }
            }

            if record.is_empty() {
                debug!("discovery: dropping empty record from {}", record.mac());
                stats.empty_records += 1;
                continue;
            }

            records.push(record);
        }

        stats.records = records.len();
        if stats.dropped() > 0 {
            debug!(
                "discovery: {} of {} slices dropped ({} short, {} bad checksum, {} empty)",
                stats.dropped(),
                stats.frames_seen,
                stats.skipped_short,
                stats.checksum_failures,
                stats.empty_records
            );
        }
        self.last_stats = stats;
        records
    }
}

fn unavailable(err: ProtocolError) -> ProtocolError {
    match err {
        ProtocolError::TransportUnavailable(_) => err,
        other => ProtocolError::TransportUnavailable(other.to_string()),
    }
}
