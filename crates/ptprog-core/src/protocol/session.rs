//! Session management
//!
//! A session owns the one transport to the coordinator. Opening it runs the
//! bridge setup; afterwards discovery cycles and directed commands are issued
//! one at a time through `&mut self`.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    open_transport, Address, BridgeConfigurator, BridgeState, CommandDispatcher, DeviceRecord,
    DiscoveryProtocol, DiscoveryState, DiscoveryStats, FrameCodec, ProtocolError, RawFrameBuffer,
    Transport,
};
use crate::config::SessionConfig;

/// Cumulative traffic and drop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    /// Bytes written to the transport
    pub tx_bytes: u64,
    /// Bytes read back
    pub rx_bytes: u64,
    /// Frames written, broadcasts included
    pub tx_frames: u64,
    /// Completed reads, empty ones included
    pub rx_reads: u64,
    /// Discovery slices dropped as short, corrupt or empty
    pub frames_dropped: u64,
}

/// An open link to the coordinator
pub struct Session<T: Transport = Box<dyn Transport>> {
    transport: T,
    config: SessionConfig,
    codec: FrameCodec,
    bridge: BridgeConfigurator,
    discovery: DiscoveryProtocol,
    dispatcher: CommandDispatcher,
    counters: SessionCounters,
}

impl Session<Box<dyn Transport>> {
    /// Open the configured transport and bring the bridge up
    pub fn connect(
        config: SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let transport = open_transport(&config, cancel)?;
        Self::open(transport, config)
    }
}

impl<T: Transport> Session<T> {
    /// Take ownership of `transport`, enable the UART and program the baud rate
    pub fn open(mut transport: T, config: SessionConfig) -> Result<Self, ProtocolError> {
        let mut bridge = BridgeConfigurator::new(config.control_timeout());
        bridge.enable_uart(&mut transport)?;
        bridge.set_baud_rate(&mut transport, config.baud_rate)?;

        let codec = FrameCodec::new(config.escaping);
        info!(
            "Session open at {} baud (escaping: {:?})",
            config.baud_rate,
            config.escaping
        );

        Ok(Self {
            transport,
            discovery: DiscoveryProtocol::new(codec, config.verify_checksums),
            dispatcher: CommandDispatcher::new(codec),
            codec,
            bridge,
            config,
            counters: SessionCounters::default(),
        })
    }

    /// Settings the session was opened with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Traffic totals since the session was opened
    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Where bridge setup got to
    pub fn bridge_state(&self) -> BridgeState {
        self.bridge.state()
    }

    /// Discovery state; `Idle` between calls
    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    /// Counters from the most recent discovery cycle
    pub fn last_discovery_stats(&self) -> DiscoveryStats {
        self.discovery.last_stats()
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Close the session, handing the transport back
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Run one discovery cycle
    pub fn discover(&mut self) -> Result<Vec<DeviceRecord>, ProtocolError> {
        let result = self.discovery.run(
            &mut self.transport,
            self.config.write_timeout(),
            self.config.read_timeout(),
            self.config.buffer_capacity,
        );

        // The broadcast may have gone out even if the read then failed
        let stats = self.discovery.last_stats();
        if stats.bytes_written > 0 {
            self.counters.tx_bytes += stats.bytes_written as u64;
            self.counters.tx_frames += 1;
        }
        let records = result?;

        self.counters.rx_bytes += stats.bytes_read as u64;
        self.counters.rx_reads += 1;
        self.counters.frames_dropped += stats.dropped() as u64;

        info!("Discovery found {} device(s)", records.len());
        Ok(records)
    }

    /// Run one discovery cycle and merge the results into `found`
    ///
    /// A device already present is replaced by its fresh record. Returns how
    /// many devices were new.
    pub fn discover_into(&mut self, found: &mut Vec<DeviceRecord>) -> Result<usize, ProtocolError> {
        let mut added = 0;
        for record in self.discover()? {
            match found.iter_mut().find(|r| r.address() == record.address()) {
                Some(existing) => *existing = record,
                None => {
                    found.push(record);
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Send a directed command to `record` and wait for whatever comes back
    pub fn send_command(
        &mut self,
        record: &DeviceRecord,
        command_code: u8,
        params: &[u8],
    ) -> Result<RawFrameBuffer, ProtocolError> {
        let frame = self
            .dispatcher
            .build_directed_command(record, command_code, params)?;
        debug!(
            "send_command: {:?} to {} ({})",
            command_code as char,
            record.mac(),
            record.node_name()
        );
        self.write_frame(&frame)?;

        let reply = self.dispatcher.await_reply(
            &mut self.transport,
            self.config.read_timeout(),
            self.config.buffer_capacity,
        )?;
        self.counters.rx_bytes += reply.len() as u64;
        self.counters.rx_reads += 1;
        Ok(reply)
    }

    /// Broadcast a short text message to every receiver
    ///
    /// The first character travels in the command code position, exactly as
    /// a directed command would carry it.
    pub fn send_broadcast_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        let Some((&code, rest)) = text.as_bytes().split_first() else {
            return Err(ProtocolError::MalformedFrame(
                "broadcast message is empty".to_string(),
            ));
        };
        let frame = self
            .codec
            .encode_transmit_request(&Address::BROADCAST, code, rest)?;
        self.write_frame(&frame)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        self.dispatcher
            .send(&mut self.transport, frame, self.config.write_timeout())?;
        self.counters.tx_bytes += frame.len() as u64;
        self.counters.tx_frames += 1;
        Ok(())
    }
}
