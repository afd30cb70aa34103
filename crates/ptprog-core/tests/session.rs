use ptprog_core::config::SessionConfig;
use ptprog_core::protocol::frame::{
    frame_type, AT_NODE_DISCOVER, DEFAULT_FRAME_ID, DISCOVERY_BROADCAST,
};
use ptprog_core::protocol::{
    ascii_param, split_frames, Address, BridgeState, ControlRequest, DeviceRecord,
    DiscoveryState, Escaping, FrameBuilder, FrameCodec, ProtocolError, Session, Transport,
};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::time::Duration;

/// Scripted transport for testing
#[derive(Default)]
struct MockTransport {
    requests: Vec<ControlRequest>,
    written: Vec<Vec<u8>>,
    reads: VecDeque<Vec<u8>>,
    fail_configure: bool,
    fail_write: bool,
    fail_read: bool,
}

impl MockTransport {
    fn with_reads(reads: Vec<Vec<u8>>) -> Self {
        Self {
            reads: reads.into(),
            ..Default::default()
        }
    }
}

impl Transport for MockTransport {
    fn configure(
        &mut self,
        request: &ControlRequest,
        _timeout: Duration,
    ) -> Result<(), ProtocolError> {
        if self.fail_configure {
            return Err(ProtocolError::TransportUnavailable("no device".to_string()));
        }
        self.requests.push(request.clone());
        Ok(())
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, ProtocolError> {
        if self.fail_write {
            return Err(ProtocolError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "bulk transfer failed",
            )));
        }
        self.written.push(data.to_vec());
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, ProtocolError> {
        if self.fail_read {
            return Err(ProtocolError::TransportUnavailable("device gone".to_string()));
        }
        let Some(next) = self.reads.pop_front() else {
            return Ok(0);
        };
        let n = next.len().min(buf.len());
        buf[..n].copy_from_slice(&next[..n]);
        Ok(n)
    }
}

fn node_id_frame(mac: &str, name: &str) -> Vec<u8> {
    FrameBuilder::new(frame_type::AT_COMMAND_RESPONSE)
        .byte(DEFAULT_FRAME_ID)
        .bytes(&AT_NODE_DISCOVER)
        .byte(0x00)
        .bytes(&[0xFF, 0xFE])
        .address(&Address::parse(mac).unwrap())
        .byte(0x30)
        .bytes(name.as_bytes())
        .byte(0x00)
        .build()
        .unwrap()
}

fn open_session(transport: MockTransport) -> Session<MockTransport> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Session::open(transport, SessionConfig::default()).expect("session should open")
}

fn discover_one(mac: &str, name: &str) -> DeviceRecord {
    let mut session = open_session(MockTransport::with_reads(vec![node_id_frame(mac, name)]));
    session.discover().unwrap().remove(0)
}

#[test]
fn test_open_configures_bridge_in_order() {
    let session = open_session(MockTransport::default());
    let requests = &session.transport().requests;

    assert_eq!(requests.len(), 2);
    let summary: Vec<(u8, u8, u16)> = requests
        .iter()
        .map(|r| (r.request_type, r.request, r.value))
        .collect();
    assert_eq!(summary, vec![(0x41, 0x00, 0x0001), (0x41, 0x01, 96)]);
    assert!(requests.iter().all(|r| r.data.is_empty() && r.index == 0));
    assert_eq!(
        session.bridge_state(),
        BridgeState::Configured {
            baud_rate: 38400,
            divisor: 0x0060
        }
    );
}

#[test]
fn test_open_surfaces_bridge_failure() {
    let transport = MockTransport {
        fail_configure: true,
        ..Default::default()
    };
    let result = Session::open(transport, SessionConfig::default());
    assert!(matches!(result, Err(ProtocolError::TransportUnavailable(_))));
}

#[test]
fn test_discover_two_concatenated_responses() {
    let mut buffer = node_id_frame("0013A20040A1B2C3", "Engine 1");
    buffer.extend(node_id_frame("0013A20040D4E5F6", "Caboose"));

    let mut session = open_session(MockTransport::with_reads(vec![buffer]));
    let records = session.discover().unwrap();

    assert_eq!(session.transport().written, vec![DISCOVERY_BROADCAST.to_vec()]);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].mac(), "0013A20040A1B2C3");
    assert_eq!(records[0].node_name(), "Engine 1");
    assert_eq!(records[1].mac(), "0013A20040D4E5F6");
    assert_eq!(records[1].node_name(), "Caboose");
    assert_eq!(records[1].network_address(), 0xFFFE);
    assert_eq!(session.discovery_state(), DiscoveryState::Idle);
}

#[test]
fn test_discover_empty_read_is_not_an_error() {
    let mut session = open_session(MockTransport::default());
    let records = session.discover().unwrap();

    assert!(records.is_empty());
    assert_eq!(session.discovery_state(), DiscoveryState::Idle);
    assert_eq!(session.last_discovery_stats().bytes_read, 0);
    assert_eq!(session.last_discovery_stats().frames_seen, 0);
}

#[test]
fn test_discover_drops_and_counts_noise() {
    let good = node_id_frame("0013A20040A1B2C3", "RX");
    let mut corrupt = node_id_frame("0013A20040000001", "BAD");
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0x55;
    let unnamed = node_id_frame("0013A20040000002", "");

    let mut buffer = vec![0x00, 0x01]; // line noise before the first delimiter
    buffer.extend(&good);
    buffer.extend(&corrupt);
    buffer.extend(&unnamed);
    buffer.extend(&[0x7E, 0x00, 0x19, 0x88]); // truncated tail

    let mut session = open_session(MockTransport::with_reads(vec![buffer.clone()]));
    let records = session.discover().unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node_name(), "RX");

    let stats = session.last_discovery_stats();
    assert_eq!(stats.bytes_read, buffer.len());
    assert_eq!(stats.frames_seen, 5);
    assert_eq!(stats.skipped_short, 2);
    assert_eq!(stats.checksum_failures, 1);
    assert_eq!(stats.empty_records, 1);
    assert_eq!(stats.records, 1);
    assert_eq!(session.counters().frames_dropped, 4);
}

#[test]
fn test_discover_without_checksum_verification_keeps_corrupt_frame() {
    let mut corrupt = node_id_frame("0013A20040000001", "BAD");
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0x55;

    let config = SessionConfig {
        verify_checksums: false,
        ..Default::default()
    };
    let mut session = Session::open(MockTransport::with_reads(vec![corrupt]), config).unwrap();
    let records = session.discover().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node_name(), "BAD");
}

#[test]
fn test_discover_surfaces_write_failure() {
    let mut session = open_session(MockTransport::default());
    // Flip the failure on after bridge setup
    let mut transport = session.into_transport();
    transport.fail_write = true;
    session = Session::open(transport, SessionConfig::default()).unwrap();

    let result = session.discover();
    assert!(matches!(result, Err(ProtocolError::TransportUnavailable(_))));
    assert_eq!(session.discovery_state(), DiscoveryState::Idle);
    assert_eq!(session.counters().tx_frames, 0);
}

#[test]
fn test_discover_read_failure_still_counts_broadcast() {
    let transport = MockTransport {
        fail_read: true,
        ..Default::default()
    };
    let mut session = open_session(transport);

    assert!(matches!(
        session.discover(),
        Err(ProtocolError::TransportUnavailable(_))
    ));
    assert_eq!(session.transport().written, vec![DISCOVERY_BROADCAST.to_vec()]);

    let counters = session.counters();
    assert_eq!(counters.tx_frames, 1);
    assert_eq!(counters.tx_bytes, DISCOVERY_BROADCAST.len() as u64);
    assert_eq!(counters.rx_reads, 0);
    assert_eq!(session.discovery_state(), DiscoveryState::Idle);
}

#[test]
fn test_discover_into_accumulates_across_scans() {
    let reads = vec![
        node_id_frame("0013A20040A1B2C3", "Engine 1"),
        {
            let mut b = node_id_frame("0013A20040A1B2C3", "Engine 1 renamed");
            b.extend(node_id_frame("0013A20040D4E5F6", "Caboose"));
            b
        },
    ];
    let mut session = open_session(MockTransport::with_reads(reads));

    let mut found = Vec::new();
    assert_eq!(session.discover_into(&mut found).unwrap(), 1);
    assert_eq!(session.discover_into(&mut found).unwrap(), 1);

    assert_eq!(found.len(), 2);
    assert_eq!(found[0].node_name(), "Engine 1 renamed");
    assert_eq!(found[1].node_name(), "Caboose");
    assert_eq!(session.transport().written.len(), 2);
}

#[test]
fn test_send_command_to_discovered_device() {
    let record = discover_one("0013A20040A1B2C3", "Engine 1");
    let reply_bytes = vec![0x7E, 0x00, 0x03, 0x89, 0x01, 0x00, 0x75];

    let mut session = open_session(MockTransport::with_reads(vec![reply_bytes.clone()]));
    let reply = session
        .send_command(&record, b'B', &ascii_param(12))
        .unwrap();

    let written = &session.transport().written;
    assert_eq!(written.len(), 1);
    let frame = &written[0];
    assert_eq!(frame[2] as usize, 3 + 11);
    assert_eq!(&frame[5..13], record.address().as_bytes());
    assert_eq!(&frame[14..17], b"B12");

    // Type through last data byte plus checksum sums to 0xFF
    let total = frame[3..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    assert_eq!(total, 0xFF);

    assert_eq!(reply.as_bytes(), &reply_bytes[..]);
    assert_eq!(reply.frames().count(), 1);

    let counters = session.counters();
    assert_eq!(counters.tx_frames, 1);
    assert_eq!(counters.tx_bytes, frame.len() as u64);
    assert_eq!(counters.rx_bytes, reply_bytes.len() as u64);
}

#[test]
fn test_send_command_with_no_reply_returns_empty_buffer() {
    let record = discover_one("0013A20040A1B2C3", "Engine 1");
    let mut session = open_session(MockTransport::default());
    let reply = session.send_command(&record, b'R', b"").unwrap();
    assert!(reply.is_empty());
    assert_eq!(reply.capacity(), SessionConfig::default().buffer_capacity);
}

#[test]
fn test_send_command_surfaces_write_failure() {
    let record = discover_one("0013A20040A1B2C3", "Engine 1");
    let transport = MockTransport {
        fail_write: true,
        ..Default::default()
    };
    let mut session = open_session(transport);
    assert!(matches!(
        session.send_command(&record, b'B', b"1"),
        Err(ProtocolError::TransportUnavailable(_))
    ));
    assert_eq!(session.counters().tx_frames, 0);
}

#[test]
fn test_broadcast_text_matches_captured_frame() {
    let mut session = open_session(MockTransport::default());
    session.send_broadcast_text("Martin").unwrap();

    assert_eq!(
        session.transport().written[0],
        vec![
            0x7E, 0x00, 0x11, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0x00,
            0x4D, 0x61, 0x72, 0x74, 0x69, 0x6E, 0x95,
        ]
    );
    assert!(session.send_broadcast_text("").is_err());
}

#[test]
fn test_escaped_session_roundtrip() {
    // 0x7E and 0x7D inside the address would break unescaped framing
    let mac = "00137E7D40A1B2C3";
    let codec = FrameCodec::new(Escaping::ApiMode2);
    let wire = codec.escape(node_id_frame(mac, "Escaped"));
    assert_eq!(split_frames(&wire, wire.len()).count(), 1);

    let config = SessionConfig {
        escaping: Escaping::ApiMode2,
        ..Default::default()
    };
    let mut session = Session::open(MockTransport::with_reads(vec![wire]), config).unwrap();
    let records = session.discover().unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].mac(), mac);
    assert_eq!(records[0].node_name(), "Escaped");
}

#[test]
fn test_records_serialize_for_front_ends() {
    let record = discover_one("0013A20040A1B2C3", "Engine 1");
    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["address"], "0013A20040A1B2C3");
    assert_eq!(json["mac"], "0013A20040A1B2C3");
    assert_eq!(json["node_name"], "Engine 1");
}
