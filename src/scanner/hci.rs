//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{EVENT_CHANNEL_BUFFER_SIZE, MANUFACTURER_DATA_TYPE, ScanError, ScanHandle};
use crate::advertisement::AdvertisementEvent;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::{debug, trace};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// AD types
const AD_TYPE_SERVICE_DATA_16: u8 = 0x16;
const AD_TYPE_SERVICE_DATA_32: u8 = 0x20;
const AD_TYPE_SERVICE_DATA_128: u8 = 0x21;

/// Bluetooth Base UUID, 0000xxxx-0000-1000-8000-00805f9b34fb
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Max HCI event size
const HCI_MAX_EVENT_SIZE: usize = 258;

/// Malformed LE advertising report.
#[derive(Error, Debug, PartialEq)]
pub enum ReportError {
    #[error("advertising report truncated: {0}")]
    Truncated(&'static str),
}

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// LE Set Scan Parameters: passive scan, 10ms interval, 10ms window
fn scan_parameters_packet() -> Vec<u8> {
    let interval: u16 = 0x0010; // 10ms in 0.625ms units
    let window: u16 = 0x0010; // 10ms in 0.625ms units

    let mut params = Vec::with_capacity(7);
    params.push(LE_SCAN_PASSIVE);
    params.extend_from_slice(&interval.to_le_bytes());
    params.extend_from_slice(&window.to_le_bytes());
    params.push(LE_PUBLIC_ADDRESS);
    params.push(FILTER_POLICY_ACCEPT_ALL);

    hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &params)
}

/// LE Set Scan Enable. Duplicates are never filtered: every broadcast is recorded.
fn scan_enable_packet(enable: bool) -> Vec<u8> {
    let filter_dup = 0x00;
    hci_command_packet(
        OGF_LE_CTL,
        OCF_LE_SET_SCAN_ENABLE,
        &[u8::from(enable), filter_dup],
    )
}

fn os_error(context: &str) -> ScanError {
    ScanError::SourceUnavailable(format!("{context}: {}", io::Error::last_os_error()))
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(os_error("Failed to create HCI socket"));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to bind HCI socket"));
    }

    Ok(())
}

/// Set HCI socket filter
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to set HCI filter"));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to send HCI command"));
    }

    Ok(())
}

/// Expand a 16- or 32-bit service UUID onto the Bluetooth Base UUID.
fn short_uuid(value: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(value) << 96))
}

/// Split a service data AD structure into its UUID and payload.
fn service_data_entry(ad_type: u8, body: &[u8]) -> Option<(Uuid, &[u8])> {
    match ad_type {
        AD_TYPE_SERVICE_DATA_16 if body.len() >= 2 => {
            let value = u16::from_le_bytes([body[0], body[1]]);
            Some((short_uuid(u32::from(value)), &body[2..]))
        }
        AD_TYPE_SERVICE_DATA_32 if body.len() >= 4 => {
            let value = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            Some((short_uuid(value), &body[4..]))
        }
        AD_TYPE_SERVICE_DATA_128 if body.len() >= 16 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&body[..16]);
            Some((Uuid::from_u128(u128::from_le_bytes(bytes)), &body[16..]))
        }
        _ => None,
    }
}

/// Collect manufacturer and service data from the AD structures of one report.
///
/// Parsing stops at the first zero-length or overrunning structure, keeping
/// whatever was collected before it.
fn parse_ad_structures(ad_data: &[u8], event: &mut AdvertisementEvent) {
    let mut offset = 0;
    while offset < ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];
        let body = &ad_data[offset + 2..offset + 1 + len];

        if ad_type == MANUFACTURER_DATA_TYPE {
            if body.len() >= 2 {
                // company identifier is little-endian; a bare id is a zero-length payload
                let id = u16::from_le_bytes([body[0], body[1]]);
                event.manufacturer_data.insert(id, body[2..].to_vec());
            }
        } else if let Some((uuid, data)) = service_data_entry(ad_type, body) {
            event.service_data.insert(uuid.to_string(), data.to_vec());
        }

        offset += 1 + len;
    }
}

/// Format an HCI (little-endian) device address the usual way.
fn format_address(addr: &[u8]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        addr[5], addr[4], addr[3], addr[2], addr[1], addr[0]
    )
}

/// Parse all reports of an LE Advertising Report event.
///
/// `packet` is the full HCI event packet including the packet type byte.
fn parse_advertising_reports(packet: &[u8]) -> Result<Vec<AdvertisementEvent>, ReportError> {
    // packet type, event code, parameter length, subevent
    let params = packet.get(4..).ok_or(ReportError::Truncated("header"))?;
    let (&num_reports, mut rest) = params
        .split_first()
        .ok_or(ReportError::Truncated("report count"))?;

    let mut events = Vec::with_capacity(num_reports as usize);
    for _ in 0..num_reports {
        // event type(1) + address type(1) + address(6) + data length(1)
        if rest.len() < 9 {
            return Err(ReportError::Truncated("report header"));
        }
        let address = format_address(&rest[2..8]);
        let data_len = rest[8] as usize;

        // AD data followed by the signed RSSI byte
        let body = &rest[9..];
        if body.len() < data_len + 1 {
            return Err(ReportError::Truncated("report data"));
        }
        let rssi = i16::from(body[data_len] as i8);

        let mut event = AdvertisementEvent::new(address, rssi);
        parse_ad_structures(&body[..data_len], &mut event);
        events.push(event);

        rest = &body[data_len + 1..];
    }

    Ok(events)
}

/// Read one packet from a non-blocking socket.
fn read_packet(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Outcome of one read from the event socket.
#[derive(Debug)]
enum ReadStatus {
    Packet(usize),
    Retry,
    /// The socket will not produce more packets (adapter gone, EOF).
    Closed(String),
}

fn read_status(result: io::Result<usize>) -> ReadStatus {
    match result {
        Ok(0) => ReadStatus::Closed("end of stream".to_string()),
        Ok(n) => ReadStatus::Packet(n),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadStatus::Retry,
        Err(e) => ReadStatus::Closed(e.to_string()),
    }
}

/// Start scanning for advertisements using raw HCI sockets on hci0.
///
/// The controller does not filter by manufacturer here, so `target_id` is
/// only used for logging; every advertisement is forwarded.
///
/// # Errors
/// Returns `ScanError::SourceUnavailable` if the sockets cannot be opened,
/// bound or configured.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (typically hci0)
pub async fn start_scan(target_id: u16) -> Result<ScanHandle, ScanError> {
    // Open and configure HCI socket for receiving events
    let fd = open_hci_socket()?;
    bind_hci_socket(&fd, 0)?;
    set_hci_filter(&fd)?;

    // We need a separate socket for sending commands
    let cmd_fd = open_hci_socket()?;
    bind_hci_socket(&cmd_fd, 0)?;
    send_hci_command(&cmd_fd, &scan_parameters_packet())?;
    send_hci_command(&cmd_fd, &scan_enable_packet(true))?;
    debug!("HCI passive scan enabled on hci0 (target 0x{target_id:04X})");

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let async_fd = AsyncFd::new(fd)
        .map_err(|e| ScanError::SourceUnavailable(format!("Failed to create async fd: {e}")))?;

    let task = tokio::spawn(async move {
        let mut buf = [0u8; HCI_MAX_EVENT_SIZE];

        'events: loop {
            let mut guard = tokio::select! {
                _ = &mut shutdown_rx => break,
                ready = async_fd.readable() => match ready {
                    Ok(guard) => guard,
                    Err(_) => break,
                },
            };

            // Drain all available packets before waiting again
            loop {
                let result = match guard.try_io(|inner| read_packet(inner.get_ref(), &mut buf)) {
                    Ok(result) => result,
                    Err(_) => break, // WouldBlock - no more data
                };
                let n = match read_status(result) {
                    ReadStatus::Packet(n) => n,
                    ReadStatus::Retry => continue,
                    ReadStatus::Closed(reason) => {
                        debug!("HCI event socket closed: {reason}");
                        break 'events;
                    }
                };

                let packet = &buf[..n];
                if n < 4
                    || packet[0] != HCI_EVENT_PKT
                    || packet[1] != EVT_LE_META_EVENT
                    || packet[3] != EVT_LE_ADVERTISING_REPORT
                {
                    continue;
                }

                match parse_advertising_reports(packet) {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                break 'events;
                            }
                        }
                    }
                    Err(e) => trace!("{e}"),
                }
            }
        }

        if let Err(e) = send_hci_command(&cmd_fd, &scan_enable_packet(false)) {
            debug!("could not disable HCI scan: {e}");
        }
    });

    Ok(ScanHandle::new(rx, shutdown_tx, task))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an LE advertising report event carrying the given reports.
    fn report_packet(reports: &[(&[u8; 6], &[u8], i8)]) -> Vec<u8> {
        let mut params = vec![EVT_LE_ADVERTISING_REPORT, reports.len() as u8];
        for (addr, ad, rssi) in reports {
            params.push(0x03); // ADV_NONCONN_IND
            params.push(0x01); // random address
            let mut le_addr = **addr;
            le_addr.reverse();
            params.extend_from_slice(&le_addr);
            params.push(ad.len() as u8);
            params.extend_from_slice(ad);
            params.push(*rssi as u8);
        }
        let mut packet = vec![HCI_EVENT_PKT, EVT_LE_META_EVENT, params.len() as u8];
        packet.extend_from_slice(&params);
        packet
    }

    const ADDR: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    #[test]
    fn test_hci_filter_setup() {
        let mut filter = HciFilter::new();
        filter.set_ptype(HCI_EVENT_PKT);
        filter.set_event(EVT_LE_META_EVENT);

        // HCI_EVENT_PKT (0x04) sets bit 4 in type_mask
        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
        // EVT_LE_META_EVENT (0x3E = 62) sets bit 30 in event_mask[1]
        assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT % 32));
    }

    #[test]
    fn test_read_status_ends_scan_on_persistent_errors() {
        assert!(matches!(read_status(Ok(42)), ReadStatus::Packet(42)));
        assert!(matches!(read_status(Ok(0)), ReadStatus::Closed(_)));
        assert!(matches!(
            read_status(Err(io::Error::from_raw_os_error(libc::ENODEV))),
            ReadStatus::Closed(_)
        ));
        assert!(matches!(
            read_status(Err(io::Error::from(io::ErrorKind::Interrupted))),
            ReadStatus::Retry
        ));
    }

    #[test]
    fn test_scan_enable_packet() {
        assert_eq!(scan_enable_packet(true), vec![0x01, 0x0C, 0x20, 0x02, 0x01, 0x00]);
        assert_eq!(scan_enable_packet(false), vec![0x01, 0x0C, 0x20, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_scan_parameters_packet() {
        let packet = scan_parameters_packet();
        assert_eq!(&packet[..4], &[0x01, 0x0B, 0x20, 0x07]);
        assert_eq!(&packet[4..], &[0x00, 0x10, 0x00, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_manufacturer_data() {
        // flags, then manufacturer data for 0x01CE with payload 12 34
        let ad = [0x02, 0x01, 0x06, 0x05, 0xFF, 0xCE, 0x01, 0x12, 0x34];
        let events = parse_advertising_reports(&report_packet(&[(&ADDR, &ad[..], -67)])).unwrap();

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(event.rssi, -67);
        assert_eq!(event.manufacturer_data.get(&0x01CE), Some(&vec![0x12, 0x34]));
        assert!(event.service_data.is_empty());
    }

    #[test]
    fn test_parse_manufacturer_id_without_payload() {
        let ad = [0x03, 0xFF, 0xCE, 0x01];
        let events = parse_advertising_reports(&report_packet(&[(&ADDR, &ad[..], -40)])).unwrap();
        assert_eq!(events[0].manufacturer_data.get(&0x01CE), Some(&vec![]));
    }

    #[test]
    fn test_parse_service_data() {
        let mut ad = vec![0x04, 0x16, 0x0F, 0x18, 0x64]; // battery service, 100%
        ad.extend_from_slice(&[0x03, 0x20, 0x01, 0x02]); // too short for 32-bit uuid
        let events = parse_advertising_reports(&report_packet(&[(&ADDR, &ad[..], -50)])).unwrap();

        let event = &events[0];
        assert_eq!(
            event.service_data.get("0000180f-0000-1000-8000-00805f9b34fb"),
            Some(&vec![0x64])
        );
        assert_eq!(event.service_data.len(), 1);
    }

    #[test]
    fn test_parse_service_data_128() {
        let uuid = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let mut ad = vec![0x12, AD_TYPE_SERVICE_DATA_128];
        ad.extend_from_slice(&uuid.as_u128().to_le_bytes());
        ad.push(0xAB);
        let events = parse_advertising_reports(&report_packet(&[(&ADDR, &ad[..], -50)])).unwrap();

        assert_eq!(
            events[0].service_data.get("6e400001-b5a3-f393-e0a9-e50e24dcca9e"),
            Some(&vec![0xAB])
        );
    }

    #[test]
    fn test_parse_multiple_reports() {
        let other = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let ad1 = [0x05, 0xFF, 0x4C, 0x00, 0x02, 0x15];
        let ad2 = [0x04, 0xFF, 0xCE, 0x01, 0x99];
        let packet = report_packet(&[(&ADDR, &ad1[..], -80), (&other, &ad2[..], -30)]);
        let events = parse_advertising_reports(&packet).unwrap();

        assert_eq!(events.len(), 2);
        assert!(events[0].manufacturer_data.contains_key(&0x004C));
        assert_eq!(events[1].address, "11:22:33:44:55:66");
        assert_eq!(events[1].rssi, -30);
        assert_eq!(events[1].manufacturer_data.get(&0x01CE), Some(&vec![0x99]));
    }

    #[test]
    fn test_parse_stops_at_overrunning_structure() {
        let ad = [0x04, 0xFF, 0xCE, 0x01, 0x01, 0x09, 0xFF, 0x00];
        let events = parse_advertising_reports(&report_packet(&[(&ADDR, &ad[..], -50)])).unwrap();
        assert_eq!(events[0].manufacturer_data.get(&0x01CE), Some(&vec![0x01]));
        assert_eq!(events[0].manufacturer_data.len(), 1);
    }

    #[test]
    fn test_parse_truncated_report() {
        let mut packet = report_packet(&[(&ADDR, &[0x02u8, 0x01, 0x06][..], -50)]);
        packet.truncate(packet.len() - 2);
        assert_eq!(
            parse_advertising_reports(&packet),
            Err(ReportError::Truncated("report data"))
        );
        assert!(parse_advertising_reports(&[HCI_EVENT_PKT, EVT_LE_META_EVENT]).is_err());
    }

    #[test]
    fn test_short_uuid() {
        assert_eq!(
            short_uuid(0x01CE).to_string(),
            "000001ce-0000-1000-8000-00805f9b34fb"
        );
    }
}
