//! SOOD: the UDP multicast/broadcast service-discovery protocol used to
//! locate Cores on the local network, entirely separate from the
//! WebSocket transport.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::errors::DiscoveryError;

const SOOD_PORT: u16 = 9003;
const SOOD_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 90, 90);
const SOOD_MAGIC: &[u8; 4] = b"SOOD";
const SOOD_VERSION: u8 = 0x02;
const NULL_VALUE_LEN: u16 = 0xFFFF;

const QUERY_SERVICE_ID: &str = "00720724-5143-4a9b-abac-0e50cba674bb";
const DEFAULT_TIMEOUT_MS: u64 = 3000;
const PER_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// A Core discovered by a SOOD query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredCore {
    pub unique_id: String,
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameType {
    Query,
    Response,
}

impl FrameType {
    fn as_byte(self) -> u8 {
        match self {
            FrameType::Query => b'Q',
            FrameType::Response => b'R',
        }
    }
}

/// A single decoded SOOD property: a name with an optional (possibly-null)
/// UTF-8 value.
type Properties = Vec<(String, Option<String>)>;

fn encode_property(out: &mut Vec<u8>, name: &str, value: Option<&str>) {
    let name_bytes = name.as_bytes();
    debug_assert!(!name_bytes.is_empty() && name_bytes.len() <= u8::MAX as usize);
    out.push(name_bytes.len() as u8);
    out.extend_from_slice(name_bytes);
    match value {
        Some(v) => {
            let v_bytes = v.as_bytes();
            out.extend_from_slice(&(v_bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(v_bytes);
        }
        None => out.extend_from_slice(&NULL_VALUE_LEN.to_be_bytes()),
    }
}

fn encode_query(tid: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SOOD_MAGIC);
    out.push(SOOD_VERSION);
    out.push(FrameType::Query.as_byte());
    encode_property(&mut out, "_tid", Some(tid));
    encode_property(&mut out, "query_service_id", Some(QUERY_SERVICE_ID));
    out
}

/// Decode a SOOD frame's properties. Range-checks every length prefix
/// against the remaining buffer and returns `None` on any truncation,
/// rather than a partial result.
fn decode_properties(mut rest: &[u8]) -> Option<Properties> {
    let mut props = Vec::new();
    while !rest.is_empty() {
        let name_len = *rest.first()? as usize;
        if name_len == 0 {
            return None
        }
        rest = rest.get(1..)?;
        let name_bytes = rest.get(..name_len)?;
        let name = std::str::from_utf8(name_bytes).ok()?.to_string();
        rest = rest.get(name_len..)?;

        let len_bytes = rest.get(..2)?;
        let value_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]);
        rest = rest.get(2..)?;

        if value_len == NULL_VALUE_LEN {
            props.push((name, None));
            continue
        }

        let value_bytes = rest.get(..value_len as usize)?;
        let value = std::str::from_utf8(value_bytes).ok()?.to_string();
        rest = rest.get(value_len as usize..)?;
        props.push((name, Some(value)));
    }
    Some(props)
}

fn decode_frame(bytes: &[u8]) -> Option<(FrameType, Properties)> {
    if bytes.len() < 6 {
        return None
    }
    if &bytes[0..4] != SOOD_MAGIC || bytes[4] != SOOD_VERSION {
        return None
    }
    let frame_type = match bytes[5] {
        b'Q' => FrameType::Query,
        b'R' => FrameType::Response,
        _ => return None,
    };
    let props = decode_properties(&bytes[6..])?;
    Some((frame_type, props))
}

fn response_to_core(props: Properties, source: SocketAddr) -> Option<DiscoveredCore> {
    let mut map: HashMap<String, Option<String>> = props.into_iter().collect();

    let service_id = map.get("service_id")?.clone()?;
    if service_id != QUERY_SERVICE_ID {
        return None
    }

    let unique_id = map.get("unique_id")?.clone()?;
    let http_port = map.get("http_port")?.clone()?;
    let port: u16 = http_port.parse().ok()?;

    let host = map
        .remove("_replyaddr")
        .flatten()
        .unwrap_or_else(|| match source {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            SocketAddr::V6(v6) => v6.ip().to_string(),
        });

    let name = map.remove("name").flatten();
    let version = map.remove("display_version").flatten();

    Some(DiscoveredCore { unique_id, host, port, name, version })
}

fn local_ipv4_broadcast_addrs() -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    let ifaces = if_addrs::get_if_addrs()?;
    let mut addrs = Vec::new();
    for iface in ifaces {
        if iface.is_loopback() {
            continue
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            if let Some(broadcast) = v4.broadcast {
                addrs.push(broadcast);
            }
        }
    }
    Ok(addrs)
}

/// Run a SOOD discovery exchange: enumerate non-loopback IPv4 interfaces,
/// send one multicast query and one directed-broadcast query per
/// interface, collect de-duplicated responses (keyed by `unique_id`, last
/// writer wins) until `timeout_ms` elapses.
pub async fn discover(timeout_ms: Option<u64>) -> Result<Vec<DiscoveredCore>, DiscoveryError> {
    let deadline = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));

    let broadcasts = local_ipv4_broadcast_addrs()?;

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let tid = uuid::Uuid::new_v4().to_string();
    let query = encode_query(&tid);

    let multicast_dest = SocketAddr::V4(SocketAddrV4::new(SOOD_MULTICAST_GROUP, SOOD_PORT));
    if let Err(e) = socket.send_to(&query, multicast_dest).await {
        warn!(err = %e, "failed to send SOOD query to multicast group");
    }
    for addr in &broadcasts {
        if let Err(e) = socket.send_to(&query, SocketAddr::V4(SocketAddrV4::new(*addr, SOOD_PORT))).await
        {
            warn!(err = %e, addr = %addr, "failed to send SOOD query to broadcast address");
        }
    }

    let mut found: HashMap<String, DiscoveredCore> = HashMap::new();
    let mut buf = vec![0u8; 2048];
    let started = tokio::time::Instant::now();

    loop {
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            break
        }
        let remaining = deadline - elapsed;
        let recv_timeout = PER_RECV_TIMEOUT.min(remaining);

        match tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, source))) => {
                if let Some((FrameType::Response, props)) = decode_frame(&buf[..n]) {
                    if let Some(core) = response_to_core(props, source) {
                        trace!(unique_id = %core.unique_id, host = %core.host, "discovered core");
                        found.insert(core.unique_id.clone(), core);
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(err = %e, "udp recv error during discovery");
            }
            Err(_elapsed) => {
                // per-recv timeout; loop back around and re-check the deadline
            }
        }
    }

    Ok(found.into_values().collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_properties_including_null_value() {
        let mut bytes = Vec::new();
        encode_property(&mut bytes, "_tid", Some("abc"));
        encode_property(&mut bytes, "empty", None);
        let props = decode_properties(&bytes).unwrap();
        assert_eq!(props, vec![("_tid".to_string(), Some("abc".to_string())), ("empty".to_string(), None)]);
    }

    #[test]
    fn decodes_a_full_query_frame() {
        let query = encode_query("tid-1");
        let (kind, props) = decode_frame(&query).unwrap();
        assert_eq!(kind, FrameType::Query);
        assert!(props.iter().any(|(k, v)| k == "query_service_id" && v.as_deref() == Some(QUERY_SERVICE_ID)));
    }

    #[test]
    fn rejects_bad_magic_or_version() {
        assert!(decode_frame(b"XXXX\x02Q").is_none());
        let mut bad_version = SOOD_MAGIC.to_vec();
        bad_version.push(0x09);
        bad_version.push(b'Q');
        assert!(decode_frame(&bad_version).is_none());
    }

    #[test]
    fn returns_none_on_truncated_properties() {
        let mut bytes = SOOD_MAGIC.to_vec();
        bytes.push(SOOD_VERSION);
        bytes.push(b'R');
        bytes.push(5); // claims a 5-byte name, provides none
        assert!(decode_frame(&bytes).is_none());
    }

    #[test]
    fn response_is_filtered_by_service_id_and_required_fields() {
        let source: SocketAddr = "10.0.0.5:9003".parse().unwrap();

        let wrong_service = vec![
            ("service_id".to_string(), Some("other".to_string())),
            ("unique_id".to_string(), Some("abc".to_string())),
            ("http_port".to_string(), Some("9330".to_string())),
        ];
        assert!(response_to_core(wrong_service, source).is_none());

        let missing_port = vec![
            ("service_id".to_string(), Some(QUERY_SERVICE_ID.to_string())),
            ("unique_id".to_string(), Some("abc".to_string())),
        ];
        assert!(response_to_core(missing_port, source).is_none());

        let valid = vec![
            ("service_id".to_string(), Some(QUERY_SERVICE_ID.to_string())),
            ("unique_id".to_string(), Some("abc".to_string())),
            ("http_port".to_string(), Some("9330".to_string())),
        ];
        let core = response_to_core(valid, source).unwrap();
        assert_eq!(core.unique_id, "abc");
        assert_eq!(core.port, 9330);
        assert_eq!(core.host, "10.0.0.5");
    }

    #[test]
    fn replyaddr_overrides_source_address() {
        let source: SocketAddr = "10.0.0.5:9003".parse().unwrap();
        let props = vec![
            ("service_id".to_string(), Some(QUERY_SERVICE_ID.to_string())),
            ("unique_id".to_string(), Some("abc".to_string())),
            ("http_port".to_string(), Some("9330".to_string())),
            ("_replyaddr".to_string(), Some("192.168.1.9".to_string())),
        ];
        let core = response_to_core(props, source).unwrap();
        assert_eq!(core.host, "192.168.1.9");
    }
}
