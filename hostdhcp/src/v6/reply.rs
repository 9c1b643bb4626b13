use std::net::Ipv6Addr;
use std::time::Duration;

use bytes::BufMut;

use crate::codec::Encode;
use crate::error::{Error, Result};
use crate::response::ResponseConfig;

use super::packet::{duid_ll, ClientMessage, MessageType, OptionCode, Options};

// https://datatracker.ietf.org/doc/html/rfc8415#section-21.13
const STATUS_SUCCESS: u16 = 0;

/// The message type a client message is answered with.
pub fn reply_message_type(request: MessageType) -> Option<MessageType> {
    match request {
        MessageType::Solicit => Some(MessageType::Advertise),
        MessageType::Request
        | MessageType::Confirm
        | MessageType::Renew
        | MessageType::Rebind
        | MessageType::InformationRequest => Some(MessageType::Reply),
        _ => None,
    }
}

/// Builds the answer to `request` from `conf`.
pub fn make_dhcp6_reply(request: &ClientMessage, conf: &ResponseConfig) -> Result<ClientMessage> {
    let msg_type = reply_message_type(request.msg_type)
        .ok_or(Error::UnsupportedMessage(request.msg_type.to_u8()))?;

    let mut options = Options::new();
    if let Some(client_id) = request.options.get(OptionCode::CLIENT_ID) {
        options.push(OptionCode::CLIENT_ID, client_id.to_vec());
    }
    options.push(OptionCode::SERVER_ID, duid_ll(conf.interface_mac));

    if let (Some(ia_na), Some(addr)) = (request.options.get(OptionCode::IA_NA), conf.client_ip6) {
        options.push(OptionCode::IA_NA, ia_na_reply(ia_na, addr, conf.lease_time)?);
    }

    if !conf.dns_servers6.is_empty() {
        options.push(OptionCode::DNS_SERVERS, addr_list(&conf.dns_servers6));
    }
    if let Some(domain) = &conf.domain {
        options.push(OptionCode::DOMAIN_LIST, domain_name(domain));
    }
    if !conf.ntp_servers6.is_empty() {
        options.push(OptionCode::SNTP_SERVERS, addr_list(&conf.ntp_servers6));
    }

    Ok(ClientMessage {
        msg_type,
        transaction_id: request.transaction_id,
        options,
    })
}

// https://datatracker.ietf.org/doc/html/rfc8415#section-21.4
fn ia_na_reply(request: &[u8], addr: Ipv6Addr, lease: Duration) -> Result<Vec<u8>> {
    // IAID, T1 and T2 are echoed back.
    let header = request
        .get(..12)
        .ok_or_else(|| Error::InvalidFormat(format!("IA_NA option of {} bytes", request.len())))?;

    let lifetime = u32::try_from(lease.as_secs()).unwrap_or(u32::MAX);

    let mut status = Options::new();
    let mut value = Vec::new();
    STATUS_SUCCESS.encode(&mut value);
    value.put_slice(b"Success");
    status.push(OptionCode::STATUS_CODE, value);

    // https://datatracker.ietf.org/doc/html/rfc8415#section-21.6
    let mut iaaddr = Vec::new();
    addr.encode(&mut iaaddr);
    lifetime.encode(&mut iaaddr);
    lifetime.encode(&mut iaaddr);
    status.encode(&mut iaaddr);

    let mut suboptions = Options::new();
    suboptions.push(OptionCode::IAADDR, iaaddr);

    let mut buf = header.to_vec();
    suboptions.encode(&mut buf);
    Ok(buf)
}

fn addr_list(addrs: &[Ipv6Addr]) -> Vec<u8> {
    addrs.iter().flat_map(|addr| addr.octets()).collect()
}

// Uncompressed DNS wire format (RFC 1035 §3.1).
fn domain_name(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 2);
    for label in name.split('.').filter(|label| !label.is_empty()) {
        let label = &label.as_bytes()[..label.len().min(63)];
        buf.push(label.len() as u8);
        buf.put_slice(label);
    }
    buf.push(0);
    buf
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{domain_name, make_dhcp6_reply};
    use crate::error::Error;
    use crate::mac::MacAddr;
    use crate::response::ResponseConfig;
    use crate::v6::packet::{duid_ll, ClientMessage, MessageType, OptionCode, Options};

    const CLIENT: MacAddr = MacAddr::from_octets([0x52, 0x54, 0, 0, 0, 1]);
    const SERVER: MacAddr = MacAddr::from_octets([0x02, 0, 0, 0, 0, 0xfe]);

    fn request(msg_type: MessageType) -> ClientMessage {
        let mut options = Options::new();
        options.push(OptionCode::CLIENT_ID, duid_ll(CLIENT));
        // IAID 7, T1 0, T2 0
        options.push(OptionCode::IA_NA, vec![0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0]);
        ClientMessage {
            msg_type,
            transaction_id: 0x0011_2233,
            options,
        }
    }

    fn config() -> ResponseConfig {
        ResponseConfig {
            interface_mac: SERVER,
            client_ip6: Some("2001:db8::5".parse().unwrap()),
            dns_servers6: vec!["2001:4860:4860::8888".parse().unwrap()],
            domain: Some("cloud.local".into()),
            lease_time: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[test]
    fn solicit_gets_advertise() {
        let reply = make_dhcp6_reply(&request(MessageType::Solicit), &config()).unwrap();
        assert_eq!(reply.msg_type, MessageType::Advertise);
        assert_eq!(reply.transaction_id, 0x0011_2233);
        assert_eq!(reply.options.get(OptionCode::CLIENT_ID), Some(&duid_ll(CLIENT)[..]));
        assert_eq!(
            reply.options.get(OptionCode::SERVER_ID),
            Some(&[0, 3, 0, 1, 2, 0, 0, 0, 0, 0xfe][..])
        );
        assert_eq!(
            reply.options.get(OptionCode::DOMAIN_LIST),
            Some(&b"\x05cloud\x05local\x00"[..])
        );
    }

    #[test]
    fn ia_na_carries_address_and_status() {
        let reply = make_dhcp6_reply(&request(MessageType::Request), &config()).unwrap();
        assert_eq!(reply.msg_type, MessageType::Reply);

        let ia_na = reply.options.get(OptionCode::IA_NA).unwrap();
        assert_eq!(&ia_na[..4], &[0, 0, 0, 7]);

        let sub = Options::decode(&ia_na[12..]).unwrap();
        let iaaddr = sub.get(OptionCode::IAADDR).unwrap();
        assert_eq!(&iaaddr[..16], &"2001:db8::5".parse::<std::net::Ipv6Addr>().unwrap().octets());
        assert_eq!(&iaaddr[16..20], &3600u32.to_be_bytes());
        assert_eq!(&iaaddr[20..24], &3600u32.to_be_bytes());

        let status = Options::decode(&iaaddr[24..]).unwrap();
        assert_eq!(status.get(OptionCode::STATUS_CODE), Some(&b"\x00\x00Success"[..]));
    }

    #[test]
    fn unsupported_types_are_rejected() {
        for msg_type in [MessageType::Release, MessageType::Decline, MessageType::Advertise] {
            assert!(matches!(
                make_dhcp6_reply(&request(msg_type), &config()),
                Err(Error::UnsupportedMessage(_))
            ));
        }
    }

    #[test]
    fn short_ia_na_is_invalid() {
        let mut req = request(MessageType::Request);
        req.options = Options::new();
        req.options.push(OptionCode::IA_NA, vec![0, 0, 0, 7]);
        assert!(matches!(
            make_dhcp6_reply(&req, &config()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn domain_labels() {
        assert_eq!(domain_name("a.bc."), b"\x01a\x02bc\x00");
    }
}
