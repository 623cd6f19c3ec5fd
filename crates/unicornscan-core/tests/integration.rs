//! Cross-module integration tests for unicornscan-core

use std::net::Ipv4Addr;
use unicornscan_core::{
    classify_source_port, encode_payload_port, encode_trace_port, parse_mode_spec, syn_cookie,
    verify_cookie, Message, PortList, ScanMode, ScanSettings, SourcePortClass, Target,
};

#[test]
fn cookie_survives_workunit_serialization() {
    // The key planted in a workunit must verify cookies computed by a sender
    // that only ever saw the decoded workunit.
    let phases = parse_mode_spec("T").unwrap();
    let settings = ScanSettings::new(
        phases,
        vec![Target::parse("10.9.8.0/24").unwrap()],
        PortList::parse("22,80").unwrap(),
    );

    let src = Ipv4Addr::new(192, 168, 1, 2);
    let dst = Ipv4Addr::new(10, 9, 8, 7);
    let isn = syn_cookie(src, dst, 51000, 22, settings.syn_key);

    // Ship the key through the wire codec inside a send workunit.
    let wu = unicornscan_core::SendWorkunit {
        magic: unicornscan_core::workunit::TCP_SEND_MAGIC,
        id: 1,
        status: unicornscan_core::WorkunitStatus::Queued,
        repeats: 1,
        pps: settings.pps,
        iface: unicornscan_core::InterfaceSnapshot::placeholder(),
        target: Ipv4Addr::new(10, 9, 8, 0),
        prefix: 24,
        tos: 0,
        ttl_min: 64,
        ttl_max: 64,
        ip_options: vec![],
        frag_off: 0,
        src_port: -1,
        tcp_flags: unicornscan_core::TcpFlags::SYN,
        tcp_options: vec![],
        window: 4096,
        syn_key: settings.syn_key,
        port_str: settings.ports.source().to_string(),
    };
    let frame = Message::SendWorkunit(wu).encode();
    let decoded = match Message::decode(&frame).unwrap() {
        Message::SendWorkunit(wu) => wu,
        other => panic!("wrong variant: {:?}", other),
    };

    assert!(verify_cookie(
        isn.wrapping_add(1),
        src,
        dst,
        51000,
        22,
        decoded.syn_key
    ));
}

#[test]
fn port_string_round_trips_through_workunits() {
    // The sender re-parses the port expression carried in the workunit; the
    // probe count must match what the planner computed.
    let list = PortList::parse("80,443:2,8000-8009").unwrap();
    let reparsed = PortList::parse(list.source()).unwrap();
    assert_eq!(list.entries(), reparsed.entries());
    assert_eq!(reparsed.probe_count(), 1 + 2 + 10);
}

#[test]
fn encoded_source_ports_classify_unambiguously() {
    // Any port a sender can emit classifies back into exactly the range that
    // produced it.
    for idx in 0..16u16 {
        let sport = encode_payload_port(52001, idx);
        assert_eq!(classify_source_port(sport), SourcePortClass::Payload(idx));
    }
    for ttl in 1u8..=32 {
        let sport = encode_trace_port(ttl);
        assert_eq!(classify_source_port(sport), SourcePortClass::Trace(ttl));
    }
}

#[test]
fn compound_mode_settings_build() {
    let phases = parse_mode_spec("A+T100:R3:L15").unwrap();
    let settings = ScanSettings::new(
        phases,
        vec![Target::parse("192.168.77.0/28").unwrap()],
        PortList::parse("80").unwrap(),
    );
    assert!(settings.is_compound());
    assert_eq!(settings.phases[0].mode, ScanMode::Arp);
    assert_eq!(settings.phases[1].mode, ScanMode::Tcp);
    // Per-phase modifiers on phase 2 stay per-phase (globals seed from
    // phase 1 only).
    assert_eq!(settings.phases[1].pps, 100);
    assert_eq!(settings.pps, unicornscan_core::DEF_PPS);
}
