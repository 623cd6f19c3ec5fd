//! CLI surface integration tests

use clap::Parser;
use unicornscan_cli::args::Args;
use unicornscan_core::{ScanMode, TcpFlags};

fn settings_for(argv: &[&str]) -> unicornscan_core::ScanSettings {
    Args::try_parse_from(argv).unwrap().build_settings().unwrap()
}

#[test]
fn full_flag_surface_parses() {
    let settings = settings_for(&[
        "unicornscan",
        "-mA+T100:R3:L15",
        "-p",
        "80,443:2",
        "-r",
        "500",
        "-R",
        "2",
        "-L",
        "10",
        "-s",
        "10.0.0.99",
        "-H",
        "02:00:00:00:00:01",
        "-i",
        "eth0",
        "-t",
        "64",
        "-T",
        "16",
        "-B",
        "NT",
        "-c",
        "-I",
        "-Z",
        "192.168.77.0/28",
    ]);

    assert_eq!(settings.phases.len(), 2);
    assert_eq!(settings.phases[0].mode, ScanMode::Arp);
    assert_eq!(settings.phases[1].mode, ScanMode::Tcp);
    assert_eq!(settings.phases[1].pps, 100);
    assert_eq!(settings.phases[1].repeats, 3);
    assert_eq!(settings.phases[1].recv_timeout, 15);
    // Explicit -r/-R/-L set the globals.
    assert_eq!(settings.pps, 500);
    assert_eq!(settings.repeats, 2);
    assert_eq!(settings.recv_timeout, 10);
    assert_eq!(settings.interfaces, vec!["eth0"]);
    assert_eq!(settings.tos, 16);
    assert!(settings.options.report_broken_net);
    assert!(settings.options.report_broken_trans);
    assert!(settings.options.process_dups);
    assert!(settings.options.immediate);
    assert!(settings.options.shuffle);
    assert_eq!(settings.ports.probe_count(), 1 + 2);
}

#[test]
fn tcp_flag_letters_reach_the_phase() {
    let settings = settings_for(&["unicornscan", "-mTSF", "-p", "80", "10.0.0.1"]);
    assert_eq!(
        settings.phases[0].tcp_flags,
        TcpFlags::SYN.with(TcpFlags::FIN)
    );
}

#[test]
fn connect_mode_spelled_tsf() {
    let settings = settings_for(&["unicornscan", "-mTsf", "-p", "80", "10.0.0.1"]);
    assert_eq!(settings.phases[0].mode, ScanMode::TcpConnect);
}

#[test]
fn scan_key_is_fresh_per_scan() {
    let a = settings_for(&["unicornscan", "10.0.0.1"]);
    let b = settings_for(&["unicornscan", "10.0.0.1"]);
    assert_ne!(a.scan_id, b.scan_id);
    // Two scans sharing a key would cross-validate each other's cookies;
    // astronomically unlikely by construction.
    assert_ne!(a.syn_key, b.syn_key);
}

#[test]
fn bad_cli_is_rejected() {
    for argv in [
        vec!["unicornscan"],                                // no targets
        vec!["unicornscan", "-mX", "10.0.0.1"],             // bad mode
        vec!["unicornscan", "-p", "0-", "10.0.0.1"],        // bad ports
        vec!["unicornscan", "-t", "banana", "10.0.0.1"],    // bad ttl
        vec!["unicornscan", "300.1.2.3"],                   // bad target
    ] {
        let parsed = Args::try_parse_from(&argv);
        let ok = parsed
            .map(|args| args.build_settings().is_ok())
            .unwrap_or(false);
        assert!(!ok, "argv {:?} should not produce settings", argv);
    }
}
