//! Smoke tests driving the parser, command processor, and writer together
//! as a connection would, without a real socket.
//!
//! Run with: `cargo test -p kvcached --test smoke_test`

use std::io::Cursor;
use std::sync::Arc;

use kvcached::command::CommandProcessor;
use kvcached::protocol::{Parser, ParserEvent};
use kvcached::table::Table;
use kvcached::writer::Writer;

fn run(input: &[u8]) -> String {
    let table = Arc::new(Table::new(64, 24, 48));
    let processor = CommandProcessor::new(table);
    let mut parser = Parser::new();
    let mut writer = Writer::default();
    let mut events = Vec::new();
    parser.feed(input, &mut events);
    for event in events {
        match event {
            ParserEvent::Command(cmd) => {
                processor.dispatch(cmd, &mut writer);
            }
            ParserEvent::RawError(msg) => {
                writer.reserve_and_append(&msg);
            }
            ParserEvent::MultiGetEnd => processor.multi_get_end(&mut writer),
        }
    }
    let mut sink = Cursor::new(Vec::new());
    writer.flush(&mut sink).expect("flush ok");
    String::from_utf8(sink.into_inner()).expect("ascii response")
}

/// Scenario 1: ASCII set then get.
#[test]
fn test_ascii_set_then_get() {
    let out = run(b"set k 1 0 3\r\nabc\r\nget k\r\n");
    assert_eq!(out, "STORED\r\nVALUE k 1 3\r\nabc\r\nEND\r\n");
}

/// Scenario 2: ASCII cas mismatch leaves the stored value unchanged.
#[test]
fn test_ascii_cas_mismatch() {
    let out = run(b"set k 1 0 3\r\nabc\r\ncas k 1 0 3 999\r\nxyz\r\nget k\r\n");
    assert_eq!(out, "STORED\r\nEXISTS\r\nVALUE k 1 3\r\nabc\r\nEND\r\n");
}

/// Scenario 3: incr on a missing key with the ASCII sentinel (no seed).
#[test]
fn test_incr_on_missing_key_ascii() {
    let out = run(b"incr absent 5\r\n");
    assert_eq!(out, "NOT_FOUND\r\n");
}

/// Scenario 6: multi-get silently omits an absent key.
#[test]
fn test_multi_get_omits_absent_key() {
    let out = run(b"set a 0 0 1\r\n1\r\nset b 0 0 1\r\n2\r\nget a b c\r\n");
    assert_eq!(out, "STORED\r\nSTORED\r\nVALUE a 0 1\r\n1\r\nVALUE b 0 1\r\n2\r\nEND\r\n");
}

#[test]
fn test_delete_then_get_misses() {
    let out = run(b"set k 0 0 1\r\nv\r\ndelete k\r\nget k\r\n");
    assert_eq!(out, "STORED\r\nDELETED\r\nEND\r\n");
}

#[test]
fn test_delete_requires_full_crlf() {
    // A bare `\n` terminator is accepted by every storage/retrieval verb
    // except `delete`, so this line is rejected rather than deleting `k`.
    let out = run(b"set k 0 0 1\r\nv\r\ndelete k\nget k\r\n");
    assert!(out.contains("CLIENT_ERROR"));
    assert!(out.contains("VALUE k 0 1\r\nv\r\nEND\r\n"));
}

#[test]
fn test_append_prepend_build_up_a_value() {
    let out = run(b"set k 0 0 1\r\na\r\nappend k 0 0 1\r\nb\r\nprepend k 0 0 1\r\nc\r\nget k\r\n");
    assert_eq!(out, "STORED\r\nSTORED\r\nSTORED\r\nVALUE k 0 3\r\ncab\r\nEND\r\n");
}

#[test]
fn test_flush_all_expires_everything() {
    let out = run(b"set k 0 0 1\r\nv\r\nflush_all\r\nget k\r\n");
    assert_eq!(out, "STORED\r\nOK\r\nEND\r\n");
}

#[test]
fn test_noreply_storage_suppresses_success_but_not_errors() {
    let out = run(b"set k 0 0 1 noreply\r\nv\r\nadd k 0 0 1 noreply\r\nx\r\nget k\r\n");
    assert_eq!(out, "NOT_STORED\r\nVALUE k 0 1\r\nv\r\nEND\r\n");
}

#[test]
fn test_unknown_verb_yields_generic_error_and_resyncs() {
    let out = run(b"bogus k\r\nget k\r\n");
    assert_eq!(out, "ERROR\r\nEND\r\n");
}

#[test]
fn test_binary_set_then_get_roundtrip() {
    let table = Arc::new(Table::new(64, 24, 48));
    let processor = CommandProcessor::new(table);
    let mut parser = Parser::new();
    let mut writer = Writer::default();

    let mut set_raw = vec![0x80u8, 0x01]; // Set
    set_raw.extend_from_slice(&1u16.to_be_bytes());
    set_raw.push(8);
    set_raw.push(0);
    set_raw.extend_from_slice(&0u16.to_be_bytes());
    set_raw.extend_from_slice(&(8u32 + 1 + 1).to_be_bytes());
    set_raw.extend_from_slice(&0u32.to_be_bytes());
    set_raw.extend_from_slice(&0u64.to_be_bytes());
    set_raw.extend_from_slice(&0u32.to_be_bytes()); // flags
    set_raw.extend_from_slice(&0u32.to_be_bytes()); // expiration
    set_raw.push(b'k');
    set_raw.push(b'v');

    let mut events = Vec::new();
    parser.feed(&set_raw, &mut events);
    for event in events.drain(..) {
        if let ParserEvent::Command(cmd) = event {
            processor.dispatch(cmd, &mut writer);
        }
    }
    let mut sink = Cursor::new(Vec::new());
    writer.flush(&mut sink).unwrap();
    let resp = sink.into_inner();
    assert_eq!(resp[0], 0x81);
    assert_eq!(u16::from_be_bytes([resp[6], resp[7]]), 0x00); // NoError

    let mut get_raw = vec![0x80u8, 0x00]; // Get
    get_raw.extend_from_slice(&1u16.to_be_bytes());
    get_raw.push(0);
    get_raw.push(0);
    get_raw.extend_from_slice(&0u16.to_be_bytes());
    get_raw.extend_from_slice(&1u32.to_be_bytes());
    get_raw.extend_from_slice(&0u32.to_be_bytes());
    get_raw.extend_from_slice(&0u64.to_be_bytes());
    get_raw.push(b'k');

    parser.feed(&get_raw, &mut events);
    for event in events.drain(..) {
        if let ParserEvent::Command(cmd) = event {
            processor.dispatch(cmd, &mut writer);
        }
    }
    let mut sink = Cursor::new(Vec::new());
    writer.flush(&mut sink).unwrap();
    let resp = sink.into_inner();
    assert_eq!(resp[0], 0x81);
    assert_eq!(u16::from_be_bytes([resp[6], resp[7]]), 0x00);
    let body_len = u32::from_be_bytes([resp[8], resp[9], resp[10], resp[11]]) as usize;
    assert_eq!(&resp[24 + body_len - 1..24 + body_len], b"v");
}
