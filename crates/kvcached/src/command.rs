//! Command processor: turns a parsed [`CommandRecord`] into a [`Table`]
//! operation and formats the result as an ASCII text line or a binary
//! response frame.
//!
//! One function per request, dispatching to the right `Table` call and
//! mapping the outcome into the caller's wire format: a per-verb dispatch
//! table rather than a single code path, since every memcached verb needs
//! a different `Table` call and a different success/failure rendering.

use std::sync::Arc;

use crate::table::{CacheError, Table, UpsertOp};
use crate::types::{CommandRecord, Extras, StatusCode, Value, Verb};
use crate::writer::Writer;

/// Binary response magic byte.
const BINARY_RESPONSE_MAGIC: u8 = 0x81;

/// Drives [`CommandRecord`]s into [`Table`] operations and writes the
/// formatted response. One instance is shared (via the `Arc<Table>`)
/// across every connection; the processor itself carries no
/// per-connection state; that lives in [`crate::protocol::Parser`] and
/// the caller's [`Writer`].
pub struct CommandProcessor {
    table: Arc<Table>,
}

impl CommandProcessor {
    pub fn new(table: Arc<Table>) -> Self {
        CommandProcessor { table }
    }

    /// Handles one parsed command, appending its response (if any) to
    /// `writer`. Returns `true` iff the connection should be closed after
    /// the writer is flushed.
    pub fn dispatch(&self, cmd: CommandRecord, writer: &mut Writer) -> bool {
        match cmd.verb {
            Verb::Get | Verb::Gets => {
                self.handle_get(&cmd, writer);
                false
            }
            Verb::Gat => {
                self.handle_gat(&cmd, writer);
                false
            }
            Verb::Set | Verb::Add | Verb::Replace | Verb::Append | Verb::Prepend | Verb::Cas => {
                self.handle_store(&cmd, writer);
                false
            }
            Verb::Delete => {
                self.handle_delete(&cmd, writer);
                false
            }
            Verb::Incr | Verb::Decr => {
                self.handle_incr_decr(&cmd, writer);
                false
            }
            Verb::Touch => {
                self.handle_touch(&cmd, writer);
                false
            }
            Verb::FlushAll => {
                self.handle_flush_all(&cmd, writer);
                false
            }
            Verb::Noop => {
                self.handle_noop(&cmd, writer);
                false
            }
            Verb::Version => {
                self.handle_version(&cmd, writer);
                false
            }
            Verb::Stat => {
                self.handle_stat(&cmd, writer);
                false
            }
            Verb::Quit => {
                self.handle_quit(&cmd, writer);
                true
            }
        }
    }

    /// Writes the closing `END\r\n` of an ASCII multi-get batch (the
    /// parser's [`crate::protocol::ParserEvent::MultiGetEnd`]). The binary
    /// protocol has no equivalent marker — its clients use a trailing
    /// `Noop` to flush quiet `GetQ`/`GetKQ` responses instead.
    pub fn multi_get_end(&self, writer: &mut Writer) {
        write_ascii(writer, b"END\r\n");
    }

    // ── get / gets / gat ─────────────────────────────────────────────────

    fn handle_get(&self, cmd: &CommandRecord, writer: &mut Writer) {
        let with_cas = cmd.verb == Verb::Gets;
        match self.table.get(&cmd.key) {
            Some(result) => {
                if cmd.binary {
                    let mut extras = Vec::with_capacity(4);
                    extras.extend_from_slice(&result.flags.to_be_bytes());
                    let key_echo: &[u8] = if cmd.echo_key { &cmd.key } else { &[] };
                    write_binary_response(
                        writer,
                        cmd.raw_opcode,
                        StatusCode::NoError,
                        cmd.opaque,
                        result.cas,
                        &extras,
                        key_echo,
                        &result.value.to_wire_bytes(),
                    );
                } else {
                    let value = result.value.to_wire_bytes();
                    let mut line = format!(
                        "VALUE {} {} {}",
                        String::from_utf8_lossy(&cmd.key),
                        result.flags,
                        value.len()
                    );
                    if with_cas {
                        line.push(' ');
                        line.push_str(&result.cas.to_string());
                    }
                    line.push_str("\r\n");
                    write_ascii(writer, line.as_bytes());
                    write_ascii(writer, &value);
                    write_ascii(writer, b"\r\n");
                }
            }
            None => {
                // Misses are always silent, both dialects: ASCII get/gets
                // simply omits the key's VALUE frame, and a quiet binary
                // GetQ/GetKQ/GatQ/GatKQ suppresses the miss entirely. A
                // non-quiet binary Get miss still needs its status frame.
                if cmd.binary && !cmd.quiet {
                    write_binary_response(
                        writer,
                        cmd.raw_opcode,
                        StatusCode::KeyNotFound,
                        cmd.opaque,
                        0,
                        &[],
                        &[],
                        &[],
                    );
                }
            }
        }
    }

    fn handle_gat(&self, cmd: &CommandRecord, writer: &mut Writer) {
        let expiration = match cmd.extras {
            Extras::OneValue(e) => e.expiration,
            _ => 0,
        };
        let outcome = self.table.upsert(&cmd.key, UpsertOp::Touch { expiration });
        match outcome {
            Ok(_) => {
                // Touch doesn't return flags; re-read for the full
                // get-and-touch response shape.
                match self.table.get(&cmd.key) {
                    Some(result) => {
                        let mut extras = Vec::with_capacity(4);
                        extras.extend_from_slice(&result.flags.to_be_bytes());
                        let key_echo: &[u8] = if cmd.echo_key { &cmd.key } else { &[] };
                        write_binary_response(
                            writer,
                            cmd.raw_opcode,
                            StatusCode::NoError,
                            cmd.opaque,
                            result.cas,
                            &extras,
                            key_echo,
                            &result.value.to_wire_bytes(),
                        );
                    }
                    None => {
                        if !cmd.quiet {
                            write_binary_response(
                                writer,
                                cmd.raw_opcode,
                                StatusCode::KeyNotFound,
                                cmd.opaque,
                                0,
                                &[],
                                &[],
                                &[],
                            );
                        }
                    }
                }
            }
            Err(err) => {
                if !cmd.quiet {
                    write_binary_response(
                        writer,
                        cmd.raw_opcode,
                        status_for_cache_error(err),
                        cmd.opaque,
                        0,
                        &[],
                        &[],
                        &[],
                    );
                }
            }
        }
    }

    // ── set / add / replace / append / prepend / cas ────────────────────

    fn handle_store(&self, cmd: &CommandRecord, writer: &mut Writer) {
        let value = Value::Bytes(cmd.value.clone().unwrap_or_default());
        let (flags, expiration) = match cmd.extras {
            Extras::Store(s) => (s.flags, s.expiration),
            _ => (0, 0),
        };
        // A nonzero cas on a binary Set behaves as a check-and-set, the
        // same as the ASCII `cas` verb.
        let cas_check = if cmd.verb == Verb::Cas || cmd.cas != 0 { Some(cmd.cas) } else { None };

        let op = match cmd.verb {
            Verb::Set | Verb::Cas => UpsertOp::Set { value, flags, expiration, cas: cas_check },
            Verb::Add => UpsertOp::Add { value, flags, expiration },
            Verb::Replace => UpsertOp::Replace { value, flags, expiration },
            Verb::Append => UpsertOp::Append { delta: cmd.value.clone().unwrap_or_default(), expiration },
            Verb::Prepend => UpsertOp::Prepend { delta: cmd.value.clone().unwrap_or_default(), expiration },
            _ => unreachable!("handle_store only called for storage verbs"),
        };

        match self.table.upsert(&cmd.key, op) {
            Ok(outcome) => {
                if cmd.quiet {
                    return;
                }
                if cmd.binary {
                    write_binary_response(
                        writer,
                        cmd.raw_opcode,
                        StatusCode::NoError,
                        cmd.opaque,
                        outcome.cas,
                        &[],
                        &[],
                        &[],
                    );
                } else {
                    write_ascii(writer, b"STORED\r\n");
                }
            }
            Err(err) => {
                if cmd.quiet {
                    return;
                }
                respond_error(writer, cmd, err);
            }
        }
    }

    // ── delete ───────────────────────────────────────────────────────────

    fn handle_delete(&self, cmd: &CommandRecord, writer: &mut Writer) {
        match self.table.delete(&cmd.key) {
            Ok(()) => {
                if cmd.quiet {
                    return;
                }
                if cmd.binary {
                    write_binary_response(writer, cmd.raw_opcode, StatusCode::NoError, cmd.opaque, 0, &[], &[], &[]);
                } else {
                    write_ascii(writer, b"DELETED\r\n");
                }
            }
            Err(err) => {
                if cmd.quiet {
                    return;
                }
                respond_error(writer, cmd, err);
            }
        }
    }

    // ── incr / decr ──────────────────────────────────────────────────────

    fn handle_incr_decr(&self, cmd: &CommandRecord, writer: &mut Writer) {
        let (addition, initial, expiration) = match cmd.extras {
            Extras::Numeric(n) => (n.addition, n.initial, n.expiration),
            _ => (0, None, 0),
        };
        let signed = i64::try_from(addition).unwrap_or(i64::MAX);
        let signed = if cmd.verb == Verb::Decr { -signed } else { signed };

        match self.table.upsert(&cmd.key, UpsertOp::IncrDecr { addition: signed, initial, expiration }) {
            Ok(outcome) => {
                if cmd.quiet {
                    return;
                }
                let n = match outcome.value {
                    Value::Numeric(n) => n,
                    Value::Bytes(_) => 0,
                };
                if cmd.binary {
                    write_binary_response(
                        writer,
                        cmd.raw_opcode,
                        StatusCode::NoError,
                        cmd.opaque,
                        outcome.cas,
                        &[],
                        &[],
                        &n.to_be_bytes(),
                    );
                } else {
                    let mut line = n.to_string();
                    line.push_str("\r\n");
                    write_ascii(writer, line.as_bytes());
                }
            }
            Err(err) => {
                if cmd.quiet {
                    return;
                }
                respond_error(writer, cmd, err);
            }
        }
    }

    // ── touch ────────────────────────────────────────────────────────────

    fn handle_touch(&self, cmd: &CommandRecord, writer: &mut Writer) {
        let expiration = match cmd.extras {
            Extras::OneValue(e) => e.expiration,
            _ => 0,
        };
        match self.table.upsert(&cmd.key, UpsertOp::Touch { expiration }) {
            Ok(outcome) => {
                if cmd.quiet {
                    return;
                }
                if cmd.binary {
                    write_binary_response(
                        writer,
                        cmd.raw_opcode,
                        StatusCode::NoError,
                        cmd.opaque,
                        outcome.cas,
                        &[],
                        &[],
                        &[],
                    );
                } else {
                    write_ascii(writer, b"TOUCHED\r\n");
                }
            }
            Err(err) => {
                if cmd.quiet {
                    return;
                }
                respond_error(writer, cmd, err);
            }
        }
    }

    // ── flush_all ────────────────────────────────────────────────────────

    fn handle_flush_all(&self, cmd: &CommandRecord, writer: &mut Writer) {
        self.table.flush_all(crate::swiper::now_epoch());
        if cmd.quiet {
            return;
        }
        if cmd.binary {
            write_binary_response(writer, cmd.raw_opcode, StatusCode::NoError, cmd.opaque, 0, &[], &[], &[]);
        } else {
            write_ascii(writer, b"OK\r\n");
        }
    }

    // ── connection-level verbs ───────────────────────────────────────────

    fn handle_noop(&self, cmd: &CommandRecord, writer: &mut Writer) {
        write_binary_response(writer, cmd.raw_opcode, StatusCode::NoError, cmd.opaque, 0, &[], &[], &[]);
    }

    fn handle_version(&self, cmd: &CommandRecord, writer: &mut Writer) {
        let version = env!("CARGO_PKG_VERSION").as_bytes();
        write_binary_response(writer, cmd.raw_opcode, StatusCode::NoError, cmd.opaque, 0, &[], &[], version);
    }

    fn handle_stat(&self, cmd: &CommandRecord, writer: &mut Writer) {
        // A single `curr_items` stat frame, followed by the empty frame
        // that terminates a STAT response (real memcached's convention).
        let value = self.table.objcnt().to_string();
        write_binary_response(
            writer,
            cmd.raw_opcode,
            StatusCode::NoError,
            cmd.opaque,
            0,
            &[],
            b"curr_items",
            value.as_bytes(),
        );
        write_binary_response(writer, cmd.raw_opcode, StatusCode::NoError, cmd.opaque, 0, &[], &[], &[]);
    }

    fn handle_quit(&self, cmd: &CommandRecord, writer: &mut Writer) {
        if cmd.quiet {
            return;
        }
        if cmd.binary {
            write_binary_response(writer, cmd.raw_opcode, StatusCode::NoError, cmd.opaque, 0, &[], &[], &[]);
        }
        // ASCII `quit` has no response at all.
    }
}

/// Maps a cache-layer failure to its ASCII or binary response.
fn respond_error(writer: &mut Writer, cmd: &CommandRecord, err: CacheError) {
    if cmd.binary {
        write_binary_response(writer, cmd.raw_opcode, status_for_cache_error(err), cmd.opaque, 0, &[], &[], &[]);
    } else {
        write_ascii(writer, ascii_text_for_cache_error(err));
    }
}

fn status_for_cache_error(err: CacheError) -> StatusCode {
    match err {
        CacheError::KeyNotFound => StatusCode::KeyNotFound,
        CacheError::KeyExists => StatusCode::KeyExists,
        CacheError::NotStored => StatusCode::NotStored,
        CacheError::NonNumeric => StatusCode::NonNumeric,
        CacheError::Busy => StatusCode::Busy,
    }
}

fn ascii_text_for_cache_error(err: CacheError) -> &'static [u8] {
    match err {
        CacheError::KeyNotFound => b"NOT_FOUND\r\n",
        CacheError::KeyExists => b"EXISTS\r\n",
        CacheError::NotStored => b"NOT_STORED\r\n",
        CacheError::NonNumeric => b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n",
        CacheError::Busy => b"SERVER_ERROR out of memory storing object\r\n",
    }
}

fn write_ascii(writer: &mut Writer, bytes: &[u8]) {
    writer.reserve_and_append(bytes);
}

/// Assembles and writes one 24-byte binary response header plus its
/// extras/key/value body.
#[allow(clippy::too_many_arguments)]
fn write_binary_response(
    writer: &mut Writer,
    opcode: u8,
    status: StatusCode,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) {
    let body_len = extras.len() + key.len() + value.len();
    let mut frame = Vec::with_capacity(24 + body_len);
    frame.push(BINARY_RESPONSE_MAGIC);
    frame.push(opcode);
    frame.extend_from_slice(&(key.len() as u16).to_be_bytes());
    frame.push(extras.len() as u8);
    frame.push(0); // datatype
    frame.extend_from_slice(&(status as u16).to_be_bytes());
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.extend_from_slice(&opaque.to_be_bytes());
    frame.extend_from_slice(&cas.to_be_bytes());
    frame.extend_from_slice(extras);
    frame.extend_from_slice(key);
    frame.extend_from_slice(value);
    writer.reserve_and_append(&frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;
    use std::io::Cursor;

    fn flush_to_string(writer: &mut Writer) -> String {
        let mut sink = Cursor::new(Vec::new());
        writer.flush(&mut sink).expect("flush ok");
        String::from_utf8(sink.into_inner()).expect("ascii response")
    }

    fn processor() -> CommandProcessor {
        CommandProcessor::new(Arc::new(Table::new(64, 24, 48)))
    }

    #[test]
    fn test_ascii_set_then_get_matches_scenario_1() {
        let proc = processor();
        let mut writer = Writer::new(4096);

        let mut set_cmd = CommandRecord::new(Verb::Set, b"k".to_vec());
        set_cmd.value = Some(b"abc".to_vec());
        set_cmd.extras = Extras::Store(crate::types::StoreExtras { flags: 1, expiration: 0 });
        proc.dispatch(set_cmd, &mut writer);

        let get_cmd = CommandRecord::new(Verb::Get, b"k".to_vec());
        proc.dispatch(get_cmd, &mut writer);
        proc.multi_get_end(&mut writer);

        assert_eq!(flush_to_string(&mut writer), "STORED\r\nVALUE k 1 3\r\nabc\r\nEND\r\n");
    }

    #[test]
    fn test_ascii_cas_mismatch_matches_scenario_2() {
        let proc = processor();
        let mut writer = Writer::new(4096);

        let mut set_cmd = CommandRecord::new(Verb::Set, b"k".to_vec());
        set_cmd.value = Some(b"abc".to_vec());
        proc.dispatch(set_cmd, &mut writer);
        let _ = flush_to_string(&mut writer);

        let mut cas_cmd = CommandRecord::new(Verb::Cas, b"k".to_vec());
        cas_cmd.value = Some(b"xyz".to_vec());
        cas_cmd.cas = 999;
        proc.dispatch(cas_cmd, &mut writer);
        assert_eq!(flush_to_string(&mut writer), "EXISTS\r\n");

        let get_cmd = CommandRecord::new(Verb::Get, b"k".to_vec());
        proc.dispatch(get_cmd, &mut writer);
        proc.multi_get_end(&mut writer);
        assert_eq!(flush_to_string(&mut writer), "VALUE k 0 3\r\nabc\r\nEND\r\n");
    }

    #[test]
    fn test_incr_on_missing_key_ascii_sentinel_matches_scenario_3() {
        let proc = processor();
        let mut writer = Writer::new(4096);

        let mut cmd = CommandRecord::new(Verb::Incr, b"absent".to_vec());
        cmd.extras = Extras::Numeric(crate::types::NumericExtras { addition: 5, initial: None, expiration: 0 });
        proc.dispatch(cmd, &mut writer);
        assert_eq!(flush_to_string(&mut writer), "NOT_FOUND\r\n");
    }

    #[test]
    fn test_multi_get_omits_missing_key_matches_scenario_6() {
        let proc = processor();
        let mut writer = Writer::new(4096);

        let mut a = CommandRecord::new(Verb::Set, b"a".to_vec());
        a.value = Some(b"1".to_vec());
        proc.dispatch(a, &mut writer);
        let mut b = CommandRecord::new(Verb::Set, b"b".to_vec());
        b.value = Some(b"2".to_vec());
        proc.dispatch(b, &mut writer);
        let _ = flush_to_string(&mut writer);

        for key in [&b"a"[..], &b"c"[..], &b"b"[..]] {
            proc.dispatch(CommandRecord::new(Verb::Get, key.to_vec()), &mut writer);
        }
        proc.multi_get_end(&mut writer);
        assert_eq!(flush_to_string(&mut writer), "VALUE a 0 1\r\n1\r\nVALUE b 0 1\r\n2\r\nEND\r\n");
    }

    #[test]
    fn test_add_on_existing_key_not_stored() {
        let proc = processor();
        let mut writer = Writer::new(4096);
        let mut set_cmd = CommandRecord::new(Verb::Set, b"k".to_vec());
        set_cmd.value = Some(b"v".to_vec());
        proc.dispatch(set_cmd, &mut writer);
        let _ = flush_to_string(&mut writer);

        let mut add_cmd = CommandRecord::new(Verb::Add, b"k".to_vec());
        add_cmd.value = Some(b"x".to_vec());
        proc.dispatch(add_cmd, &mut writer);
        assert_eq!(flush_to_string(&mut writer), "NOT_STORED\r\n");
    }

    #[test]
    fn test_quiet_storage_success_emits_nothing() {
        let proc = processor();
        let mut writer = Writer::new(4096);
        let mut cmd = CommandRecord::new(Verb::Set, b"k".to_vec());
        cmd.value = Some(b"v".to_vec());
        cmd.quiet = true;
        proc.dispatch(cmd, &mut writer);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_quiet_storage_failure_still_reports() {
        let proc = processor();
        let mut writer = Writer::new(4096);
        let mut replace_cmd = CommandRecord::new(Verb::Replace, b"missing".to_vec());
        replace_cmd.value = Some(b"v".to_vec());
        replace_cmd.quiet = true;
        proc.dispatch(replace_cmd, &mut writer);
        assert_eq!(flush_to_string(&mut writer), "NOT_STORED\r\n");
    }

    #[test]
    fn test_binary_get_hit_echoes_key_for_getk() {
        let proc = processor();
        let mut writer = Writer::new(4096);
        let mut set_cmd = CommandRecord::new(Verb::Set, b"k".to_vec());
        set_cmd.value = Some(b"v".to_vec());
        set_cmd.binary = true;
        proc.dispatch(set_cmd, &mut writer);
        let mut sink = Cursor::new(Vec::new());
        writer.flush(&mut sink).unwrap();

        let mut get_cmd = CommandRecord::new(Verb::Get, b"k".to_vec());
        get_cmd.binary = true;
        get_cmd.echo_key = true;
        get_cmd.raw_opcode = crate::types::Opcode::GetK as u8;
        proc.dispatch(get_cmd, &mut writer);
        let mut sink = Cursor::new(Vec::new());
        writer.flush(&mut sink).unwrap();
        let frame = sink.into_inner();
        assert_eq!(frame[0], BINARY_RESPONSE_MAGIC);
        let key_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        assert_eq!(key_len, 1);
        let extras_len = frame[4] as usize;
        assert_eq!(&frame[24 + extras_len..24 + extras_len + key_len], b"k");
    }

    #[test]
    fn test_binary_get_miss_quiet_emits_nothing() {
        let proc = processor();
        let mut writer = Writer::new(4096);
        let mut cmd = CommandRecord::new(Verb::Get, b"missing".to_vec());
        cmd.binary = true;
        cmd.quiet = true;
        proc.dispatch(cmd, &mut writer);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_quit_closes_connection() {
        let proc = processor();
        let mut writer = Writer::new(4096);
        let close = proc.dispatch(CommandRecord::new(Verb::Quit, Vec::new()), &mut writer);
        assert!(close);
    }
}
