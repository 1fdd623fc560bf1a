//! The per-connection protocol parser: a finite-state machine consuming
//! arbitrary byte chunks and producing fully-parsed [`CommandRecord`]s.
//!
//! Re-expressed from the reference implementation's goto-driven
//! `edamame_read` as an explicit `loop { match state { ... } }` with a
//! `continue` after every state-advancing arm. The 24-byte binary header
//! field layout and big-endian wire encoding follow the `PacketHeader`
//! structure in the reference binary-protocol implementation, reworked
//! into this incremental per-connection state machine (header
//! accumulated across reads, then extras, then key, then value) rather
//! than the reference's single blocking `read_exact` per field.

use byteorder::{BigEndian, ByteOrder};
use std::convert::TryFrom;

use crate::types::{CommandRecord, Extras, NumericExtras, OneValueExtras, Opcode, StoreExtras, Verb};

/// Maximum key length, both dialects.
pub const KEY_MAX_SIZE: usize = 250;
/// Maximum ASCII command line length before `ERROR line too long`.
pub const ASCII_LINE_MAX: usize = 512;
/// Fixed size of the binary protocol's framing header.
pub const BINARY_HEADER_SIZE: usize = 24;

/// One outcome of feeding bytes into the parser.
pub enum ParserEvent {
    /// A fully parsed command, ready for the command processor.
    Command(CommandRecord),
    /// A protocol-level error frame to write back verbatim (ASCII
    /// `ERROR`/`CLIENT_ERROR ...`, or — on the binary path — a
    /// synthetic close, handled by the caller via `Command` with
    /// `Verb::Quit` instead).
    RawError(Vec<u8>),
    /// A `get`/`gets` line has been fully consumed: the command
    /// processor should write the closing `END\r\n` once it has answered
    /// every `Command(Verb::Get | Verb::Gets)` queued since the previous
    /// marker. Kept separate from `RawError` since this is routine
    /// framing, not an error.
    MultiGetEnd,
}

enum State {
    /// Dispatch point: first byte `0x80` selects the binary path,
    /// anything else the ASCII path.
    Clean,
    /// Buffering the first few bytes of an ASCII line to decide whether
    /// it is a streamed `get`/`gets` or an ordinary buffered command —
    /// needed because "get "/"gets " can itself arrive split across
    /// reads, so the decision can't be made from a single `feed` call's
    /// prefix alone.
    SniffPrefix(Vec<u8>),
    /// Accumulating an ASCII command line up to `\n`.
    AsciiLine(Vec<u8>),
    /// Streaming `get`/`gets` keys: whitespace-separated
    /// keys scanned directly out of the network buffer, un-capped by
    /// `ASCII_LINE_MAX` (only individual keys are capped, at
    /// `KEY_MAX_SIZE`).
    AsciiGetStream { with_cas: bool, key_scratch: Vec<u8> },
    /// `ASCII_PENDING_VALUE`: reading exactly `bodylen` bytes then `\r\n`.
    AsciiValue { pending: PendingStorage, have: Vec<u8> },
    /// `BINARY_PENDING_RAWBUF`: accumulating the 24-byte header.
    BinaryHeaderAccum(Vec<u8>),
    /// `BINARY_PENDING_PARSE_EXTRA`.
    BinaryExtra { header: BinaryHeader, have: Vec<u8> },
    /// `BINARY_PENDING_PARSE_KEY`.
    BinaryKey { header: BinaryHeader, extras: Extras, have: Vec<u8> },
    /// `BINARY_PENDING_VALUE`.
    BinaryValue { header: BinaryHeader, extras: Extras, key: Vec<u8>, have: Vec<u8> },
}

enum GetStreamOutcome {
    Done,
    BadKey,
}

/// What a storage-family ASCII verb needs once its value body arrives.
struct PendingStorage {
    verb: Verb,
    key: Vec<u8>,
    flags: u32,
    expiration: u32,
    bodylen: usize,
    cas: u64,
    quiet: bool,
}

#[derive(Clone, Copy)]
struct BinaryHeader {
    opcode: Opcode,
    key_len: usize,
    extras_len: usize,
    body_len: usize,
    opaque: u32,
    cas: u64,
}

pub struct Parser {
    state: State,
    /// Orthogonal to `state`: set on a malformed command, suppresses
    /// normal parsing until the next `\n`, after which the handler
    /// resets.
    skip_until_newline: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser { state: State::Clean, skip_until_newline: false }
    }

    /// Feeds one chunk of network bytes, appending every command or
    /// error frame produced to `out`. Returns when the chunk is fully
    /// consumed; remaining partial state is kept for the next call,
    /// so a command split across reads resumes where it left off.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<ParserEvent>) {
        let mut cursor = chunk;
        while !cursor.is_empty() {
            if self.skip_until_newline {
                match cursor.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        cursor = &cursor[pos + 1..];
                        self.skip_until_newline = false;
                        self.state = State::Clean;
                    }
                    None => return,
                }
                continue;
            }

            match &mut self.state {
                State::Clean => {
                    let first = cursor[0];
                    if first == 0x80 {
                        self.state = State::BinaryHeaderAccum(Vec::with_capacity(BINARY_HEADER_SIZE));
                    } else if first.is_ascii_whitespace() {
                        cursor = &cursor[1..];
                        continue;
                    } else {
                        self.state = State::SniffPrefix(Vec::new());
                    }
                    continue;
                }

                State::SniffPrefix(buf) => {
                    let decided = loop {
                        if cursor.is_empty() {
                            return;
                        }
                        buf.push(cursor[0]);
                        cursor = &cursor[1..];
                        let verdict = classify_get_prefix(buf);
                        if !matches!(verdict, PrefixMatch::Ambiguous) {
                            break verdict;
                        }
                    };
                    match decided {
                        PrefixMatch::Get => {
                            self.state = State::AsciiGetStream { with_cas: false, key_scratch: Vec::new() };
                        }
                        PrefixMatch::Gets => {
                            self.state = State::AsciiGetStream { with_cas: true, key_scratch: Vec::new() };
                        }
                        PrefixMatch::NotMatch => {
                            let State::SniffPrefix(carried) = std::mem::replace(&mut self.state, State::Clean)
                            else {
                                unreachable!()
                            };
                            self.state = State::AsciiLine(carried);
                        }
                        PrefixMatch::Ambiguous => unreachable!("loop only breaks on a decided verdict"),
                    }
                    continue;
                }

                State::AsciiLine(line) => {
                    match cursor.iter().position(|&b| b == b'\n') {
                        None => {
                            if line.len() + cursor.len() > ASCII_LINE_MAX {
                                out.push(ParserEvent::RawError(b"ERROR line too long\r\n".to_vec()));
                                self.skip_until_newline = true;
                                self.state = State::Clean;
                            } else {
                                line.extend_from_slice(cursor);
                            }
                            return;
                        }
                        Some(pos) => {
                            line.extend_from_slice(&cursor[..pos]);
                            cursor = &cursor[pos + 1..];
                            let full_line = std::mem::take(line);
                            self.state = State::Clean;
                            self.handle_ascii_line(full_line, out);
                        }
                    }
                }

                State::AsciiGetStream { with_cas, key_scratch } => {
                    let with_cas = *with_cas;
                    let outcome = loop {
                        if cursor.is_empty() {
                            return;
                        }
                        let b = cursor[0];
                        if b == b'\r' || b == b'\n' {
                            let nl = cursor.iter().position(|&c| c == b'\n');
                            match nl {
                                Some(pos) => cursor = &cursor[pos + 1..],
                                None => return,
                            }
                            if !key_scratch.is_empty() {
                                let key = std::mem::take(key_scratch);
                                let verb = if with_cas { Verb::Gets } else { Verb::Get };
                                out.push(ParserEvent::Command(CommandRecord::new(verb, key)));
                            }
                            out.push(ParserEvent::MultiGetEnd);
                            break GetStreamOutcome::Done;
                        } else if b.is_ascii_whitespace() {
                            if !key_scratch.is_empty() {
                                let key = std::mem::take(key_scratch);
                                let verb = if with_cas { Verb::Gets } else { Verb::Get };
                                out.push(ParserEvent::Command(CommandRecord::new(verb, key)));
                            }
                            cursor = &cursor[1..];
                        } else {
                            key_scratch.push(b);
                            if key_scratch.len() > KEY_MAX_SIZE {
                                out.push(ParserEvent::RawError(
                                    b"CLIENT_ERROR bad command line format\r\n".to_vec(),
                                ));
                                break GetStreamOutcome::BadKey;
                            }
                            cursor = &cursor[1..];
                        }
                    };
                    match outcome {
                        GetStreamOutcome::Done => self.state = State::Clean,
                        GetStreamOutcome::BadKey => {
                            self.skip_until_newline = true;
                            self.state = State::Clean;
                        }
                    }
                    continue;
                }

                State::AsciiValue { pending, have } => {
                    let need = pending.bodylen + 2 - have.len();
                    let take = need.min(cursor.len());
                    have.extend_from_slice(&cursor[..take]);
                    cursor = &cursor[take..];
                    if have.len() < pending.bodylen + 2 {
                        return;
                    }
                    let State::AsciiValue { pending, have } = std::mem::replace(&mut self.state, State::Clean)
                    else {
                        unreachable!()
                    };
                    let bodylen = pending.bodylen;
                    if have.get(bodylen..bodylen + 2) != Some(&b"\r\n"[..]) {
                        out.push(ParserEvent::RawError(b"CLIENT_ERROR bad data chunk\r\n".to_vec()));
                        self.skip_until_newline = true;
                        continue;
                    }
                    let value = have[..bodylen].to_vec();
                    let mut cmd = CommandRecord::new(pending.verb, pending.key);
                    cmd.value = Some(value);
                    cmd.cas = pending.cas;
                    cmd.quiet = pending.quiet;
                    cmd.extras = Extras::Store(StoreExtras { flags: pending.flags, expiration: pending.expiration });
                    out.push(ParserEvent::Command(cmd));
                }

                State::BinaryHeaderAccum(have) => {
                    let need = BINARY_HEADER_SIZE - have.len();
                    let take = need.min(cursor.len());
                    have.extend_from_slice(&cursor[..take]);
                    cursor = &cursor[take..];
                    if have.len() < BINARY_HEADER_SIZE {
                        return;
                    }
                    let raw = std::mem::take(have);
                    match decode_header(&raw) {
                        Some(header) => {
                            if header.extras_len == 0 {
                                self.state = State::BinaryKey {
                                    header,
                                    extras: Extras::None,
                                    have: Vec::with_capacity(header.key_len),
                                };
                            } else {
                                self.state =
                                    State::BinaryExtra { header, have: Vec::with_capacity(header.extras_len) };
                            }
                        }
                        None => {
                            // Unknown opcode: coerce to QUIT.
                            let mut cmd = CommandRecord::new(Verb::Quit, Vec::new());
                            cmd.binary = true;
                            cmd.raw_opcode = raw[1];
                            out.push(ParserEvent::Command(cmd));
                            self.state = State::Clean;
                        }
                    }
                }

                State::BinaryExtra { header, have } => {
                    let need = header.extras_len - have.len();
                    let take = need.min(cursor.len());
                    have.extend_from_slice(&cursor[..take]);
                    cursor = &cursor[take..];
                    if have.len() < header.extras_len {
                        return;
                    }
                    let header = *header;
                    let raw = std::mem::take(have);
                    let extras = decode_extras(header.opcode, &raw);
                    self.state = State::BinaryKey { header, extras, have: Vec::with_capacity(header.key_len) };
                }

                State::BinaryKey { header, extras, have } => {
                    let need = header.key_len - have.len();
                    let take = need.min(cursor.len());
                    have.extend_from_slice(&cursor[..take]);
                    cursor = &cursor[take..];
                    if have.len() < header.key_len {
                        return;
                    }
                    let header = *header;
                    let extras = *extras;
                    let key = std::mem::take(have);
                    let value_len = header.body_len.saturating_sub(header.extras_len + header.key_len);
                    if value_len == 0 {
                        self.state = State::Clean;
                        out.push(ParserEvent::Command(build_binary_command(header, extras, key, Vec::new())));
                    } else {
                        self.state = State::BinaryValue { header, extras, key, have: Vec::with_capacity(value_len) };
                    }
                }

                State::BinaryValue { header, extras, key, have } => {
                    let value_len = header.body_len.saturating_sub(header.extras_len + header.key_len);
                    let need = value_len - have.len();
                    let take = need.min(cursor.len());
                    have.extend_from_slice(&cursor[..take]);
                    cursor = &cursor[take..];
                    if have.len() < value_len {
                        return;
                    }
                    let header = *header;
                    let extras = *extras;
                    let key = std::mem::take(key);
                    let value = std::mem::take(have);
                    self.state = State::Clean;
                    out.push(ParserEvent::Command(build_binary_command(header, extras, key, value)));
                }
            }
        }
    }

    fn handle_ascii_line(&mut self, line: Vec<u8>, out: &mut Vec<ParserEvent>) {
        match parse_ascii_line(&line) {
            Ok(AsciiLineResult::Ready(cmd)) => out.push(ParserEvent::Command(cmd)),
            Ok(AsciiLineResult::AwaitValue(pending)) => {
                self.state = State::AsciiValue { have: Vec::new(), pending };
            }
            Err(msg) => {
                out.push(ParserEvent::RawError(msg));
            }
        }
    }
}

enum PrefixMatch {
    Get,
    Gets,
    NotMatch,
    Ambiguous,
}

/// Classifies an in-progress prefix against `"get "`/`"gets "` without
/// requiring either to have arrived in a single read.
fn classify_get_prefix(buf: &[u8]) -> PrefixMatch {
    const GET: &[u8] = b"get ";
    const GETS: &[u8] = b"gets ";
    if buf == GET {
        return PrefixMatch::Get;
    }
    if buf == GETS {
        return PrefixMatch::Gets;
    }
    if GET.starts_with(buf) || GETS.starts_with(buf) {
        PrefixMatch::Ambiguous
    } else {
        PrefixMatch::NotMatch
    }
}

enum AsciiLineResult {
    Ready(CommandRecord),
    AwaitValue(PendingStorage),
}

/// Parses one complete ASCII command line (without its trailing
/// terminator) against the known verb table.
fn parse_ascii_line(line: &[u8]) -> Result<AsciiLineResult, Vec<u8>> {
    let had_cr = line.last() == Some(&b'\r');
    let line = trim_trailing_cr(line);
    let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());

    let verb_tok = tokens.next().ok_or_else(|| b"ERROR\r\n".to_vec())?;
    let bad_format = || b"CLIENT_ERROR bad command line format\r\n".to_vec();

    macro_rules! next_key {
        () => {{
            let k = tokens.next().ok_or_else(bad_format)?;
            if k.len() > KEY_MAX_SIZE || k.is_empty() {
                return Err(bad_format());
            }
            k.to_vec()
        }};
    }
    macro_rules! next_u32 {
        () => {
            std::str::from_utf8(tokens.next().ok_or_else(bad_format)?)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(bad_format)?
        };
    }
    macro_rules! next_usize {
        () => {
            std::str::from_utf8(tokens.next().ok_or_else(bad_format)?)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(bad_format)?
        };
    }
    macro_rules! next_u64 {
        () => {
            std::str::from_utf8(tokens.next().ok_or_else(bad_format)?)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(bad_format)?
        };
    }

    let is_noreply = |remaining: &[&[u8]]| remaining.last().map(|t| *t == b"noreply").unwrap_or(false);

    match verb_tok {
        b"set" | b"add" | b"replace" | b"append" | b"prepend" | b"cas" => {
            let verb = match verb_tok {
                b"set" => Verb::Set,
                b"add" => Verb::Add,
                b"replace" => Verb::Replace,
                b"append" => Verb::Append,
                b"prepend" => Verb::Prepend,
                _ => Verb::Cas,
            };
            let key = next_key!();
            let flags = next_u32!();
            let expiration = next_u32!();
            let bodylen = next_usize!();
            let cas = if verb == Verb::Cas { next_u64!() } else { 0 };
            let remaining: Vec<&[u8]> = tokens.collect();
            let quiet = is_noreply(&remaining);
            Ok(AsciiLineResult::AwaitValue(PendingStorage {
                verb,
                key,
                flags,
                expiration,
                bodylen,
                cas,
                quiet,
            }))
        }
        b"delete" => {
            // Unlike every other storage/retrieval verb, `delete` does not
            // accept a bare `\n` fallback — it requires the full `\r\n`
            // terminator.
            if !had_cr {
                return Err(bad_format());
            }
            let key = next_key!();
            let remaining: Vec<&[u8]> = tokens.collect();
            let quiet = is_noreply(&remaining);
            let mut cmd = CommandRecord::new(Verb::Delete, key);
            cmd.quiet = quiet;
            Ok(AsciiLineResult::Ready(cmd))
        }
        b"incr" | b"decr" => {
            let verb = if verb_tok == b"incr" { Verb::Incr } else { Verb::Decr };
            let key = next_key!();
            let addition = next_u64!();
            let remaining: Vec<&[u8]> = tokens.collect();
            let quiet = is_noreply(&remaining);
            let mut cmd = CommandRecord::new(verb, key);
            cmd.quiet = quiet;
            // ASCII sentinel: no
            // binary "initial" field exists on this path.
            cmd.extras = Extras::Numeric(NumericExtras { addition, initial: None, expiration: 0 });
            Ok(AsciiLineResult::Ready(cmd))
        }
        b"touch" => {
            let key = next_key!();
            let expiration = next_u32!();
            let remaining: Vec<&[u8]> = tokens.collect();
            let quiet = is_noreply(&remaining);
            let mut cmd = CommandRecord::new(Verb::Touch, key);
            cmd.quiet = quiet;
            cmd.extras = Extras::OneValue(OneValueExtras { expiration });
            Ok(AsciiLineResult::Ready(cmd))
        }
        b"flush_all" => {
            let mut cmd = CommandRecord::new(Verb::FlushAll, Vec::new());
            let remaining: Vec<&[u8]> = tokens.collect();
            cmd.quiet = is_noreply(&remaining);
            Ok(AsciiLineResult::Ready(cmd))
        }
        b"quit" => Ok(AsciiLineResult::Ready(CommandRecord::new(Verb::Quit, Vec::new()))),
        _ => Err(b"ERROR\r\n".to_vec()),
    }
}

fn trim_trailing_cr(line: &[u8]) -> &[u8] {
    if line.last() == Some(&b'\r') {
        &line[..line.len() - 1]
    } else {
        line
    }
}

fn decode_header(raw: &[u8]) -> Option<BinaryHeader> {
    let opcode = Opcode::try_from(raw[1]).ok()?;
    let key_len = BigEndian::read_u16(&raw[2..4]) as usize;
    let extras_len = raw[4] as usize;
    let body_len = BigEndian::read_u32(&raw[8..12]) as usize;
    let opaque = BigEndian::read_u32(&raw[12..16]);
    let cas = BigEndian::read_u64(&raw[16..24]);
    Some(BinaryHeader { opcode, key_len, extras_len, body_len, opaque, cas })
}

fn decode_extras(opcode: Opcode, raw: &[u8]) -> Extras {
    use Opcode::*;
    match opcode {
        Set | SetQ | Add | AddQ | Replace | ReplaceQ if raw.len() >= 8 => {
            Extras::Store(StoreExtras { flags: BigEndian::read_u32(&raw[0..4]), expiration: BigEndian::read_u32(&raw[4..8]) })
        }
        Increment | IncrementQ | Decrement | DecrementQ if raw.len() >= 20 => {
            let addition = BigEndian::read_u64(&raw[0..8]);
            let initial = BigEndian::read_u64(&raw[8..16]);
            let expiration = BigEndian::read_u32(&raw[16..20]);
            Extras::Numeric(NumericExtras { addition, initial: Some(initial), expiration })
        }
        Touch | TouchQ | Gat | GatQ | GatK | GatKQ | Flush | FlushQ if raw.len() >= 4 => {
            Extras::OneValue(OneValueExtras { expiration: BigEndian::read_u32(&raw[0..4]) })
        }
        _ => Extras::None,
    }
}

fn build_binary_command(header: BinaryHeader, extras: Extras, key: Vec<u8>, value: Vec<u8>) -> CommandRecord {
    use Opcode::*;
    let quiet = header.opcode.is_quiet();
    let verb = match header.opcode {
        // The binary protocol always returns cas on a successful GET, so
        // there is no separate "gets" opcode the way ASCII has one.
        Get | GetQ | GetK | GetKQ => Verb::Get,
        Set | SetQ => Verb::Set,
        Add | AddQ => Verb::Add,
        Replace | ReplaceQ => Verb::Replace,
        Delete | DeleteQ => Verb::Delete,
        Increment | IncrementQ => Verb::Incr,
        Decrement | DecrementQ => Verb::Decr,
        Append | AppendQ => Verb::Append,
        Prepend | PrependQ => Verb::Prepend,
        Touch | TouchQ => Verb::Touch,
        Gat | GatQ | GatK | GatKQ => Verb::Gat,
        Flush | FlushQ => Verb::FlushAll,
        Quit | QuitQ => Verb::Quit,
        Noop => Verb::Noop,
        Version => Verb::Version,
        Stat => Verb::Stat,
    };
    let mut cmd = CommandRecord::new(verb, key);
    cmd.quiet = quiet;
    cmd.opaque = header.opaque;
    cmd.cas = header.cas;
    cmd.extras = extras;
    cmd.echo_key = header.opcode.echoes_key();
    cmd.binary = true;
    cmd.raw_opcode = header.opcode as u8;
    if !value.is_empty() || matches!(verb, Verb::Set | Verb::Add | Verb::Replace | Verb::Append | Verb::Prepend) {
        cmd.value = Some(value);
    }
    cmd
}
