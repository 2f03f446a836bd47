//! Terminal output side-channel.
//!
//! Programs running in a terminal can embed instructions in their output as
//! `ESC ] 1337 ; boardlink ; <payload> BEL`.  [`SideChannelParser::feed`]
//! strips those markers from the display stream and extracts the payloads,
//! holding back any marker that is split across chunks until it completes.
//! Local dev-server URLs printed in plain output are picked up as implicit
//! instructions too.  Display text is never delayed for URL detection; only
//! the detector keeps a short tail so a URL split across chunks is reported
//! whole, once its end has been seen.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

pub const MARKER_START: &str = "\x1b]1337;boardlink;";
pub const MARKER_END: &str = "\x07";

/// A pending marker longer than this is given up on and shown as-is.
const CARRY_LIMIT: usize = 64 * 1024;

/// Schemes and hosts an implicit local URL can start with.
const URL_HEADS: &[&str] = &[
    "http://localhost:",
    "https://localhost:",
    "http://127.0.0.1:",
    "https://127.0.0.1:",
    "http://0.0.0.0:",
    "https://0.0.0.0:",
];

const MAX_PORT_DIGITS: usize = 5;

static LOCAL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):\d{2,5}(?:/[^\s\x1b\x07]*)?")
        .expect("hardcoded regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    OpenUrl(String),
    Raw(String),
}

impl Instruction {
    fn classify(payload: &str) -> Self {
        let trimmed = payload.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Instruction::OpenUrl(trimmed.to_string())
        } else {
            Instruction::Raw(payload.to_string())
        }
    }

    fn dedup_key(&self) -> &str {
        match self {
            Instruction::OpenUrl(s) | Instruction::Raw(s) => s,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub display: String,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Default)]
pub struct SideChannelParser {
    carry: String,
    /// Already-displayed text that may be the start of a local URL.
    url_tail: String,
    seen: HashSet<String>,
}

impl SideChannelParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// New terminal session: payloads may fire again.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.url_tail.clear();
        self.seen.clear();
    }

    #[cfg(test)]
    fn has_carry(&self) -> bool {
        !self.carry.is_empty() || !self.url_tail.is_empty()
    }

    pub fn feed(&mut self, chunk: &str) -> Parsed {
        let mut buf = std::mem::take(&mut self.carry);
        buf.push_str(chunk);

        let mut out = Parsed::default();
        let mut rest = buf.as_str();
        loop {
            let Some(start) = rest.find(MARKER_START) else {
                // A trailing partial start token may complete in the next chunk.
                let keep = partial_prefix_len(rest, MARKER_START);
                let (shown, held) = rest.split_at(rest.len() - keep);
                out.display.push_str(shown);
                self.carry = held.to_string();
                break;
            };
            out.display.push_str(&rest[..start]);
            let body = &rest[start + MARKER_START.len()..];
            match body.find(MARKER_END) {
                Some(end) => {
                    self.extract(&body[..end], &mut out.instructions);
                    rest = &body[end + MARKER_END.len()..];
                }
                None => {
                    let pending = &rest[start..];
                    if pending.len() > CARRY_LIMIT {
                        warn!(len = pending.len(), "unterminated side-channel marker flushed to display");
                        out.display.push_str(pending);
                    } else {
                        self.carry = pending.to_string();
                    }
                    break;
                }
            }
        }

        self.scan_implicit(&out.display, &mut out.instructions);
        out
    }

    /// Release anything held back: an unterminated marker becomes display
    /// text and a URL still waiting for its end is reported as it stands.
    pub fn flush(&mut self) -> Parsed {
        let mut out = Parsed {
            display: std::mem::take(&mut self.carry),
            instructions: Vec::new(),
        };
        let tail = std::mem::take(&mut self.url_tail);
        for m in LOCAL_URL.find_iter(&tail) {
            self.admit(Instruction::OpenUrl(m.as_str().to_string()), &mut out.instructions);
        }
        out
    }

    fn extract(&mut self, payload: &str, into: &mut Vec<Instruction>) {
        if payload.is_empty() {
            return;
        }
        self.admit(Instruction::classify(payload), into);
    }

    fn scan_implicit(&mut self, display: &str, into: &mut Vec<Instruction>) {
        let mut text = std::mem::take(&mut self.url_tail);
        text.push_str(display);
        for m in LOCAL_URL.find_iter(&text) {
            // A match touching the end may still grow (more port digits or path).
            if m.end() == text.len() && m.len() <= CARRY_LIMIT {
                self.url_tail = text[m.start()..].to_string();
                return;
            }
            self.admit(Instruction::OpenUrl(m.as_str().to_string()), into);
        }
        let keep = url_head_len(&text);
        self.url_tail = text[text.len() - keep..].to_string();
    }

    fn admit(&mut self, instruction: Instruction, into: &mut Vec<Instruction>) {
        if !self.seen.insert(instruction.dedup_key().to_string()) {
            debug!(payload = instruction.dedup_key(), "side-channel payload already handled");
            return;
        }
        into.push(instruction);
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `token`.
fn partial_prefix_len(text: &str, token: &str) -> usize {
    let max = (token.len() - 1).min(text.len());
    (1..=max)
        .rev()
        .find(|&n| text.is_char_boundary(text.len() - n) && token.starts_with(&text[text.len() - n..]))
        .unwrap_or(0)
}

/// Length of the longest suffix of `text` that could still grow into a
/// local URL: a prefix of a URL head, or a head followed by too few port
/// digits to match yet.
fn url_head_len(text: &str) -> usize {
    let longest = URL_HEADS.iter().map(|h| h.len()).max().unwrap_or(0) + MAX_PORT_DIGITS;
    let from = text.len().saturating_sub(longest);
    (from..text.len())
        .filter(|&i| text.is_char_boundary(i))
        .find(|&i| could_start_url(&text[i..]))
        .map_or(0, |i| text.len() - i)
}

fn could_start_url(suffix: &str) -> bool {
    URL_HEADS.iter().any(|head| {
        head.starts_with(suffix)
            || suffix.strip_prefix(head).is_some_and(|port| {
                port.len() < MAX_PORT_DIGITS && port.bytes().all(|b| b.is_ascii_digit())
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &str) -> String {
        format!("abc{MARKER_START}{payload}{MARKER_END}def")
    }

    #[test]
    fn strips_marker_and_extracts_payload() {
        let mut parser = SideChannelParser::new();
        let out = parser.feed(&framed("payload"));
        assert_eq!(out.display, "abcdef");
        assert_eq!(out.instructions, vec![Instruction::Raw("payload".into())]);
        assert!(!parser.has_carry());
    }

    #[test]
    fn split_at_every_offset_gives_same_result() {
        let input = framed("payload");
        for offset in 0..=input.len() {
            let mut parser = SideChannelParser::new();
            let first = parser.feed(&input[..offset]);
            let second = parser.feed(&input[offset..]);
            let display = format!("{}{}", first.display, second.display);
            let mut instructions = first.instructions;
            instructions.extend(second.instructions);
            assert_eq!(display, "abcdef", "split at {offset}");
            assert_eq!(instructions, vec![Instruction::Raw("payload".into())], "split at {offset}");
        }
    }

    #[test]
    fn no_marker_passes_through() {
        let mut parser = SideChannelParser::new();
        let out = parser.feed("plain \x1b[32mgreen\x1b[0m text");
        assert_eq!(out.display, "plain \x1b[32mgreen\x1b[0m text");
        assert!(out.instructions.is_empty());
    }

    #[test]
    fn payloads_fire_once_per_session() {
        let mut parser = SideChannelParser::new();
        assert_eq!(parser.feed(&framed("x")).instructions.len(), 1);
        assert!(parser.feed(&framed("x")).instructions.is_empty());
        parser.reset();
        assert_eq!(parser.feed(&framed("x")).instructions.len(), 1);
    }

    #[test]
    fn multiple_markers_in_one_chunk() {
        let mut parser = SideChannelParser::new();
        let input = format!("1{MARKER_START}a{MARKER_END}2{MARKER_START}b{MARKER_END}3");
        let out = parser.feed(&input);
        assert_eq!(out.display, "123");
        assert_eq!(
            out.instructions,
            vec![Instruction::Raw("a".into()), Instruction::Raw("b".into())]
        );
    }

    #[test]
    fn url_payload_is_classified() {
        let mut parser = SideChannelParser::new();
        let out = parser.feed(&framed(" https://example.com/x "));
        assert_eq!(out.instructions, vec![Instruction::OpenUrl("https://example.com/x".into())]);
    }

    #[test]
    fn implicit_local_url_detected_once() {
        let mut parser = SideChannelParser::new();
        let out = parser.feed("  ➜  Local:   http://localhost:5173/\r\n");
        assert_eq!(out.instructions, vec![Instruction::OpenUrl("http://localhost:5173/".into())]);
        assert!(parser.feed("http://localhost:5173/\r\n").instructions.is_empty());
        assert!(parser.feed("see http://example.com:8080").instructions.is_empty());
    }

    fn feed_in_two(input: &str, offset: usize) -> Vec<Instruction> {
        let mut parser = SideChannelParser::new();
        let mut instructions = parser.feed(&input[..offset]).instructions;
        instructions.extend(parser.feed(&input[offset..]).instructions);
        instructions
    }

    #[test]
    fn implicit_url_split_across_chunks_is_reported_whole() {
        let mut parser = SideChannelParser::new();
        let first = parser.feed("  Local:   http://localhost:51");
        assert_eq!(first.display, "  Local:   http://localhost:51");
        assert!(first.instructions.is_empty());
        let second = parser.feed("73/\r\n");
        assert_eq!(second.display, "73/\r\n");
        assert_eq!(second.instructions, vec![Instruction::OpenUrl("http://localhost:5173/".into())]);
    }

    #[test]
    fn implicit_url_split_at_every_offset() {
        let input = "  Local:   http://localhost:5173/\r\n  Network: http://127.0.0.1:8080/app\r\n";
        for offset in 0..=input.len() {
            assert_eq!(
                feed_in_two(input, offset),
                vec![
                    Instruction::OpenUrl("http://localhost:5173/".into()),
                    Instruction::OpenUrl("http://127.0.0.1:8080/app".into()),
                ],
                "split at {offset}"
            );
        }
    }

    #[test]
    fn url_at_end_of_stream_is_released_by_flush() {
        let mut parser = SideChannelParser::new();
        assert!(parser.feed("ready on http://0.0.0.0:3000").instructions.is_empty());
        assert!(parser.has_carry());
        let out = parser.flush();
        assert!(out.display.is_empty());
        assert_eq!(out.instructions, vec![Instruction::OpenUrl("http://0.0.0.0:3000".into())]);
        assert!(!parser.has_carry());
    }

    #[test]
    fn flush_returns_unterminated_marker_as_display() {
        let mut parser = SideChannelParser::new();
        let out = parser.feed(&format!("ok{MARKER_START}half"));
        assert_eq!(out.display, "ok");
        let out = parser.flush();
        assert_eq!(out.display, format!("{MARKER_START}half"));
        assert!(out.instructions.is_empty());
    }

    #[test]
    fn url_heads() {
        assert_eq!(url_head_len("see http://local"), "http://local".len());
        assert_eq!(url_head_len("port https://127.0.0.1:8"), "https://127.0.0.1:8".len());
        assert_eq!(url_head_len("plain text"), 0);
        assert_eq!(url_head_len("h"), 1);
        assert_eq!(url_head_len("日本"), 0);
    }

    #[test]
    fn runaway_marker_is_flushed() {
        let mut parser = SideChannelParser::new();
        let out = parser.feed(MARKER_START);
        assert!(out.display.is_empty());
        let filler = "x".repeat(CARRY_LIMIT + 1);
        let out = parser.feed(&filler);
        assert!(out.display.starts_with(MARKER_START));
        assert!(!parser.has_carry());
    }

    #[test]
    fn partial_prefix_detection() {
        assert_eq!(partial_prefix_len("abc\x1b]13", MARKER_START), 4);
        assert_eq!(partial_prefix_len("abc", MARKER_START), 0);
        assert_eq!(partial_prefix_len("", MARKER_START), 0);
    }
}
