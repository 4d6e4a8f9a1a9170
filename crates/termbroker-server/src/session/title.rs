//! Terminal title handling: OSC title filtering, session naming and the
//! quiet-period injection state machine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::escape::MAX_WITHHELD_ESCAPE;
use super::info::SpecificStatus;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// How the broker treats terminal titles for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleMode {
    /// Pass the program's own title sequences through.
    #[default]
    None,
    /// Strip OSC 0/1/2 from the output.
    Filter,
    /// Strip, then inject one title at start.
    Static,
    /// Strip, then keep the title in sync with the foreground command.
    Dynamic,
}

impl TitleMode {
    pub fn filters(self) -> bool {
        self != TitleMode::None
    }

    pub fn injects(self) -> bool {
        matches!(self, TitleMode::Static | TitleMode::Dynamic)
    }
}

impl std::str::FromStr for TitleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(TitleMode::None),
            "filter" => Ok(TitleMode::Filter),
            "static" => Ok(TitleMode::Static),
            "dynamic" => Ok(TitleMode::Dynamic),
            other => Err(format!("unknown title mode {other:?}")),
        }
    }
}

enum Scan {
    Title(usize),
    Partial,
    Other,
}

/// Classify the bytes at `start` (an ESC) as a complete OSC 0/1/2 sequence,
/// a possible prefix of one, or something else.
fn scan_title(buf: &[u8], start: usize) -> Scan {
    let header = [ESC, b']'];
    for (k, expected) in header.iter().enumerate() {
        match buf.get(start + k) {
            None => return Scan::Partial,
            Some(b) if b != expected => return Scan::Other,
            Some(_) => {}
        }
    }
    match buf.get(start + 2) {
        None => return Scan::Partial,
        Some(b'0'..=b'2') => {}
        Some(_) => return Scan::Other,
    }
    match buf.get(start + 3) {
        None => return Scan::Partial,
        Some(b';') => {}
        Some(_) => return Scan::Other,
    }
    let mut pos = start + 4;
    while pos < buf.len() {
        match buf[pos] {
            BEL => return Scan::Title(pos + 1),
            ESC => {
                return match buf.get(pos + 1) {
                    None => Scan::Partial,
                    Some(b'\\') => Scan::Title(pos + 2),
                    Some(_) => Scan::Other,
                };
            }
            _ => pos += 1,
        }
    }
    Scan::Partial
}

/// Removes OSC 0/1/2 title sequences from a byte stream, including ones
/// split across chunks.
#[derive(Debug, Default)]
pub struct TitleFilter {
    pending: Vec<u8>,
}

impl TitleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&mut self, data: &[u8]) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(data);

        let mut out = Vec::with_capacity(buf.len());
        let mut pos = 0;
        while pos < buf.len() {
            if buf[pos] != ESC {
                out.push(buf[pos]);
                pos += 1;
                continue;
            }
            match scan_title(&buf, pos) {
                Scan::Title(end) => pos = end,
                Scan::Partial if buf.len() - pos <= MAX_WITHHELD_ESCAPE => {
                    self.pending = buf.split_off(pos);
                    break;
                }
                Scan::Partial | Scan::Other => {
                    out.push(ESC);
                    pos += 1;
                }
            }
        }
        out
    }

    /// Release anything withheld.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

/// Shorten a directory for display: `~` for home, a few well-known
/// abbreviations, and only the last two components for deep paths.
pub fn abbreviate_path(path: &str, home: Option<&Path>) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut abbreviated = path.to_string();
    if let Some(home) = home.and_then(|h| h.to_str()).filter(|h| !h.is_empty()) {
        if let Some(rest) = path.strip_prefix(home) {
            abbreviated = format!("~{rest}");
        }
    }
    for (long, short) in [
        ("/Development/", "/Dev/"),
        ("/Documents/", "/Docs/"),
        ("/Applications/", "/Apps/"),
    ] {
        abbreviated = abbreviated.replacen(long, short, 1);
    }

    let parts: Vec<&str> = abbreviated.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() > 3 {
        return format!("…/{}", parts[parts.len() - 2..].join("/"));
    }
    abbreviated
}

fn command_basename(program: &str) -> &str {
    program.rsplit('/').find(|s| !s.is_empty()).unwrap_or(program)
}

/// Default session name: `"<cmd> (<abbreviated cwd>)"`.
pub fn generate_session_name(command: &[String], working_dir: &str) -> String {
    let name = command
        .first()
        .map(|c| command_basename(c))
        .unwrap_or("session");
    let home = dirs::home_dir();
    let cwd = abbreviate_path(working_dir, home.as_deref());
    if cwd.is_empty() {
        name.to_string()
    } else {
        format!("{name} ({cwd})")
    }
}

/// OSC 2 sequence setting the window title. Control characters are dropped.
pub fn title_sequence(title: &str) -> String {
    let clean: String = title.chars().filter(|c| !c.is_control()).collect();
    format!("\x1b]2;{clean}\x07")
}

/// Everything a composed title can mention.
#[derive(Debug, Clone, Default)]
pub struct TitleContext<'a> {
    pub working_dir: &'a str,
    pub command: &'a [String],
    pub session_name: &'a str,
    /// Command line of the current foreground job, if not the shell.
    pub foreground: Option<&'a str>,
    pub activity: Option<&'a SpecificStatus>,
}

/// The title text for `mode`, or `None` when the mode injects nothing.
pub fn compose_title(mode: TitleMode, ctx: &TitleContext<'_>) -> Option<String> {
    if !mode.injects() {
        return None;
    }
    let home = dirs::home_dir();
    let cwd = abbreviate_path(ctx.working_dir, home.as_deref());

    let command = match (mode, ctx.foreground) {
        (TitleMode::Dynamic, Some(fg)) => fg
            .split_whitespace()
            .next()
            .map(command_basename)
            .unwrap_or_default()
            .to_string(),
        _ => ctx
            .command
            .first()
            .map(|c| command_basename(c).to_string())
            .unwrap_or_default(),
    };

    let mut parts: Vec<String> = Vec::with_capacity(4);
    if mode == TitleMode::Dynamic {
        if let Some(activity) = ctx.activity {
            parts.push(format!("{}: {}", activity.app, activity.status));
        }
    }
    for part in [cwd, command] {
        if !part.is_empty() {
            parts.push(part);
        }
    }
    // The generated default name only repeats the command and cwd.
    if !ctx.session_name.is_empty()
        && ctx.session_name != generate_session_name(ctx.command, ctx.working_dir)
    {
        parts.push(ctx.session_name.to_string());
    }
    Some(parts.join(" · "))
}

/// What the output task should do on a title tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    Idle,
    /// Write this sequence into the output stream now.
    Inject(String),
    /// Output never went quiet; wait for the next trigger.
    Deferred,
}

/// Title injection bookkeeping. A title is only injected after the output has
/// been quiet for `quiet`; a pending title that never sees a quiet period
/// within `timeout` is parked until [`TitleInjector::request`] is called again.
#[derive(Debug)]
pub struct TitleInjector {
    quiet: Duration,
    timeout: Duration,
    current: Option<String>,
    pending: Option<String>,
    armed_at: Option<Instant>,
    last_output: Option<Instant>,
}

impl TitleInjector {
    pub fn new(quiet: Duration, timeout: Duration) -> Self {
        Self {
            quiet,
            timeout,
            current: None,
            pending: None,
            armed_at: None,
            last_output: None,
        }
    }

    /// Ask for `title` to be shown. Re-arms a deferred injection.
    pub fn request(&mut self, title: String, now: Instant) {
        if self.pending.is_none() && self.current.as_deref() == Some(title.as_str()) {
            return;
        }
        self.pending = Some(title);
        self.armed_at = Some(now);
    }

    pub fn note_output(&mut self, now: Instant) {
        self.last_output = Some(now);
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn poll(&mut self, now: Instant) -> Injection {
        let Some(armed_at) = self.armed_at else {
            return Injection::Idle;
        };
        let quiet = self
            .last_output
            .map_or(true, |t| now.saturating_duration_since(t) >= self.quiet);
        if quiet {
            if let Some(title) = self.pending.take() {
                self.armed_at = None;
                let seq = title_sequence(&title);
                self.current = Some(title);
                return Injection::Inject(seq);
            }
        }
        if now.saturating_duration_since(armed_at) >= self.timeout {
            self.armed_at = None;
            return Injection::Deferred;
        }
        Injection::Idle
    }
}
