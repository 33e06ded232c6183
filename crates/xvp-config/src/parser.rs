//! The line-oriented configuration parser.
//!
//! A single forward pass drives a state machine over the directives:
//! `DATABASE? OTP? MULTIPLEX? (POOL DOMAIN MANAGER HOST+ (GROUP|VM)*)+`.
//! Optional directives may be absent but must appear in this order.
//! `DATABASE` and `GROUP` belong to the web frontend and are skipped.
//! Files nest through `INCLUDE` up to a depth of five.

use std::fmt;
use std::fs;
use std::path::Path;

use xvp_auth::{IpCheck, OtpMode, OtpPolicy, OTP_MAX_WINDOW};

use crate::model::{
    is_ipv4, is_uuid, Config, Host, Pool, Vm, MAX_HOSTNAME, MAX_MANAGER, MAX_POOL_NAME,
    VNC_PORT_MAX, VNC_PORT_MIN,
};

const MAX_INCLUDE_DEPTH: usize = 5;
const MAX_WORDS: usize = 10;

// ── Errors ──────────────────────────────────────────────────────────────

/// A fatal configuration problem, pinned to a file and line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub file: String,
    pub line: usize,
    pub message: String,
}

impl ConfigError {
    fn at(file: &str, line: usize, message: impl Into<String>) -> Self {
        Self {
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "{}: {} at line {}", self.file, self.message, self.line)
        } else {
            write!(f, "{}: {}", self.file, self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

// ── Line reading ────────────────────────────────────────────────────────

struct Line {
    words: Vec<String>,
    file: String,
    line: usize,
}

impl Line {
    fn syntax_error(&self) -> ConfigError {
        ConfigError::at(&self.file, self.line, "Syntax error")
    }
}

struct Source {
    name: String,
    lines: Vec<String>,
    next: usize,
    lineno: usize,
}

impl Source {
    fn from_text(name: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            lines: text.split('\n').map(str::to_string).collect(),
            next: 0,
            lineno: 0,
        }
    }

    fn open(path: &str, at: Option<(&str, usize)>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| match at {
            Some((file, line)) => ConfigError::at(file, line, format!("{}: {}", path, e)),
            None => ConfigError::at(path, 0, e.to_string()),
        })?;
        Ok(Self::from_text(path, &text))
    }
}

struct Reader {
    stack: Vec<Source>,
    root_name: String,
    root_lineno: usize,
}

impl Reader {
    fn new(root: Source) -> Self {
        let root_name = root.name.clone();
        Self {
            stack: vec![root],
            root_name,
            root_lineno: 0,
        }
    }

    /// Next non-empty directive line, following INCLUDEs.
    fn next_line(&mut self) -> Result<Option<Line>, ConfigError> {
        loop {
            let depth = self.stack.len();
            let Some(source) = self.stack.last_mut() else {
                return Ok(None);
            };

            if source.next >= source.lines.len() {
                log::debug!("Closing config file {}", source.name);
                self.stack.pop();
                continue;
            }

            let raw = source.lines[source.next].clone();
            source.next += 1;
            source.lineno += 1;
            let file = source.name.clone();
            let line = source.lineno;
            if depth == 1 {
                self.root_lineno = line;
            }

            let words = split_words(&raw)
                .ok_or_else(|| ConfigError::at(&file, line, "Syntax error"))?;
            if words.is_empty() {
                continue;
            }

            if words.len() == 2 && words[0] == "INCLUDE" {
                if self.stack.len() >= MAX_INCLUDE_DEPTH {
                    return Err(ConfigError::at(
                        &file,
                        line,
                        "Too many levels of INCLUDE",
                    ));
                }
                log::debug!("Including config file {}", words[1]);
                let included = Source::open(&words[1], Some((&file, line)))?;
                self.stack.push(included);
                continue;
            }

            return Ok(Some(Line { words, file, line }));
        }
    }
}

/// Split one raw line into words: `#` starts a comment, whitespace
/// separates, double quotes group (and may produce an empty word).
/// Returns `None` when more than ten words are present.
fn split_words(raw: &str) -> Option<Vec<String>> {
    let cut = raw
        .find(['#', '\r'])
        .map(|at| &raw[..at])
        .unwrap_or(raw);

    let bytes = cut.as_bytes();
    let mut words = Vec::new();
    let mut at = 0;

    loop {
        while at < bytes.len() && (bytes[at] == b' ' || bytes[at] == b'\t') {
            at += 1;
        }
        if at >= bytes.len() {
            return Some(words);
        }
        if words.len() == MAX_WORDS {
            return None;
        }

        let word = if bytes[at] == b'"' {
            at += 1;
            let start = at;
            while at < bytes.len() && bytes[at] != b'"' {
                at += 1;
            }
            let word = &cut[start..at];
            if at < bytes.len() {
                at += 1;
            }
            word
        } else {
            let start = at;
            while at < bytes.len() && bytes[at] != b' ' && bytes[at] != b'\t' {
                at += 1;
            }
            &cut[start..at]
        };
        words.push(word.to_string());
    }
}

/// Leading-integer parse with C `atoi` semantics: ignore anything after
/// the digits, yield 0 when there are none.
fn atoi(text: &str) -> i64 {
    let (sign, rest) = match text.strip_prefix('-') {
        Some(r) => (-1i64, r),
        None => (1, text.strip_prefix('+').unwrap_or(text)),
    };
    let digits: &str = {
        let end = rest
            .as_bytes()
            .iter()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(rest.len());
        &rest[..end]
    };
    digits.parse::<i64>().map(|v| sign * v).unwrap_or(0)
}

/// Parse a port word: `:N` is VNC display N, a bare integer must be an
/// unprivileged port, and for VM entries `-` means multiplex-only.
fn parse_port(word: &str, line: &Line, multiplex_seen: bool, dash_ok: bool) -> Result<u16, ConfigError> {
    if word == "-" {
        if !dash_ok || !multiplex_seen {
            return Err(line.syntax_error());
        }
        return Ok(0);
    }
    let port = if let Some(display) = word.strip_prefix(':') {
        let port = atoi(display) + i64::from(VNC_PORT_MIN);
        if port < i64::from(VNC_PORT_MIN) || port > i64::from(VNC_PORT_MAX) {
            return Err(line.syntax_error());
        }
        port
    } else {
        let port = atoi(word);
        if !(1024..=65535).contains(&port) {
            return Err(line.syntax_error());
        }
        port
    };
    Ok(port as u16)
}

// ── The state machine ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Database,
    Otp,
    Multiplex,
    Pool,
    Domain,
    Manager,
    Host,
    Group,
    Vm,
}

/// Load and parse a configuration file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let name = path.to_string_lossy();
    log::debug!("Reading config file {}", name);
    parse(Source::open(&name, None)?)
}

/// Parse configuration text under a synthetic file name (tests and
/// tooling); INCLUDE directives still open real files.
pub fn parse_str(name: &str, text: &str) -> Result<Config, ConfigError> {
    parse(Source::from_text(name, text))
}

fn parse(root: Source) -> Result<Config, ConfigError> {
    let mut reader = Reader::new(root);
    let mut config = Config {
        otp: OtpPolicy::default(),
        multiplex_port: None,
        pools: Vec::new(),
    };
    let mut state = State::Database;

    while let Some(line) = reader.next_line()? {
        let words = &line.words;
        let w0 = words[0].as_str();

        loop {
            match state {
                State::Database => {
                    // DATABASE dsn [username [password]] is for the web frontend.
                    if w0 != "DATABASE" {
                        state = State::Otp;
                        continue;
                    }
                    if !(2..=4).contains(&words.len()) {
                        return Err(line.syntax_error());
                    }
                    state = State::Otp;
                }

                State::Otp => {
                    // OTP REQUIRE|ALLOW|DENY [IPCHECK ON|OFF|HTTP] [window]
                    if w0 != "OTP" {
                        state = State::Multiplex;
                        continue;
                    }
                    if !(2..=5).contains(&words.len()) {
                        return Err(line.syntax_error());
                    }
                    config.otp.mode = match words[1].as_str() {
                        "DENY" => OtpMode::Deny,
                        "ALLOW" => OtpMode::Allow,
                        "REQUIRE" => OtpMode::Require,
                        _ => return Err(line.syntax_error()),
                    };
                    let next = if words.len() >= 3 && words[2] == "IPCHECK" {
                        if words.len() < 4 {
                            return Err(line.syntax_error());
                        }
                        config.otp.ipcheck = match words[3].as_str() {
                            "OFF" => IpCheck::Off,
                            "ON" => IpCheck::On,
                            "HTTP" => IpCheck::Http,
                            _ => return Err(line.syntax_error()),
                        };
                        4
                    } else {
                        2
                    };
                    if words.len() == next + 1 {
                        let window = atoi(&words[next]);
                        if window < 1 || window > i64::from(OTP_MAX_WINDOW) {
                            return Err(line.syntax_error());
                        }
                        config.otp.window = window as u32;
                    }
                    state = State::Multiplex;
                }

                State::Multiplex => {
                    if w0 != "MULTIPLEX" {
                        state = State::Pool;
                        continue;
                    }
                    if words.len() != 2 {
                        return Err(line.syntax_error());
                    }
                    config.multiplex_port = Some(parse_port(&words[1], &line, false, false)?);
                    state = State::Pool;
                }

                State::Pool => {
                    if w0 != "POOL" || words.len() < 2 {
                        return Err(line.syntax_error());
                    }
                    // Pool names may contain spaces but not ':'.
                    let name = words[1..].join(" ");
                    if name.len() > MAX_POOL_NAME || name.contains(':') {
                        return Err(line.syntax_error());
                    }
                    if config.pool_by_name(&name).is_some() {
                        return Err(ConfigError::at(&line.file, line.line, "Duplicate pool name"));
                    }
                    config.pools.push(Pool {
                        name,
                        domain: String::new(),
                        manager: String::new(),
                        password: [0u8; 16],
                        hosts: Vec::new(),
                        vms: Vec::new(),
                    });
                    state = State::Domain;
                }

                State::Domain => {
                    if w0 != "DOMAIN" || words.len() != 2 || words[1].len() > MAX_HOSTNAME {
                        return Err(line.syntax_error());
                    }
                    if !words[1].is_empty() {
                        // Stored with a leading dot for ease of joining.
                        let pool = config.pools.last_mut().expect("pool in progress");
                        pool.domain = format!(".{}", words[1]);
                    }
                    state = State::Manager;
                }

                State::Manager => {
                    if w0 != "MANAGER" || words.len() != 3 || words[1].len() > MAX_MANAGER {
                        return Err(line.syntax_error());
                    }
                    let password = xvp_auth::manager_password_from_hex(&words[2])
                        .map_err(|_| line.syntax_error())?;
                    let pool = config.pools.last_mut().expect("pool in progress");
                    pool.manager = words[1].clone();
                    pool.password = password;
                    state = State::Host;
                }

                State::Host => {
                    if w0 != "HOST" {
                        let pool = config.pools.last().expect("pool in progress");
                        if !pool.hosts.is_empty() {
                            state = State::Group;
                            continue;
                        }
                        return Err(line.syntax_error());
                    }
                    let (address, hostname) = match words.len() {
                        2 => (String::new(), words[1].clone()),
                        3 => {
                            if !is_ipv4(&words[1]) {
                                return Err(line.syntax_error());
                            }
                            (words[1].clone(), words[2].clone())
                        }
                        _ => return Err(line.syntax_error()),
                    };
                    if hostname.len() > MAX_HOSTNAME {
                        return Err(line.syntax_error());
                    }
                    let pool_idx = config.pools.len() - 1;
                    if config.host_by_name(pool_idx, &hostname).is_some() {
                        return Err(ConfigError::at(&line.file, line.line, "Duplicate host name"));
                    }
                    let hostname_is_ipv4 = is_ipv4(&hostname);
                    config.pools[pool_idx].hosts.push(Host {
                        hostname,
                        address,
                        hostname_is_ipv4,
                    });
                }

                State::Group => {
                    // GROUP groupname is for the web frontend.
                    if w0 != "GROUP" {
                        state = State::Vm;
                        continue;
                    }
                    if words.len() < 2 {
                        return Err(line.syntax_error());
                    }
                    state = State::Vm;
                }

                State::Vm => {
                    if w0 == "GROUP" {
                        state = State::Group;
                        continue;
                    }
                    if w0 != "VM" {
                        let pool = config.pools.last().expect("pool in progress");
                        if !pool.vms.is_empty() {
                            state = State::Pool;
                            continue;
                        }
                        return Err(line.syntax_error());
                    }
                    if words.len() != 4 || words[2].len() > MAX_HOSTNAME {
                        return Err(line.syntax_error());
                    }
                    let password = xvp_auth::vnc_password_from_hex(&words[3])
                        .map_err(|_| line.syntax_error())?;
                    let port =
                        parse_port(&words[1], &line, config.multiplex_port.is_some(), true)?;

                    let pool_idx = config.pools.len() - 1;
                    let (name, uuid) = if is_uuid(&words[2]) {
                        (format!("uuid={}", words[2]), Some(words[2].clone()))
                    } else {
                        (words[2].clone(), None)
                    };
                    if config.vm_by_name(Some(pool_idx), &name).is_some() {
                        return Err(ConfigError::at(&line.file, line.line, "Duplicate vm name"));
                    }
                    if port > 0 && config.target_by_port(port).is_some() {
                        return Err(ConfigError::at(
                            &line.file,
                            line.line,
                            "Duplicate port number",
                        ));
                    }
                    config.pools[pool_idx].vms.push(Vm {
                        port,
                        name,
                        uuid,
                        password,
                    });
                }
            }
            break;
        }
    }

    let complete = config
        .pools
        .last()
        .map(|p| !p.vms.is_empty())
        .unwrap_or(false);
    if !complete {
        return Err(ConfigError::at(
            &reader.root_name,
            reader.root_lineno,
            "Unexpected end of file",
        ));
    }

    Ok(config)
}
