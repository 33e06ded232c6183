//! Minimal XenAPI client and the console backend built on it.
//!
//! Only the handful of XML-RPC calls the proxy needs: session login
//! (following a HOST_IS_SLAVE redirect to the pool master), VM and
//! console lookup, the console-deleted event watch, and the three VM
//! lifecycle commands.  This is deliberately not a general SDK.
//!
//! A session is established against one of the pool's hosts, tried in
//! configuration order.  The console location the API hands back is then
//! tunneled via [`crate::tunnel`].

use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::sync::Mutex;

use xvp_config::{Config, Host, Pool, VmId};
use xvp_rfb::XvpCode;

use crate::tunnel::{open_console_tunnel, CONNECT_TIMEOUT};
use crate::types::{BackendError, BackendFactory, ConsoleBackend, TunnelStream};

const API_VERSION: &str = "1.5";

// ── XML-RPC values ──────────────────────────────────────────────────────

/// The subset of XML-RPC values XenAPI traffics in.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Array(Vec<XmlValue>),
    Struct(Vec<(String, XmlValue)>),
}

impl XmlValue {
    pub fn str(text: impl Into<String>) -> Self {
        Self::Str(text.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[XmlValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&XmlValue> {
        match self {
            Self::Struct(members) => members
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn write_value(out: &mut String, value: &XmlValue) {
    out.push_str("<value>");
    match value {
        XmlValue::Str(s) => {
            out.push_str("<string>");
            out.push_str(&escape_xml(s));
            out.push_str("</string>");
        }
        XmlValue::Bool(b) => {
            out.push_str("<boolean>");
            out.push_str(if *b { "1" } else { "0" });
            out.push_str("</boolean>");
        }
        XmlValue::Int(i) => {
            out.push_str("<int>");
            out.push_str(&i.to_string());
            out.push_str("</int>");
        }
        XmlValue::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array>");
        }
        XmlValue::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                out.push_str(&escape_xml(name));
                out.push_str("</name>");
                write_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

/// Serialize one XML-RPC method call.
pub fn build_request(method: &str, params: &[XmlValue]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape_xml(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        write_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

// ── XML-RPC response parsing ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Open(String),
    Close(String),
    Text(String),
}

fn tokenize(xml: &str) -> Result<Vec<Tok>, BackendError> {
    let mut reader = Reader::from_str(xml);
    let mut toks = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                toks.push(Tok::Open(String::from_utf8_lossy(e.name().as_ref()).into_owned()));
            }
            Ok(Event::End(e)) => {
                toks.push(Tok::Close(String::from_utf8_lossy(e.name().as_ref()).into_owned()));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                toks.push(Tok::Open(name.clone()));
                toks.push(Tok::Close(name));
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| BackendError::api(format!("Bad XML in response: {}", e)))?
                    .into_owned();
                if !text.trim().is_empty() {
                    toks.push(Tok::Text(text));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(BackendError::api(format!("Bad XML in response: {}", e))),
        }
    }
    Ok(toks)
}

struct Cursor<'a> {
    toks: &'a [Tok],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Tok> {
        self.toks.get(self.at)
    }

    fn next(&mut self) -> Option<&'a Tok> {
        let tok = self.toks.get(self.at);
        self.at += 1;
        tok
    }

    fn expect_open(&mut self, name: &str) -> Result<(), BackendError> {
        match self.next() {
            Some(Tok::Open(n)) if n == name => Ok(()),
            other => Err(malformed(&format!("expected <{}>, found {:?}", name, other))),
        }
    }

    fn expect_close(&mut self, name: &str) -> Result<(), BackendError> {
        match self.next() {
            Some(Tok::Close(n)) if n == name => Ok(()),
            other => Err(malformed(&format!("expected </{}>, found {:?}", name, other))),
        }
    }

    fn take_text(&mut self) -> String {
        match self.peek() {
            Some(Tok::Text(t)) => {
                self.at += 1;
                t.clone()
            }
            _ => String::new(),
        }
    }
}

fn malformed(detail: &str) -> BackendError {
    BackendError::api(format!("Malformed XML-RPC response: {}", detail))
}

fn parse_value(cur: &mut Cursor<'_>) -> Result<XmlValue, BackendError> {
    cur.expect_open("value")?;

    let value = match cur.peek() {
        // Untyped scalar: bare text inside <value>.
        Some(Tok::Text(_)) => XmlValue::Str(cur.take_text()),
        Some(Tok::Close(n)) if n == "value" => XmlValue::Str(String::new()),
        Some(Tok::Open(tag)) => match tag.as_str() {
            "string" | "dateTime.iso8601" | "double" => {
                let tag = tag.clone();
                cur.expect_open(&tag)?;
                let text = cur.take_text();
                cur.expect_close(&tag)?;
                XmlValue::Str(text)
            }
            "boolean" => {
                cur.expect_open("boolean")?;
                let text = cur.take_text();
                cur.expect_close("boolean")?;
                XmlValue::Bool(matches!(text.trim(), "1" | "true"))
            }
            "int" | "i4" => {
                let tag = tag.clone();
                cur.expect_open(&tag)?;
                let text = cur.take_text();
                cur.expect_close(&tag)?;
                XmlValue::Int(text.trim().parse().unwrap_or(0))
            }
            "array" => {
                cur.expect_open("array")?;
                cur.expect_open("data")?;
                let mut items = Vec::new();
                while !matches!(cur.peek(), Some(Tok::Close(n)) if n == "data") {
                    items.push(parse_value(cur)?);
                }
                cur.expect_close("data")?;
                cur.expect_close("array")?;
                XmlValue::Array(items)
            }
            "struct" => {
                cur.expect_open("struct")?;
                let mut members = Vec::new();
                while matches!(cur.peek(), Some(Tok::Open(n)) if n == "member") {
                    cur.expect_open("member")?;
                    cur.expect_open("name")?;
                    let name = cur.take_text();
                    cur.expect_close("name")?;
                    let value = parse_value(cur)?;
                    cur.expect_close("member")?;
                    members.push((name, value));
                }
                cur.expect_close("struct")?;
                XmlValue::Struct(members)
            }
            other => return Err(malformed(&format!("unexpected <{}>", other))),
        },
        other => return Err(malformed(&format!("unexpected token {:?}", other))),
    };

    cur.expect_close("value")?;
    Ok(value)
}

/// Parse a complete methodResponse down to its single parameter value.
pub fn parse_response(xml: &str) -> Result<XmlValue, BackendError> {
    let toks = tokenize(xml)?;
    let mut cur = Cursor { toks: &toks, at: 0 };
    cur.expect_open("methodResponse")?;
    match cur.peek() {
        Some(Tok::Open(n)) if n == "fault" => {
            Err(BackendError::api("Xen API error: XML-RPC fault"))
        }
        _ => {
            cur.expect_open("params")?;
            cur.expect_open("param")?;
            parse_value(&mut cur)
        }
    }
}

/// A XenAPI call either succeeds with a value or fails with an error
/// description list.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome {
    Success(XmlValue),
    Failure(Vec<String>),
}

impl ApiOutcome {
    fn from_response(value: XmlValue) -> Result<Self, BackendError> {
        let status = value
            .field("Status")
            .and_then(XmlValue::as_str)
            .ok_or_else(|| malformed("missing Status"))?;
        if status == "Success" {
            let inner = value
                .field("Value")
                .cloned()
                .ok_or_else(|| malformed("missing Value"))?;
            Ok(Self::Success(inner))
        } else {
            let descriptions = value
                .field("ErrorDescription")
                .and_then(XmlValue::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(XmlValue::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Self::Failure(descriptions))
        }
    }

    fn into_success(self) -> Result<XmlValue, BackendError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(desc) => Err(BackendError::api(format!(
                "Xen API error: {}",
                if desc.is_empty() {
                    "NO_ERROR".to_string()
                } else {
                    desc.join(" ")
                }
            ))),
        }
    }
}

// ── HTTP transport ──────────────────────────────────────────────────────

/// One XML-RPC endpoint, i.e. one `https://host` URL.
#[derive(Clone)]
pub struct XapiClient {
    http: reqwest::Client,
    url: String,
}

impl XapiClient {
    pub fn new(url: String) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackendError::api(e.to_string()))?;
        Ok(Self { http, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn call(&self, method: &str, params: &[XmlValue]) -> Result<ApiOutcome, BackendError> {
        let body = build_request(method, params);
        let response = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::api(format!("{}: {}", self.url, e)))?;
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::api(format!("{}: {}", self.url, e)))?;
        ApiOutcome::from_response(parse_response(&text)?)
    }

    async fn call_ok(&self, method: &str, params: &[XmlValue]) -> Result<XmlValue, BackendError> {
        self.call(method, params).await?.into_success()
    }
}

// ── The backend ─────────────────────────────────────────────────────────

struct ApiSession {
    client: XapiClient,
    session_ref: String,
    vm_ref: String,
    console_ref: String,
    console_location: String,
}

/// Console backend for one session of one VM, speaking XenAPI.
pub struct XapiBackend {
    config: Arc<Config>,
    vm: VmId,
    state: Mutex<Option<ApiSession>>,
}

impl XapiBackend {
    pub fn new(config: Arc<Config>, vm: VmId) -> Self {
        Self {
            config,
            vm,
            state: Mutex::new(None),
        }
    }

    fn host_url(host: &Host, pool: &Pool) -> String {
        if !host.address.is_empty() {
            format!("https://{}", host.address)
        } else if host.hostname_is_ipv4 {
            format!("https://{}", host.hostname)
        } else {
            format!("https://{}{}", host.hostname, pool.domain)
        }
    }

    async fn login(&self, pool: &Pool) -> Result<(XapiClient, String), BackendError> {
        let password = xvp_auth::decrypt_manager(&pool.password);
        let params = [
            XmlValue::str(&pool.manager),
            XmlValue::str(&password),
            XmlValue::str(API_VERSION),
        ];

        let mut last = BackendError::api("Xen API error: no hosts configured");
        for host in &pool.hosts {
            let mut client = XapiClient::new(Self::host_url(host, pool))?;
            log::debug!("Trying host {}", &client.url()["https://".len()..]);

            let mut outcome = match client.call("session.login_with_password", &params).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    last = e;
                    continue;
                }
            };

            let redirect = match &outcome {
                ApiOutcome::Failure(desc)
                    if desc.first().map(String::as_str) == Some("HOST_IS_SLAVE")
                        && desc.len() > 1 =>
                {
                    Some(desc[1].clone())
                }
                _ => None,
            };
            if let Some(master) = redirect {
                log::debug!("Redirected to {}", master);
                client = XapiClient::new(format!("https://{}", master))?;
                outcome = match client.call("session.login_with_password", &params).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        last = e;
                        continue;
                    }
                };
            }

            match outcome {
                ApiOutcome::Success(value) => {
                    let session_ref = value
                        .as_str()
                        .ok_or_else(|| malformed("session ref is not a string"))?
                        .to_string();
                    log::debug!("Xen API session established to {}", client.url());
                    return Ok((client, session_ref));
                }
                ApiOutcome::Failure(desc) => {
                    let auth_failed =
                        desc.first().map(String::as_str) == Some("SESSION_AUTHENTICATION_FAILED");
                    last = BackendError::api(format!("Xen API error: {}", desc.join(" ")));
                    if auth_failed {
                        break;
                    }
                }
            }
        }

        Err(last)
    }

    async fn ip_to_hostname(
        client: &XapiClient,
        session: &XmlValue,
        ip: &str,
    ) -> Result<String, BackendError> {
        // The name XenServer knows a host by may differ from reverse DNS.
        let hosts = client.call_ok("host.get_all", &[session.clone()]).await?;
        for href in hosts.as_array().unwrap_or(&[]) {
            let address = client
                .call_ok("host.get_address", &[session.clone(), href.clone()])
                .await?;
            if address.as_str() == Some(ip) {
                let hostname = client
                    .call_ok("host.get_hostname", &[session.clone(), href.clone()])
                    .await?;
                return hostname
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| malformed("hostname is not a string"));
            }
        }
        Err(BackendError::not_found(format!("{}: host not found", ip)))
    }

    async fn resolve_vm(
        &self,
        client: &XapiClient,
        session: &XmlValue,
    ) -> Result<String, BackendError> {
        let pool = self.config.pool(self.vm);
        let vm = self.config.vm(self.vm);

        let host_entry = pool
            .hosts
            .iter()
            .find(|h| h.hostname == vm.name || h.address == vm.name);

        let refs = if let Some(host) = host_entry {
            let label = if !host.address.is_empty() {
                let hostname = Self::ip_to_hostname(client, session, &host.address).await?;
                format!("Control domain on host: {}", hostname)
            } else {
                format!("Control domain on host: {}{}", host.hostname, pool.domain)
            };
            log::debug!("{}", label);
            client
                .call_ok("VM.get_by_name_label", &[session.clone(), XmlValue::str(label)])
                .await?
        } else if let Some(uuid) = &vm.uuid {
            let vm_ref = client
                .call_ok("VM.get_by_uuid", &[session.clone(), XmlValue::str(uuid)])
                .await?;
            let label = client
                .call_ok("VM.get_name_label", &[session.clone(), vm_ref.clone()])
                .await?;
            log::debug!("VM name label: {}", label.as_str().unwrap_or("?"));
            XmlValue::Array(vec![vm_ref])
        } else {
            client
                .call_ok(
                    "VM.get_by_name_label",
                    &[session.clone(), XmlValue::str(&vm.name)],
                )
                .await?
        };

        let refs = refs.as_array().unwrap_or(&[]);
        match refs.len() {
            0 => Err(BackendError::not_found(format!("{}: VM not found", vm.name))),
            1 => refs[0]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed("VM ref is not a string")),
            _ => Err(BackendError::api(format!(
                "{}: Multiple VMs with same name",
                vm.name
            ))),
        }
    }

    /// Establish (or reuse) the API session and locate the console.
    async fn ensure_console(&self) -> Result<(String, String), BackendError> {
        let mut state = self.state.lock().await;
        if let Some(api) = state.as_ref() {
            return Ok((api.console_location.clone(), api.session_ref.clone()));
        }

        let pool = self.config.pool(self.vm);
        let (client, session_ref) = self.login(pool).await?;
        let session = XmlValue::str(&session_ref);

        let vm_ref = self.resolve_vm(&client, &session).await?;

        let consoles = client
            .call_ok("VM.get_consoles", &[session.clone(), XmlValue::str(&vm_ref)])
            .await?;
        let mut found = None;
        for console in consoles.as_array().unwrap_or(&[]) {
            let protocol = client
                .call_ok("console.get_protocol", &[session.clone(), console.clone()])
                .await?;
            if protocol.as_str() == Some("rfb") {
                let location = client
                    .call_ok("console.get_location", &[session.clone(), console.clone()])
                    .await?;
                let location = location
                    .as_str()
                    .ok_or_else(|| malformed("console location is not a string"))?
                    .to_string();
                let console_ref = console
                    .as_str()
                    .ok_or_else(|| malformed("console ref is not a string"))?
                    .to_string();
                found = Some((console_ref, location));
                break;
            }
        }
        let Some((console_ref, console_location)) = found else {
            return Err(BackendError::not_found(format!(
                "{}: Console not found",
                self.config.vm(self.vm).name
            )));
        };

        // Console events tell us when the VM reboots or migrates.
        client
            .call_ok(
                "event.register",
                &[
                    session.clone(),
                    XmlValue::Array(vec![XmlValue::str("console")]),
                ],
            )
            .await?;

        log::debug!("Xen API console location: {}", console_location);

        let result = (console_location.clone(), session_ref.clone());
        *state = Some(ApiSession {
            client,
            session_ref,
            vm_ref,
            console_ref,
            console_location,
        });
        Ok(result)
    }
}

#[async_trait]
impl ConsoleBackend for XapiBackend {
    async fn open_stream(&self) -> Result<TunnelStream, BackendError> {
        let (location, session_ref) = self.ensure_console().await?;
        open_console_tunnel(&location, &session_ref).await
    }

    async fn event_wait(&self) -> bool {
        // Snapshot the call parameters; the watch itself must not hold
        // the state lock.
        let (session, console_ref, client) = {
            let state = self.state.lock().await;
            let Some(api) = state.as_ref() else {
                return false;
            };
            (
                XmlValue::str(&api.session_ref),
                api.console_ref.clone(),
                api.client.clone(),
            )
        };

        loop {
            let events = match client.call_ok("event.next", &[session.clone()]).await {
                Ok(events) => events,
                Err(e) => {
                    log::error!("{}", e);
                    return false;
                }
            };

            for event in events.as_array().unwrap_or(&[]) {
                let operation = event.field("operation").and_then(XmlValue::as_str);
                let evref = event.field("ref").and_then(XmlValue::as_str);
                if operation == Some("del") && evref == Some(console_ref.as_str()) {
                    log::debug!("Console deleted by server");
                    return true;
                }
            }
        }
    }

    async fn handle_message_code(&self, code: XvpCode) -> bool {
        log::info!("Client {} request received", code);

        let outcome = async {
            let state = self.state.lock().await;
            let api = state
                .as_ref()
                .ok_or_else(|| BackendError::api("Xen API error: no session"))?;
            let session = XmlValue::str(&api.session_ref);
            let vm_ref = XmlValue::str(&api.vm_ref);

            match code {
                XvpCode::Shutdown => {
                    let ha = api
                        .client
                        .call_ok("VM.get_ha_always_run", &[session.clone(), vm_ref.clone()])
                        .await?;
                    if ha.as_bool() == Some(true) {
                        log::debug!("Disabling HA prior to shutdown");
                        api.client
                            .call_ok(
                                "VM.set_ha_always_run",
                                &[session.clone(), vm_ref.clone(), XmlValue::Bool(false)],
                            )
                            .await?;
                    }
                    api.client
                        .call_ok("VM.clean_shutdown", &[session, vm_ref])
                        .await
                }
                XvpCode::Reboot => {
                    api.client
                        .call_ok("VM.clean_reboot", &[session, vm_ref])
                        .await
                }
                XvpCode::Reset => {
                    api.client
                        .call_ok("VM.hard_reboot", &[session, vm_ref])
                        .await
                }
                _ => Err(BackendError::api("Xen API error: unsupported request")),
            }
        }
        .await;

        match outcome {
            Ok(_) => {
                log::info!("Client {} request succeeded", code);
                true
            }
            Err(e) => {
                log::error!("Client {} request failed: {}", code, e);
                false
            }
        }
    }
}

/// Factory handing out [`XapiBackend`] instances, one per session.
pub struct XapiFactory;

impl BackendFactory for XapiFactory {
    fn create(&self, config: &Arc<Config>, vm: VmId) -> Arc<dyn ConsoleBackend> {
        Arc::new(XapiBackend::new(config.clone(), vm))
    }
}
