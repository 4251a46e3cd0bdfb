//! Host side of the sandbox: the only capabilities a script has.
//!
//! Everything here is reached through one `host` object that the prelude
//! captures and then hides; scripts only see the wrappers the prelude
//! builds around these functions.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use hmac::{Hmac, Mac};
use rquickjs::prelude::Opt;
use rquickjs::{Ctx, Exception, Function, Object};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{FetchConfig, NonPrimitivePolicy};
use crate::environment::EnvironmentStore;
use crate::error::PreflightError;
use crate::http_client::{FetchOptions, HttpClient, HttpError};
use crate::sandbox::console::{LogCollector, LogEntry, LogLevel, script_location};

/// `atob` accepts unpadded input and ignores trailing bits, like browsers do
const FORGIVING_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// A timer registered by `setTimeout`; the callback itself stays in JS
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Timer {
    pub due: Instant,
    pub seq: u64,
    pub id: u32,
}

/// Mutable state of one run, shared by the host functions
pub(crate) struct HostState {
    pub environment: EnvironmentStore,
    pub logs: LogCollector,
    pub deadline: Instant,
    timers: BinaryHeap<Reverse<Timer>>,
    next_timer_seq: u64,
    non_primitive: NonPrimitivePolicy,
    fetch_config: FetchConfig,
    http: Option<HttpClient>,
}

impl HostState {
    pub fn new(
        environment: EnvironmentStore,
        logs: LogCollector,
        deadline: Instant,
        non_primitive: NonPrimitivePolicy,
        fetch_config: FetchConfig,
    ) -> Self {
        Self {
            environment,
            logs,
            deadline,
            timers: BinaryHeap::new(),
            next_timer_seq: 0,
            non_primitive,
            fetch_config,
            http: None,
        }
    }

    pub fn schedule(&mut self, id: u32, delay_ms: f64) {
        let delay_ms = if delay_ms.is_finite() && delay_ms > 0.0 {
            delay_ms.min(i32::MAX as f64)
        } else {
            0.0
        };
        let timer = Timer {
            due: Instant::now() + Duration::from_secs_f64(delay_ms / 1000.0),
            seq: self.next_timer_seq,
            id,
        };
        self.next_timer_seq += 1;
        self.timers.push(Reverse(timer));
    }

    /// Earliest timer, ties broken by registration order
    pub fn pop_timer(&mut self) -> Option<Timer> {
        self.timers.pop().map(|Reverse(timer)| timer)
    }

    pub fn clear_timers(&mut self) {
        self.timers.clear();
    }

    fn http_client(&mut self) -> Result<&HttpClient, HttpError> {
        let client = match self.http.take() {
            Some(client) => client,
            None => HttpClient::new(&self.fetch_config)?,
        };
        Ok(self.http.insert(client))
    }
}

/// Output of the `lab.CryptoJS` hash functions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestOutput {
    pub hex: String,
    pub base64: String,
}

/// Hash `message` (UTF-8) with `SHA256`, `SHA512` or `HmacSHA256`
pub fn digest(algorithm: &str, message: &str, key: Option<&str>) -> Result<DigestOutput, String> {
    let bytes = match (algorithm, key) {
        ("SHA256", _) => Sha256::digest(message.as_bytes()).to_vec(),
        ("SHA512", _) => Sha512::digest(message.as_bytes()).to_vec(),
        ("HmacSHA256", Some(key)) => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
                .map_err(|e| format!("Invalid HMAC key: {}", e))?;
            mac.update(message.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        ("HmacSHA256", None) => return Err("HmacSHA256 requires a key".to_string()),
        (other, _) => return Err(format!("Unsupported digest algorithm: {}", other)),
    };

    Ok(DigestOutput {
        hex: bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        base64: STANDARD.encode(&bytes),
    })
}

/// Latin-1 string to base64; `None` if a character is above U+00FF
pub fn btoa(input: &str) -> Option<String> {
    let bytes = input
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect::<Option<Vec<u8>>>()?;
    Some(STANDARD.encode(bytes))
}

/// Base64 to a Latin-1 string; `None` for malformed input
pub fn atob(input: &str) -> Option<String> {
    let compact: String = input
        .chars()
        .filter(|c| !matches!(c, ' ' | '\t' | '\n' | '\x0c' | '\r'))
        .collect();
    let bytes = FORGIVING_BASE64.decode(compact).ok()?;
    Some(bytes.into_iter().map(char::from).collect())
}

/// Build the `host` object handed to the prelude
pub(crate) fn host_object<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<RefCell<HostState>>,
) -> rquickjs::Result<Object<'js>> {
    let host = Object::new(ctx.clone())?;

    let log_state = Rc::clone(state);
    let log = Function::new(
        ctx.clone(),
        move |method: String, text: String, stack: Opt<String>| -> rquickjs::Result<()> {
            let level = LogLevel::from_method(&method).unwrap_or(LogLevel::Log);
            let location = stack.0.as_deref().and_then(script_location);
            debug!(level = level.as_str(), text = %text, "Script console output");
            log_state
                .borrow_mut()
                .logs
                .push(LogEntry::new(level, text).with_location(location));
            Ok(())
        },
    )?;
    host.set("log", log)?;

    let get_state = Rc::clone(state);
    let env_get = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<Option<String>> {
            let state = get_state.borrow();
            match state.environment.get_value(&key) {
                Some(value) => serde_json::to_string(value)
                    .map(Some)
                    .map_err(|e| Exception::throw_internal(&ctx, &e.to_string())),
                None => Ok(None),
            }
        },
    )?;
    host.set("envGet", env_get)?;

    let set_state = Rc::clone(state);
    let env_set = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              key: String,
              json: String,
              non_primitive_kind: Opt<String>|
              -> rquickjs::Result<()> {
            let mut state = set_state.borrow_mut();
            if let Some(kind) = non_primitive_kind.0
                && state.non_primitive == NonPrimitivePolicy::Reject
            {
                let error = PreflightError::InvalidValueKind { key, kind };
                return Err(Exception::throw_type(&ctx, &error.to_string()));
            }
            let value: Value = serde_json::from_str(&json)
                .map_err(|e| Exception::throw_type(&ctx, &e.to_string()))?;
            debug!(key = %key, "Script environment update");
            state
                .environment
                .set(key, value)
                .map_err(|e| Exception::throw_type(&ctx, &e.to_string()))
        },
    )?;
    host.set("envSet", env_set)?;

    let remove_state = Rc::clone(state);
    let env_remove = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<()> {
        remove_state.borrow_mut().environment.remove(&key);
        Ok(())
    })?;
    host.set("envRemove", env_remove)?;

    let digest_fn = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              algorithm: String,
              message: String,
              key: Opt<String>|
              -> rquickjs::Result<Vec<String>> {
            let output = digest(&algorithm, &message, key.0.as_deref())
                .map_err(|e| Exception::throw_type(&ctx, &e))?;
            Ok(vec![output.hex, output.base64])
        },
    )?;
    host.set("digest", digest_fn)?;

    let btoa_fn = Function::new(ctx.clone(), |input: String| -> rquickjs::Result<Option<String>> {
        Ok(btoa(&input))
    })?;
    host.set("btoa", btoa_fn)?;

    let atob_fn = Function::new(ctx.clone(), |input: String| -> rquickjs::Result<Option<String>> {
        Ok(atob(&input))
    })?;
    host.set("atob", atob_fn)?;

    let fetch_state = Rc::clone(state);
    let fetch = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, url: String, init: String| -> rquickjs::Result<String> {
            let options: FetchOptions = serde_json::from_str(&init).map_err(|e| {
                Exception::throw_type(&ctx, &format!("Invalid fetch options: {}", e))
            })?;
            let mut state = fetch_state.borrow_mut();
            let budget = state.deadline.saturating_duration_since(Instant::now());
            let response = state
                .http_client()
                .and_then(|client| client.fetch(&url, options, Some(budget)))
                .map_err(|e| Exception::throw_type(&ctx, &format!("Failed to fetch: {}", e)))?;
            debug!(url = %url, status = response.status, "Script fetch completed");
            serde_json::to_string(&response)
                .map_err(|e| Exception::throw_internal(&ctx, &e.to_string()))
        },
    )?;
    host.set("fetch", fetch)?;

    let timer_state = Rc::clone(state);
    let schedule = Function::new(ctx.clone(), move |id: u32, delay_ms: f64| -> rquickjs::Result<()> {
        timer_state.borrow_mut().schedule(id, delay_ms);
        Ok(())
    })?;
    host.set("schedule", schedule)?;

    Ok(host)
}
