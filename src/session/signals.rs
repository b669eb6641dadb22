//! Table-driven classification of server text and client errors.
//!
//! All matching is case-insensitive substring matching against the phrase
//! tables in [`PhraseConfig`], after stripping legacy `§` formatting codes.

use regex::Regex;

use crate::client::{ClientError, ClientErrorKind};
use crate::config::PhraseConfig;

/// Tagged outcome of classifying one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSignal {
    /// The server asks for the password.
    LoginPrompt,
    /// Session resumed; no password or probe.
    QuickLogin,
    /// Anti-automation probe announced.
    ProbeDetected,
    /// Entered the target instance.
    Joined,
}

/// Kick reason classes, checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickClass {
    /// Asked to wait before reconnecting.
    RateLimited,
    /// Logging in too fast.
    TooFast,
    /// Anti-bot rejection reporting an exceeded limit (failed bypass).
    AntibotFailed,
    /// Other anti-bot rejection.
    AntibotRejected,
    /// Duplicate login.
    AlreadyConnected,
    /// Anything else.
    Other,
}

/// Client error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Library noise, ignored.
    Noise,
    /// DNS failure or unreachable host.
    NoNetwork,
    /// Timeout, reset or refusal.
    Network,
    /// Connecting failed.
    ConnectFailed,
    /// Client keep-alive check expired.
    ClientTimeout,
    /// Unclassified runtime error.
    Other,
}

fn lowercase_all(list: &[String]) -> Vec<String> {
    list.iter().map(|p| p.to_lowercase()).collect()
}

fn contains_any(text: &str, phrases: &[String]) -> bool {
    phrases.iter().any(|p| text.contains(p.as_str()))
}

/// Compiled phrase tables.
#[derive(Debug, Clone)]
pub struct SignalClassifier {
    phrases: PhraseConfig,
    formatting: Option<Regex>,
}

impl SignalClassifier {
    /// Build a classifier from configured phrase tables.
    #[must_use]
    pub fn new(phrases: &PhraseConfig) -> Self {
        let lowered = PhraseConfig {
            login_prompt: lowercase_all(&phrases.login_prompt),
            quick_login: lowercase_all(&phrases.quick_login),
            probe_subject: lowercase_all(&phrases.probe_subject),
            probe_action: lowercase_all(&phrases.probe_action),
            joined: lowercase_all(&phrases.joined),
            rate_limited: lowercase_all(&phrases.rate_limited),
            too_fast: lowercase_all(&phrases.too_fast),
            antibot: lowercase_all(&phrases.antibot),
            antibot_exceeded: lowercase_all(&phrases.antibot_exceeded),
            already_connected: lowercase_all(&phrases.already_connected),
            noise: lowercase_all(&phrases.noise),
        };
        Self {
            phrases: lowered,
            formatting: Regex::new("§[0-9a-fk-orA-FK-OR]").ok(),
        }
    }

    /// Lowercase text with formatting codes removed.
    #[must_use]
    pub fn normalize(&self, text: &str) -> String {
        let plain = match &self.formatting {
            Some(re) => re.replace_all(text, "").into_owned(),
            None => text.to_owned(),
        };
        plain.to_lowercase()
    }

    /// Every signal carried by one chat message.
    ///
    /// A single message can carry several signals (a login prompt that also
    /// announces the probe, for instance); they are returned in handling order.
    #[must_use]
    pub fn classify_chat(&self, text: &str) -> Vec<ChatSignal> {
        let text = self.normalize(text);
        let p = &self.phrases;
        let mut signals = Vec::new();
        if contains_any(&text, &p.login_prompt) {
            signals.push(ChatSignal::LoginPrompt);
        }
        if contains_any(&text, &p.quick_login) {
            signals.push(ChatSignal::QuickLogin);
        }
        if contains_any(&text, &p.probe_subject) && contains_any(&text, &p.probe_action) {
            signals.push(ChatSignal::ProbeDetected);
        }
        if contains_any(&text, &p.joined) {
            signals.push(ChatSignal::Joined);
        }
        signals
    }

    /// Classify a kick reason; the first matching class wins.
    #[must_use]
    pub fn classify_kick(&self, reason: &str) -> KickClass {
        let text = self.normalize(&kick_reason_text(reason));
        let p = &self.phrases;
        if contains_any(&text, &p.rate_limited) {
            KickClass::RateLimited
        } else if contains_any(&text, &p.too_fast) {
            KickClass::TooFast
        } else if contains_any(&text, &p.antibot) {
            if contains_any(&text, &p.antibot_exceeded) {
                KickClass::AntibotFailed
            } else {
                KickClass::AntibotRejected
            }
        } else if contains_any(&text, &p.already_connected) {
            KickClass::AlreadyConnected
        } else {
            KickClass::Other
        }
    }

    /// Classify a client error.
    #[must_use]
    pub fn classify_error(&self, error: &ClientError) -> ErrorClass {
        if contains_any(&error.message.to_lowercase(), &self.phrases.noise) {
            return ErrorClass::Noise;
        }
        if error.kind.is_no_network() {
            return ErrorClass::NoNetwork;
        }
        if error.kind.is_network() {
            return ErrorClass::Network;
        }
        match error.kind {
            ClientErrorKind::ConnectFailed => ErrorClass::ConnectFailed,
            ClientErrorKind::ClientTimedOut => ErrorClass::ClientTimeout,
            _ => ErrorClass::Other,
        }
    }
}

/// Plain text of a kick reason.
///
/// Servers send either plain text or a JSON chat component; for components
/// the `text` of the root and every `extra` part are joined with spaces.
#[must_use]
pub fn kick_reason_text(raw: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return raw.to_owned();
    };
    let mut parts = Vec::new();
    collect_text(&value, &mut parts);
    if parts.is_empty() {
        raw.to_owned()
    } else {
        parts.join(" ")
    }
}

fn collect_text(value: &serde_json::Value, parts: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => parts.push(s.clone()),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(text)) = map.get("text") {
                if !text.is_empty() {
                    parts.push(text.clone());
                }
            }
            if let Some(serde_json::Value::Array(extra)) = map.get("extra") {
                for part in extra {
                    collect_text(part, parts);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_text(item, parts);
            }
        }
        _ => {}
    }
}
