//! Unit tests for chat, kick and error classification.
//!
//! Validates:
//! - Chat messages map to every signal they carry
//! - Kick classes are checked in priority order
//! - Client errors map to their reconnect class, noise first

use digfleet::client::{ClientError, ClientErrorKind};
use digfleet::config::PhraseConfig;
use digfleet::session::signals::{ChatSignal, ErrorClass, KickClass, SignalClassifier};

fn classifier() -> SignalClassifier {
    SignalClassifier::new(&PhraseConfig::default())
}

#[test]
fn login_prompt_is_detected() {
    assert_eq!(
        classifier().classify_chat("§ePlease log in: §f/login <password>"),
        vec![ChatSignal::LoginPrompt]
    );
}

#[test]
fn quick_login_is_detected_in_either_language() {
    let c = classifier();
    assert_eq!(
        c.classify_chat("You recently logged in, no password required."),
        vec![ChatSignal::QuickLogin]
    );
    assert_eq!(
        c.classify_chat("Вы недавно входили, ввод пароля не требуется"),
        vec![ChatSignal::QuickLogin]
    );
}

#[test]
fn probe_needs_subject_and_action() {
    let c = classifier();
    assert_eq!(
        c.classify_chat("[Scanner] Please wait and don't move"),
        vec![ChatSignal::ProbeDetected]
    );
    assert!(c.classify_chat("[Scanner] online").is_empty());
    assert!(c.classify_chat("Please wait for the next round").is_empty());
}

#[test]
fn one_message_can_carry_several_signals() {
    assert_eq!(
        classifier().classify_chat("Авторизация: /login. Сканер: не двигайтесь"),
        vec![ChatSignal::LoginPrompt, ChatSignal::ProbeDetected]
    );
}

#[test]
fn join_message_is_detected() {
    assert_eq!(
        classifier().classify_chat("You entered instance 3. Your position is tracked."),
        vec![ChatSignal::Joined]
    );
}

#[test]
fn kick_classes_follow_priority_order() {
    let c = classifier();
    assert_eq!(
        c.classify_kick("Please wait 10 minutes before reconnecting"),
        KickClass::RateLimited
    );
    // A rate-limit phrase wins over an anti-bot phrase in the same reason.
    assert_eq!(
        c.classify_kick("Antibot: wait before joining again"),
        KickClass::RateLimited
    );
    assert_eq!(c.classify_kick("You are logging in too fast!"), KickClass::TooFast);
    assert_eq!(
        c.classify_kick("AntiBot: connection limit exceeded"),
        KickClass::AntibotFailed
    );
    assert_eq!(c.classify_kick("Антибот: проверка не пройдена"), KickClass::AntibotRejected);
    assert_eq!(
        c.classify_kick("You are already connected to this server"),
        KickClass::AlreadyConnected
    );
    assert_eq!(c.classify_kick("Server restarting"), KickClass::Other);
}

#[test]
fn json_kick_reason_is_classified_by_its_text() {
    let raw = r#"{"text":"","extra":[{"text":"§cYou are"},{"text":"already connected"}]}"#;
    assert_eq!(classifier().classify_kick(raw), KickClass::AlreadyConnected);
}

#[test]
fn client_errors_map_to_classes() {
    let c = classifier();
    let class = |kind, message: &str| c.classify_error(&ClientError::new(kind, message));

    assert_eq!(class(ClientErrorKind::Dns, "getaddrinfo ENOTFOUND"), ErrorClass::NoNetwork);
    assert_eq!(
        class(ClientErrorKind::HostUnreachable, "EHOSTUNREACH"),
        ErrorClass::NoNetwork
    );
    assert_eq!(class(ClientErrorKind::ConnectionReset, "ECONNRESET"), ErrorClass::Network);
    assert_eq!(class(ClientErrorKind::Timeout, "ETIMEDOUT"), ErrorClass::Network);
    assert_eq!(class(ClientErrorKind::ConnectionRefused, "ECONNREFUSED"), ErrorClass::Network);
    assert_eq!(class(ClientErrorKind::ConnectFailed, "handshake"), ErrorClass::ConnectFailed);
    assert_eq!(
        class(ClientErrorKind::ClientTimedOut, "client timed out"),
        ErrorClass::ClientTimeout
    );
    assert_eq!(class(ClientErrorKind::Other, "bad packet"), ErrorClass::Other);
}

#[test]
fn noise_wins_over_kind() {
    let error = ClientError::new(
        ClientErrorKind::ConnectionReset,
        "Ignoring block entities as chunk failed to load",
    );
    assert_eq!(classifier().classify_error(&error), ErrorClass::Noise);
}

#[test]
fn custom_phrase_tables_are_matched_case_insensitively() {
    let phrases = PhraseConfig {
        joined: vec!["Welcome To The Mine".into()],
        ..PhraseConfig::default()
    };
    let c = SignalClassifier::new(&phrases);
    assert_eq!(c.classify_chat("WELCOME TO THE MINE"), vec![ChatSignal::Joined]);
    assert!(c.classify_chat("entered instance 1").is_empty());
}
