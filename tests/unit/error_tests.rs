//! Unit tests for `AppError` display format and classification.

use recipe_agent::AppError;

#[test]
fn display_uses_category_prefix() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Protocol("bad".into()), "protocol: bad"),
        (AppError::Serialization("bad".into()), "serialization: bad"),
        (AppError::Transport("bad".into()), "transport: bad"),
        (AppError::Step("bad".into()), "step: bad"),
        (AppError::WaitConfig("bad".into()), "wait config: bad"),
        (AppError::Watch("bad".into()), "watch: bad"),
        (AppError::Process("bad".into()), "process: bad"),
        (AppError::Update("bad".into()), "update: bad"),
        (AppError::Io("bad".into()), "io: bad"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn no_active_session_reads_as_transport_failure() {
    assert_eq!(
        AppError::NoActiveSession.to_string(),
        "transport: no active session"
    );
}

#[test]
fn messages_have_no_trailing_period() {
    let err = AppError::Transport("write failed".into());
    let s = err.to_string();
    assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
}

#[test]
fn only_delivery_failures_are_transient() {
    assert!(AppError::Transport("reset".into()).is_transient());
    assert!(AppError::NoActiveSession.is_transient());
    assert!(!AppError::Serialization("nan".into()).is_transient());
    assert!(!AppError::Protocol("missing id".into()).is_transient());
}

#[test]
fn json_errors_convert_to_serialization() {
    let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    assert!(matches!(AppError::from(err), AppError::Serialization(_)));
}

#[test]
fn toml_errors_convert_to_config() {
    let err = toml::from_str::<toml::Value>("= broken").unwrap_err();
    let app = AppError::from(err);
    assert!(app.to_string().starts_with("config: invalid config"));
}

#[test]
fn io_errors_convert_to_io() {
    let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    assert_eq!(AppError::from(err).to_string(), "io: denied");
}
