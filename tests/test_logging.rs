//! Tests for logging configuration and format parsing

use thp_telemetry::observability::logging::{parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_unknown_defaults_to_compact() {
    assert_eq!(LogFormat::parse(""), LogFormat::Compact);
    assert_eq!(LogFormat::parse("xml"), LogFormat::Compact);
}

#[test]
fn test_parse_level() {
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("trace"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[tokio::test]
async fn test_span_macros_create_spans() {
    thp_telemetry::observability::init_logging(Level::TRACE, LogFormat::Compact, true);

    let mqtt = thp_telemetry::mqtt_span!(client_id = "span-test");
    let ingest = thp_telemetry::ingest_span!(queue = "inbound");
    let publish = thp_telemetry::publish_span!(dataset = "THP_data.csv", topic = "t");

    let _entered = mqtt.enter();
    drop(ingest);
    drop(publish);
}
