//! Pure connection configuration for the MQTT transport
//!
//! Broker URL parsing, option construction and QoS mapping. Nothing in here
//! touches the network.

use crate::config::BrokerSection;
use crate::supervisor::ConnectionCredentials;
use crate::transport::TransportError;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Per-connection MQTT settings derived from the broker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub broker_url: String,
    pub keep_alive: Duration,
    pub handshake_timeout: Duration,
    pub qos: QoS,
    /// Capacity of the client request channel
    pub request_capacity: usize,
}

impl MqttSettings {
    pub fn from_broker_section(section: &BrokerSection) -> Self {
        Self {
            broker_url: section.broker_url.clone(),
            keep_alive: Duration::from_secs(section.keep_alive_secs),
            handshake_timeout: Duration::from_secs(section.handshake_timeout_secs),
            qos: qos_from_level(section.qos),
            request_capacity: 10,
        }
    }
}

/// Map a numeric QoS level onto the protocol enum; anything above 2 clamps to 2
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Broker endpoint extracted from a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, TransportError> {
    let url =
        Url::parse(broker_url).map_err(|_| TransportError::InvalidBrokerUrl(broker_url.into()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(TransportError::InvalidBrokerUrl(broker_url.into())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.into()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Build rumqttc options for one connection attempt
pub fn configure_mqtt_options(
    credentials: &ConnectionCredentials,
    settings: &MqttSettings,
) -> Result<MqttOptions, TransportError> {
    let endpoint = parse_broker_url(&settings.broker_url)?;

    let mut mqtt_options = MqttOptions::new(credentials.client_id(), endpoint.host, endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Anonymous brokers get no credentials at all
    if !credentials.username().is_empty() {
        mqtt_options.set_credentials(credentials.username(), credentials.secret());
    }

    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> MqttSettings {
        MqttSettings {
            broker_url: url.to_string(),
            keep_alive: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(60),
            qos: QoS::AtLeastOnce,
            request_capacity: 10,
        }
    }

    #[test]
    fn test_parse_plain_url_default_port() {
        let endpoint = parse_broker_url("mqtt://localhost").unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 1883);
        assert!(!endpoint.tls);
    }

    #[test]
    fn test_parse_tls_url() {
        let endpoint = parse_broker_url("mqtts://broker.example.com").unwrap();
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.tls);

        let endpoint = parse_broker_url("mqtts://broker.example.com:9883").unwrap();
        assert_eq!(endpoint.port, 9883);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_broker_url("invalid-url"),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            parse_broker_url("http://localhost:1883"),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_level(9), QoS::ExactlyOnce);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let credentials = ConnectionCredentials::new("thp-listener", "user", "pass");
        let options = configure_mqtt_options(&credentials, &settings("mqtt://localhost:1883"))
            .expect("options should build");

        assert_eq!(options.client_id(), "thp-listener");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_configure_mqtt_options_invalid_url() {
        let credentials = ConnectionCredentials::new("id", "", "");
        let result = configure_mqtt_options(&credentials, &settings("invalid-url"));
        assert!(matches!(result, Err(TransportError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_settings_from_broker_section() {
        let section = BrokerSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            product_key: "pk".to_string(),
            device_name: "dn".to_string(),
            client_id: None,
            username_env: None,
            password_env: None,
            keep_alive_secs: 30,
            handshake_timeout_secs: 5,
            qos: 0,
        };
        let settings = MqttSettings::from_broker_section(&section);

        assert_eq!(settings.keep_alive, Duration::from_secs(30));
        assert_eq!(settings.handshake_timeout, Duration::from_secs(5));
        assert_eq!(settings.qos, QoS::AtMostOnce);
    }
}
