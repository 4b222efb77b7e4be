use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("error parsing configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_led_count() -> u32 {
    50
}

fn default_baud_rate() -> u32 {
    115200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Serial {
    #[validate(length(min = 1))]
    pub path: String,
    #[serde(default = "default_baud_rate")]
    #[validate(range(min = 1))]
    pub baud_rate: u32,
}

impl Default for Serial {
    fn default() -> Self {
        Self {
            path: "/dev/ttyACM0".to_owned(),
            baud_rate: default_baud_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Tcp {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct File {
    #[validate(length(min = 1))]
    pub path: String,
}

/// Byte-stream transport the frames are written to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(rename_all = "lowercase", tag = "type")]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    Serial(Serial),
    Tcp(Tcp),
    File(File),
}

impl Default for Transport {
    fn default() -> Self {
        Self::Serial(Serial::default())
    }
}

impl Validate for Transport {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        match self {
            Transport::Serial(transport) => transport.validate(),
            Transport::Tcp(transport) => transport.validate(),
            Transport::File(transport) => transport.validate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct Device {
    #[validate(range(max = 1024))]
    pub led_count: u32,
    #[validate(nested)]
    pub transport: Transport,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            led_count: default_led_count(),
            transport: Transport::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct Scripts {
    pub path: PathBuf,
    #[validate(length(min = 1))]
    pub startup: Option<String>,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scripts"),
            startup: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct Server {
    pub enable: bool,
    pub bind: IpAddr,
    #[validate(range(min = 1))]
    pub port: u16,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            enable: true,
            bind: Ipv4Addr::LOCALHOST.into(),
            port: 19444,
        }
    }
}

impl Server {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[validate(nested)]
    pub device: Device,
    #[validate(nested)]
    pub scripts: Scripts,
    #[validate(nested)]
    pub server: Server,
}

impl Config {
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let source = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&source)
    }

    pub fn to_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.device.led_count, 50);
        assert_eq!(config.scripts.path, PathBuf::from("scripts"));
    }

    #[test]
    fn test_tcp_transport() {
        let config = Config::from_toml(
            r#"
            [device]
            led_count = 120

            [device.transport]
            type = "tcp"
            host = "ledstrip.local"
            port = 5000

            [scripts]
            path = "/srv/scripts"
            startup = "rainbow"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.led_count, 120);
        assert_eq!(
            config.device.transport,
            Transport::Tcp(Tcp {
                host: "ledstrip.local".to_owned(),
                port: 5000
            })
        );
        assert_eq!(config.scripts.startup.as_deref(), Some("rainbow"));
        assert!(config.server.enable);
    }

    #[test]
    fn test_serial_default_baud_rate() {
        let config = Config::from_toml(
            r#"
            [device.transport]
            type = "serial"
            path = "/dev/ttyUSB0"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.device.transport,
            Transport::Serial(Serial {
                path: "/dev/ttyUSB0".to_owned(),
                baud_rate: 115200,
            })
        );
    }

    #[test]
    fn test_led_count_limit() {
        let result = Config::from_toml(
            r#"
            [device]
            led_count = 1025
            "#,
        );

        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_invalid_port() {
        let result = Config::from_toml(
            r#"
            [device.transport]
            type = "tcp"
            host = "localhost"
            port = 0
            "#,
        );

        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_server_address() {
        let config = Config::from_toml(
            r#"
            [server]
            bind = "0.0.0.0"
            port = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.server.address(), "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert!(Config::from_toml("[server]\nbind = \"not an address\"").is_err());
    }

    #[test]
    fn test_dump_round_trip() {
        let config = Config::default();
        let dumped = config.to_string().unwrap();
        assert_eq!(Config::from_toml(&dumped).unwrap(), config);
    }
}
