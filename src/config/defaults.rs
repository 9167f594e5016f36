use super::*;

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "172.27.153.1".to_string(),
            credential: None,
            protocol: ProtocolPreference::Auto,
            firmware_build: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_POLLING_INTERVAL_SECS,
            enabled: true,
            sunrise_elevation: None,
            sunset_elevation: None,
            elevation_threshold: None,
            polling_interval_seconds: None,
            has_battery: false,
            auto_detect_battery: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_seconds: 60,
            retry_pause_ms: 1000,
            port: 80,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: "/data/helios".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/helios.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8089,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            inverter_alert_misses: 5,
            inverter_drop_misses: 30,
            response_window: 50,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: None,
            gateway: GatewayConfig::default(),
            polling: PollingConfig::default(),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            location: None,
        }
    }
}
