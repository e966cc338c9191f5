// Copyright 2020 Joyent, Inc.

use serde_derive::Deserialize;

use crate::error::RpcError;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Period of the steady-state tick.
    pub tick_interval_ms: u64,
    /// Period of the reconnection tick.
    pub reconnect_interval_ms: u64,
    /// Minimum gap between two timeout sweeps.
    pub sweep_interval_ms: u64,
    /// Minimum gap between two RequestIds messages.
    pub control_interval_ms: u64,
    /// Fraction of the server's read timeout after which a RequestIds
    /// message goes out even when many calls are in flight.
    pub heartbeat_ratio: f64,
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            tick_interval_ms: 200,
            reconnect_interval_ms: 1000,
            sweep_interval_ms: 800,
            control_interval_ms: 1000,
            heartbeat_ratio: 0.8,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from a JSON object. Missing fields take
    /// their defaults.
    pub fn from_json(s: &str) -> Result<ClientConfig, RpcError> {
        let invalid = |e: serde_json::Error| {
            RpcError::kernel_panic("invalid client configuration")
                .add_debug(e.to_string())
        };
        let value: serde_json::Value =
            serde_json::from_str(s).map_err(invalid)?;
        if !value.is_object() {
            return Err(RpcError::kernel_panic("invalid client configuration")
                .add_debug("configuration must be a JSON object"));
        }
        let config: ClientConfig =
            serde_json::from_value(value).map_err(invalid)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        let intervals = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("control_interval_ms", self.control_interval_ms),
        ];
        for (name, value) in intervals.iter() {
            if *value == 0 {
                return Err(RpcError::kernel_panic(
                    "invalid client configuration",
                )
                .add_debug(format!("{} must be positive", name)));
            }
        }
        if !(self.heartbeat_ratio > 0.0 && self.heartbeat_ratio <= 1.0) {
            return Err(RpcError::kernel_panic("invalid client configuration")
                .add_debug("heartbeat_ratio must be in (0, 1]"));
        }
        if self.max_frame_len == 0 {
            return Err(RpcError::kernel_panic("invalid client configuration")
                .add_debug("max_frame_len must be positive"));
        }
        Ok(())
    }
}
