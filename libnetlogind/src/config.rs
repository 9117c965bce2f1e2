// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, path::PathBuf, time};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

const ETC_CONFIG: &str = "/etc/netlogind/config.toml";

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let config_path = PathBuf::from(ETC_CONFIG);
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// socket overrides the well known listening socket path.
    /// The `--socket` flag wins over this value.
    pub socket: Option<PathBuf>,

    /// How long a connection may stay unauthenticated, in milliseconds.
    pub auth_timeout_ms: Option<u64>,

    /// Minimum delay between per-connection broker forks, in
    /// milliseconds. This is a rate limit on unauthenticated process
    /// creation, not a performance knob.
    pub accept_throttle_ms: Option<u64>,
}

impl Config {
    pub fn auth_timeout(&self) -> time::Duration {
        self.auth_timeout_ms.map(time::Duration::from_millis).unwrap_or(consts::AUTH_TIMEOUT)
    }

    pub fn accept_throttle(&self) -> time::Duration {
        self.accept_throttle_ms.map(time::Duration::from_millis).unwrap_or(consts::ACCEPT_THROTTLE)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_overrides() -> anyhow::Result<()> {
        let config: Config = toml::from_str(
            r#"
            socket = "/run/netlogind.sock"
            auth_timeout_ms = 250
            "#,
        )?;
        assert_eq!(config.socket, Some(PathBuf::from("/run/netlogind.sock")));
        assert_eq!(config.auth_timeout(), time::Duration::from_millis(250));
        assert_eq!(config.accept_throttle(), consts::ACCEPT_THROTTLE);

        Ok(())
    }
}
