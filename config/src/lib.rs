//! Node configuration: a TOML file with defaults for every field, plus
//! a handful of `EMBER_*` environment overrides for the flags operators
//! flip most often.

use std::{env, fs, path::Path};

use ember_crypto::PublicKey;
use ember_data_model::constants::Network;
use serde::{Deserialize, Serialize};

const DEFAULT_NETWORK: Network = Network::Mainnet;
const DEFAULT_TRIM_DERIVED_TABLES: bool = true;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    /// Chain to join.
    pub network: Network,
    /// Compact derived tables below the rollback horizon as the chain
    /// grows. Disabling keeps full history and allows arbitrarily deep
    /// rollback.
    pub trim_derived_tables: bool,
    /// Rescan the whole chain at startup.
    pub force_scan: bool,
    /// Re-validate every block during the next scan.
    pub force_validate: bool,
    /// Generator public keys (hex) whose generation signatures are
    /// accepted without a stake check. Test setups only.
    pub fake_forging_keys: Vec<String>,
    /// Addresses of well-known peers to dial at startup.
    pub peers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK,
            trim_derived_tables: DEFAULT_TRIM_DERIVED_TABLES,
            force_scan: false,
            force_validate: false,
            fake_forging_keys: Vec::new(),
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Read configuration: defaults, overlaid by `path` when present,
    /// overlaid by environment variables.
    ///
    /// # Errors
    /// Fails on an unreadable or unparsable file, or a malformed
    /// environment override.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|source| Error::Read(path.display().to_string(), source))?;
                toml::from_str(&raw)
                    .map_err(|source| Error::Parse(path.display().to_string(), source))?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), Error> {
        if let Ok(network) = env::var("EMBER_NETWORK") {
            self.network = network
                .parse()
                .map_err(|_| Error::EnvValue("EMBER_NETWORK", network))?;
        }
        for (name, flag) in [
            ("EMBER_FORCE_SCAN", &mut self.force_scan),
            ("EMBER_FORCE_VALIDATE", &mut self.force_validate),
            ("EMBER_TRIM_DERIVED_TABLES", &mut self.trim_derived_tables),
        ] {
            if let Ok(value) = env::var(name) {
                *flag = match value.as_str() {
                    "1" | "true" => true,
                    "0" | "false" => false,
                    _ => return Err(Error::EnvValue(name, value)),
                };
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), Error> {
        for key in &self.fake_forging_keys {
            key.parse::<PublicKey>()
                .map_err(|_| Error::FakeForgingKey(key.clone()))?;
        }
        Ok(())
    }

    /// The parsed fake-forging allowlist.
    pub fn fake_forging_allowlist(&self) -> Vec<PublicKey> {
        self.fake_forging_keys
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect()
    }
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum Error {
    /// could not read config file `{0}`
    Read(String, #[source] std::io::Error),
    /// could not parse config file `{0}`
    Parse(String, #[source] toml::de::Error),
    /// environment variable {0} has unusable value `{1}`
    EnvValue(&'static str, String),
    /// fake forging key `{0}` is not a hex public key
    FakeForgingKey(String),
}
