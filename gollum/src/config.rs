//! Top-level daemon configuration: the ambient HTTP surface, shutdown
//! behavior, and where to find the producer topology.

use envconfig::Envconfig;
use gollum_core::config::ShutdownConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "660")]
    pub port: u16,

    /// Path to a topology file describing producers, their types, and the
    /// streams each one listens to. See `crate::coordinator::load_topology`.
    #[envconfig(default = "gollum.json")]
    pub topology_path: String,

    /// Directory the Spooling producer writes overflow segments under.
    #[envconfig(default = "./spool")]
    pub spool_path: String,

    #[envconfig(nested = true)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
