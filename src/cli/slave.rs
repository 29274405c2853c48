use structopt::StructOpt;

use crate::{
    cli::{common_rules, CommonOpts, ConfigError},
    config::SessionConfig,
    transport::Address,
};

#[derive(Debug, StructOpt)]
pub enum Cli {
    /// Bind the transport and wait for a master to dial in
    Listen(Listen),
    /// Dial a listening master
    Connect(Connect),
}

#[derive(Debug, StructOpt)]
#[non_exhaustive]
pub struct Listen {
    /// Transport to bind, as proto://host:port (host * or empty = all interfaces)
    pub address: Address,
    #[structopt(flatten)]
    pub common: CommonOpts,
    /// Delete this executable when the process exits
    #[structopt(short = "c", long = "cleanup")]
    pub cleanup: bool,
}

#[derive(Debug, StructOpt)]
#[non_exhaustive]
pub struct Connect {
    /// Transport to dial, as proto://host:port
    pub address: Address,
    #[structopt(flatten)]
    pub common: CommonOpts,
    /// Delete this executable when the process exits
    #[structopt(short = "c", long = "cleanup")]
    pub cleanup: bool,
}

impl Listen {
    pub fn validate(&self) -> Vec<ConfigError> {
        common_rules(&self.common, false, &self.address.host)
    }

    pub fn into_config(self) -> (SessionConfig, bool) {
        let session = SessionConfig::new(
            self.address,
            self.common.ssl,
            self.common.key.unwrap_or_default(),
            self.common.verbose,
            self.common.timeout,
        );
        (session, self.cleanup)
    }
}

impl Connect {
    pub fn validate(&self) -> Vec<ConfigError> {
        common_rules(&self.common, true, &self.address.host)
    }

    pub fn into_config(self) -> (SessionConfig, bool) {
        let session = SessionConfig::new(
            self.address,
            self.common.ssl,
            self.common.key.unwrap_or_default(),
            self.common.verbose,
            self.common.timeout,
        );
        (session, self.cleanup)
    }
}
