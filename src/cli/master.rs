use {std::path::PathBuf, structopt::StructOpt};

use crate::{
    cli::{common_rules, CommonOpts, ConfigError},
    config::{MasterConfig, SessionConfig},
    protocol::{ForwardSpec, SocksSpec},
    transport::Address,
};

#[derive(Debug, StructOpt)]
pub enum Cli {
    /// Bind the transport and wait for a slave to dial in
    Listen(Listen),
    /// Dial a listening slave
    Connect(Connect),
}

/// Feature flags only the master understands; the slave learns about them
/// through the wire handshake.
#[derive(Debug, Clone, Default, StructOpt)]
pub struct FeatureOpts {
    /// Program for the slave to execute
    #[structopt(short = "e", long = "exec")]
    pub exec: Option<String>,
    /// Ask the slave for a PTY and put the local terminal into raw mode
    #[structopt(long = "pty")]
    pub pty: bool,
    /// Append a copy of all session traffic to this file
    #[structopt(short = "l", long = "log")]
    pub log: Option<PathBuf>,
    /// Forward a local port: [bind-host:]bind-port:target-host:target-port
    #[structopt(short = "L", long = "local", number_of_values = 1)]
    pub local: Vec<ForwardSpec>,
    /// Forward a remote port: [bind-host:]bind-port:target-host:target-port
    #[structopt(short = "R", long = "remote", number_of_values = 1)]
    pub remote: Vec<ForwardSpec>,
    /// Serve SOCKS5 locally, egressing through the slave: [bind-host:]bind-port
    #[structopt(long = "socks")]
    pub socks: Option<SocksSpec>,
}

#[derive(Debug, StructOpt)]
#[non_exhaustive]
pub struct Listen {
    /// Transport to bind, as proto://host:port (host * or empty = all interfaces)
    pub address: Address,
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(flatten)]
    pub features: FeatureOpts,
}

#[derive(Debug, StructOpt)]
#[non_exhaustive]
pub struct Connect {
    /// Transport to dial, as proto://host:port
    pub address: Address,
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(flatten)]
    pub features: FeatureOpts,
}

fn feature_rules(features: &FeatureOpts) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    if features.pty && features.exec.is_none() {
        errors.push(ConfigError::PtyWithoutExec);
    }
    if features.pty && cfg!(not(unix)) {
        errors.push(ConfigError::PtyUnsupported);
    }
    errors
}

fn into_configs(
    address: Address,
    common: CommonOpts,
    features: FeatureOpts,
) -> (SessionConfig, MasterConfig) {
    let session = SessionConfig::new(
        address,
        common.ssl,
        common.key.unwrap_or_default(),
        common.verbose,
        common.timeout,
    );
    let master = MasterConfig {
        exec: features.exec,
        pty: features.pty,
        log: features.log,
        local_forwards: features.local,
        remote_forwards: features.remote,
        socks: features.socks,
    };
    (session, master)
}

impl Listen {
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = common_rules(&self.common, false, &self.address.host);
        errors.extend(feature_rules(&self.features));
        errors
    }

    pub fn into_configs(self) -> (SessionConfig, MasterConfig) {
        into_configs(self.address, self.common, self.features)
    }
}

impl Connect {
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = common_rules(&self.common, true, &self.address.host);
        errors.extend(feature_rules(&self.features));
        errors
    }

    pub fn into_configs(self) -> (SessionConfig, MasterConfig) {
        into_configs(self.address, self.common, self.features)
    }
}
