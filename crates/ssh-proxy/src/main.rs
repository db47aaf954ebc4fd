/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */
use std::net::AddrParseError;
use std::path::PathBuf;

use clap::Parser;
use ssh_proxy::config::{Config, ConfigError};
use ssh_proxy::shutdown_handle::ShutdownHandle;
use tracing::metadata::LevelFilter;

#[tokio::main(flavor = "multi_thread")]
pub async fn main() {
    let cli = Cli::parse();
    setup_logging(&cli);

    if let Err(error) = run(cli).await {
        // The validation tags (e.g. "hostKey is required") must reach the
        // operator verbatim.
        eprintln!("{error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run(run_command) => {
            let config: Config = (*run_command).try_into()?;
            let spawn_handle = ssh_proxy::spawn(config).await?;
            // Let the service run forever by awaiting the join handle, while
            // holding onto the shutdown handle.
            let (_shutdown_tx, join_handle) = spawn_handle.into_parts();
            join_handle.await.expect("ssh-proxy task panicked");
        }
        Command::DefaultRunConfig => {
            print!("{}", Config::default().into_annotated_config_file())
        }
    }

    Ok(())
}

#[derive(clap::Parser, Debug)]
struct Cli {
    #[clap(long, short, help = "Turn on debug logging (same as RUST_LOG=debug)")]
    debug: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Parser, Debug)]
enum Command {
    Run(Box<RunCommand>),
    #[clap(about = "Output a default TOML config file for use with run -c")]
    DefaultRunConfig,
}

#[derive(clap::Parser, Debug)]
struct RunCommand {
    #[clap(long, short, help = "Path to TOML configuration file")]
    config: Option<PathBuf>,
    #[clap(
        long,
        short,
        help = "Address to listen on for SSH connections, overriding configuration file"
    )]
    address: Option<String>,
    #[clap(
        long,
        short,
        help = "Address to listen on for prometheus metrics requests (HTTP), overriding configuration file"
    )]
    metrics_address: Option<String>,
    #[clap(long, short, help = "Base URL of the cluster-state (BBS) API")]
    bbs_address: Option<String>,
    #[clap(long, short = 'k', help = "Path to the PEM-encoded SSH host key")]
    host_key: Option<PathBuf>,
    #[clap(
        long,
        env = "DIEGO_CREDENTIALS",
        help = "Shared credential for the diego realm. Defaults to the DIEGO_CREDENTIALS environment variable"
    )]
    diego_credentials: Option<String>,
    #[clap(long, action, help = "Disable the diego authentication realm")]
    disable_diego_auth: bool,
    #[clap(long, action, help = "Enable the cf authentication realm")]
    enable_cf_auth: bool,
    #[clap(long, help = "Cloud Controller base URL (cf realm)")]
    cc_api_url: Option<String>,
    #[clap(long, help = "UAA token endpoint (cf realm)")]
    uaa_token_url: Option<String>,
    #[clap(long, help = "UAA client id (cf realm)")]
    uaa_client_id: Option<String>,
    #[clap(
        long,
        env = "UAA_CLIENT_SECRET",
        help = "UAA client secret. Defaults to the UAA_CLIENT_SECRET environment variable"
    )]
    uaa_client_secret: Option<String>,
    #[clap(
        long,
        action,
        help = "Skip TLS verification for the UAA and CC endpoints only"
    )]
    skip_cert_verify: bool,
}

impl TryInto<Config> for RunCommand {
    type Error = CliError;

    // Load the config file, or the default, allowing CLI flags to override
    // the corresponding settings.
    fn try_into(self) -> Result<Config, Self::Error> {
        let mut config = if let Some(config_path) = self.config {
            Config::load(&config_path)?
        } else {
            Config::default()
        };

        if let Some(address) = self.address {
            config.listen_address =
                address
                    .parse()
                    .map_err(|error| CliError::InvalidListeningAddress {
                        addr: address,
                        error,
                    })?;
        }
        if let Some(metrics_address) = self.metrics_address {
            config.metrics_address =
                metrics_address
                    .parse()
                    .map_err(|error| CliError::InvalidMetricsAddress {
                        addr: metrics_address,
                        error,
                    })?;
        }
        if let Some(bbs_address) = self.bbs_address {
            config.bbs_address = Some(bbs_address);
        }
        if let Some(host_key_path) = self.host_key {
            let pem = std::fs::read_to_string(&host_key_path).map_err(|error| {
                CliError::ReadingHostKey {
                    path: host_key_path.to_string_lossy().to_string(),
                    error,
                }
            })?;
            config.host_key = Some(pem);
        }
        if let Some(diego_credentials) = self.diego_credentials {
            config.diego_credentials = diego_credentials;
        }
        if self.disable_diego_auth {
            config.enable_diego_auth = false;
        }
        if self.enable_cf_auth {
            config.enable_cf_auth = true;
        }
        if let Some(cc_api_url) = self.cc_api_url {
            config.cc_api_url = Some(cc_api_url);
        }
        if let Some(uaa_token_url) = self.uaa_token_url {
            config.uaa_token_url = Some(uaa_token_url);
        }
        if let Some(uaa_client_id) = self.uaa_client_id {
            config.uaa_client_id = Some(uaa_client_id);
        }
        if let Some(uaa_client_secret) = self.uaa_client_secret {
            config.uaa_client_secret = Some(uaa_client_secret);
        }
        if self.skip_cert_verify {
            config.skip_cert_verify = true;
        }

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Invalid listening address {addr}: {error}")]
    InvalidListeningAddress { addr: String, error: AddrParseError },
    #[error("Invalid metrics address {addr}: {error}")]
    InvalidMetricsAddress { addr: String, error: AddrParseError },
    #[error("Could not read host key at {path}: {error}")]
    ReadingHostKey { path: String, error: std::io::Error },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

fn setup_logging(cli: &Cli) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = if cli.debug {
        Some(LevelFilter::DEBUG)
    } else {
        None
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::Layer::default().compact())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.map(Into::into).unwrap_or(LevelFilter::INFO.into()))
                .from_env_lossy(),
        )
        .try_init()
    {
        panic!(
            "Failed to initialize trace logging for ssh-proxy. It's possible some earlier \
            code path has already set a global default log subscriber: {e}"
        );
    }
}
