//! XRd HA app binary.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use ha_app::config::{self, ConfigError, GlobalConfig};
use ha_app::engine::Engine;
use ha_aws::{AwsError, CloudClient, Ec2Client};
use ha_common::Ipv4Net;
use ha_telemetry::{TelemetryServer, TelemetryServerError};

/// Unexpected runtime failure; the supervisor should restart the app.
const EXIT_RUNTIME_FAILURE: i32 = 1;

/// Initialization failure; operator intervention is required.
const EXIT_INIT_FAILURE: i32 = 2;

/// Terminated by Ctrl+C.
const EXIT_INTERRUPTED: i32 = 130;

/// Error during the initialization flow.
#[derive(Debug, Error)]
enum InitError {
    #[error("error reading config: {0}")]
    Config(#[from] ConfigError),

    #[error("error validating config against AWS: {0}")]
    Aws(#[from] AwsError),

    #[error("error starting gRPC telemetry server: {0}")]
    Telemetry(#[from] TelemetryServerError),
}

/// Stand-in cloud client for a config with no registered actions. The
/// engine never invokes it because the action table is empty.
struct UnconfiguredCloud;

#[async_trait]
impl CloudClient for UnconfiguredCloud {
    fn indexed_eni(&self, _device_index: u32) -> Result<String, AwsError> {
        Err(AwsError::Permanent("no cloud client configured".to_string()))
    }

    async fn validate_route_table(&self, _route_table_id: &str) -> Result<(), AwsError> {
        Err(AwsError::Permanent("no cloud client configured".to_string()))
    }

    async fn validate_network_interface(&self, _eni_id: &str) -> Result<(), AwsError> {
        Err(AwsError::Permanent("no cloud client configured".to_string()))
    }

    async fn assign_vip(
        &self,
        _device_index: u32,
        _vip: Ipv4Addr,
        _precheck: bool,
    ) -> Result<(), AwsError> {
        Err(AwsError::Permanent("no cloud client configured".to_string()))
    }

    async fn update_route_table(
        &self,
        _route_table_id: &str,
        _destination: Ipv4Net,
        _target_network_interface: &str,
        _precheck: bool,
    ) -> Result<(), AwsError> {
        Err(AwsError::Permanent("no cloud client configured".to_string()))
    }
}

/// Perform the initialization flow: config, cloud client, resource
/// validation, session state, telemetry listener bind.
async fn initialise() -> Result<(GlobalConfig, Arc<Engine>, TelemetryServer), InitError> {
    let (global, actions) = config::load(config::DEFAULT_CONFIG_PATH)?;

    let engine = if actions.is_empty() {
        warn!("No registered actions found!");
        Arc::new(Engine::new(
            actions,
            Arc::new(UnconfiguredCloud),
            Duration::from_secs(global.consistency_check_interval_seconds),
        ))
    } else {
        let endpoint = global.aws.ec2_private_endpoint_url.clone().ok_or_else(|| {
            ConfigError::Invalid(
                "global.aws.ec2_private_endpoint_url is required when groups \
                 are configured"
                    .to_string(),
            )
        })?;
        info!(endpoint = %endpoint, "Using private EC2 endpoint URL");
        let cloud = Ec2Client::new(&endpoint).await?;
        info!(
            instance_id = %cloud.instance_id(),
            region = %cloud.region(),
            "Running on EC2 instance"
        );
        let engine = Arc::new(Engine::new(
            actions,
            Arc::new(cloud),
            Duration::from_secs(global.consistency_check_interval_seconds),
        ));
        engine.validate_resources().await?;
        engine
    };

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], global.port));
    let telemetry = TelemetryServer::bind(listen_addr, engine.clone()).await?;

    Ok((global, engine, telemetry))
}

/// Log panics from any task with their location, then exit so the
/// supervisor restarts the app with a clean slate.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        error!(panic = %panic_info, "Exiting on unexpected error");
        std::process::exit(EXIT_RUNTIME_FAILURE);
    }));
}

#[tokio::main]
async fn main() {
    // No CLI beyond version output; config comes from the fixed path.
    let mut args = std::env::args().skip(1);
    if let Some(arg) = args.next() {
        match arg.as_str() {
            "-v" | "--version" => {
                println!("{}", env!("CARGO_PKG_VERSION"));
                return;
            }
            other => {
                eprintln!("unsupported argument: {other:?}");
                std::process::exit(EXIT_INIT_FAILURE);
            }
        }
    }

    ha_common::logging::init();
    install_panic_hook();
    info!(version = env!("CARGO_PKG_VERSION"), "XRd HA app starting");

    let (_global, engine, telemetry) = match initialise().await {
        Ok(parts) => parts,
        Err(err) => {
            error!(error = %err, "Initialisation error");
            std::process::exit(EXIT_INIT_FAILURE);
        }
    };

    let telemetry_task = tokio::spawn(telemetry.serve());

    tokio::select! {
        // The consistency check loop only returns if the process is
        // exiting.
        _ = engine.run_consistency_checks() => {
            error!("Consistency check loop terminated unexpectedly");
            std::process::exit(EXIT_RUNTIME_FAILURE);
        }
        result = telemetry_task => {
            match result {
                Ok(Err(err)) => error!(error = %err, "Telemetry server failed"),
                Ok(Ok(())) => error!("Telemetry server terminated unexpectedly"),
                Err(err) => error!(error = %err, "Telemetry server task failed"),
            }
            std::process::exit(EXIT_RUNTIME_FAILURE);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Exiting on Ctrl+C");
            std::process::exit(EXIT_INTERRUPTED);
        }
    }
}
