use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use api_types::DeviceInfo;
use api_types::InventoryResponse;
use clap::Parser;
use gpu_mounter::app::builder::KUBELET_CONNECT_TIMEOUT;
use gpu_mounter::app::ApplicationBuilder;
use gpu_mounter::config::Cli;
use gpu_mounter::config::Commands;
use gpu_mounter::config::ListDevicesArgs;
use gpu_mounter::config::MounterConfig;
use gpu_mounter::config::WorkerArgs;
use gpu_mounter::device::Device;
use gpu_mounter::inventory::DeviceInventory;
use gpu_mounter::logging;
use gpu_mounter::platform::nvml::NvmlTelemetry;
use gpu_mounter::platform::pod_resources::KubeletResourceLister;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker(worker_args) => run_worker(*worker_args).await,
        Commands::ListDevices(list_args) => run_list_devices(list_args).await,
    }
}

async fn run_worker(worker_args: WorkerArgs) -> Result<()> {
    let _guard = logging::init(&worker_args.log_file)?;

    tracing::info!("Starting GPU mounter worker {}", &**version::VERSION);

    let app = ApplicationBuilder::new(worker_args).build().await?;

    app.run().await
}

async fn run_list_devices(list_args: ListDevicesArgs) -> Result<()> {
    utils::logging::init();

    let config = MounterConfig::from(&list_args);
    let lister = Arc::new(KubeletResourceLister::new(
        list_args.kubelet_socket_path.clone(),
        KUBELET_CONNECT_TIMEOUT,
    ));
    let inventory = DeviceInventory::new(&NvmlTelemetry::new(), lister, &config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize GPU inventory: {e:?}"))?;

    let snapshot: BTreeMap<String, Device> = tokio::time::timeout(
        Duration::from_secs(30),
        inventory.refresh(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Listing pod resources timed out"))?
    .map_err(|e| anyhow::anyhow!("Failed to list GPU devices: {e:?}"))?;

    let mut devices: Vec<&Device> = snapshot.values().collect();
    devices.sort_by_key(|device| device.minor_number);
    let response = InventoryResponse {
        success: true,
        message: format!("{} GPU(s) on node", devices.len()),
        devices: devices.into_iter().map(DeviceInfo::from).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
