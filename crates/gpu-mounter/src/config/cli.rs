use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::worker::ListDevicesArgs;
use crate::config::worker::WorkerArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node-local GPU mount worker
    Worker(Box<WorkerArgs>),
    /// Print the GPU inventory of this node as JSON
    #[command(name = "list-devices")]
    ListDevices(ListDevicesArgs),
}
