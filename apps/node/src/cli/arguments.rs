use std::path::PathBuf;

use clap::Args;

/// Run the node.
#[derive(Args)]
pub struct Run {
    /// Path to the node configuration file.
    #[clap(long, short, default_value = "gold.toml")]
    pub config: PathBuf,
}
