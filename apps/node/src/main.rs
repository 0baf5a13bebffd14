use clap::Parser;
use eyre::Result;

use crate::cli::Cli;

mod cli;
pub(crate) mod config;

#[tokio::main]
async fn main() -> Result<()> {
    Cli::parse().exec().await
}
