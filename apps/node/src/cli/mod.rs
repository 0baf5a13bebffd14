mod actions;
mod arguments;
mod node;

use clap::Parser;

/// The `goldd` command line.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub enum Cli {
    /// Run the node, see `run --help` for more information.
    Run(arguments::Run),
}

impl Cli {
    pub async fn exec(self) -> eyre::Result<()> {
        match self {
            Self::Run(args) => actions::run(args).await,
        }
    }
}
