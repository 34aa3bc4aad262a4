use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "snapfs", version, about = "Whole-file caching network file service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the authority with a server config file
    Serve {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print a remote file through the client cache
    Cat {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(value_name = "PATH")]
        path: String,
    },
    /// Store a local file at a remote path
    Put {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(value_name = "PATH")]
        path: String,
        #[arg(value_name = "SRC")]
        src: PathBuf,
    },
    /// Remove a remote file
    Rm {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(value_name = "PATH")]
        path: String,
    },
}
