use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ecm",
    about = "Inspect and maintain ECM blob providers",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Blob manager configuration (TOML)
    #[arg(short, long, global = true, default_value = "ecm.toml")]
    pub config: PathBuf,

    /// Repository whose default provider resolves unprefixed keys
    #[arg(long, global = true, default_value = "default")]
    pub repository: String,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate the configuration and list providers
    Check(CheckArgs),
    /// Show where a blob would be stored
    Route(RouteArgs),
    /// Store a file and print its managed key
    Put(PutArgs),
    /// Print the content stored under a key
    Cat(CatArgs),
    /// Sweep binaries not listed as live
    Gc(GcArgs),
}

#[derive(Args)]
pub struct CheckArgs {}

#[derive(Args)]
pub struct RouteArgs {
    #[arg(long)]
    pub mime: Option<String>,
    /// File name of the blob
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long, default_value = "File")]
    pub doc_type: String,
    /// Route as a record document
    #[arg(long)]
    pub record: bool,
    #[arg(long, default_value = ecm_blob::MAIN_BLOB_XPATH)]
    pub xpath: String,
}

#[derive(Args)]
pub struct PutArgs {
    pub file: PathBuf,
    #[arg(long)]
    pub mime: Option<String>,
    /// Owning document id; a new one is generated when omitted
    #[arg(long)]
    pub doc: Option<String>,
    #[arg(long)]
    pub record: bool,
}

#[derive(Args)]
pub struct CatArgs {
    pub key: String,
}

#[derive(Args)]
pub struct GcArgs {
    /// File listing one live key per line
    #[arg(long)]
    pub live: Option<PathBuf>,
    /// Delete unreferenced binaries instead of only counting them
    #[arg(long)]
    pub delete: bool,
}
