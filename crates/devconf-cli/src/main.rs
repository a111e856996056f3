// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use devconf_cli::Workspace;
use devconf_core::Settings;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_writer(std::io::stderr).with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_writer(std::io::stderr).with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = "devconf")]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Render device configurations from templates")]
struct Args {
    /// Path to the inventory file
    #[arg(short, long, default_value = "devconf.toml")]
    inventory: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the rendered document of a configuration
    Render {
        /// Device name of the configuration
        name: String,
    },
    /// Print the context variables of a configuration
    Context {
        /// Device name of the configuration
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    info!(inventory = %args.inventory.display(), "starting devconf");

    let settings = Settings::from_env()?;
    let workspace = Workspace::load(&args.inventory, settings).await?;

    let output = match &args.command {
        Command::Render { name } => workspace.render(name)?,
        Command::Context { name } => serde_json::to_value(workspace.context(name)?)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
