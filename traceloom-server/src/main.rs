// Copyright 2025 Traceloom Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use traceloom_server::config::ServerConfig;

#[derive(Parser)]
#[command(name = "traceloom-server", about = "LLM observability backend")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "TRACELOOM_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(long, env = "TRACELOOM_HTTP_ADDR")]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config)?;
    if let Some(addr) = cli.listen_addr {
        config.server.listen_addr = addr;
    }
    traceloom_server::run_server(config).await
}
