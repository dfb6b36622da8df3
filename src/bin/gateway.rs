// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Standalone MQTT-SN gateway over UDP.

use clap::Parser;
use mqtt_sn::{gateway::Gateway, Config, Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "mqtt-sn-gateway", version)]
struct Args {
    /// Address to bind the UDP listener on.
    #[clap(long, default_value = "0.0.0.0:2442")]
    bind: SocketAddr,

    /// JSON config file; built-in defaults apply when absent.
    #[clap(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config: Config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|error| Error::FailedToParse(format!("config file: {error}")))?
        }
        None => Config::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.queue_processor_thread_count.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let gateway = Gateway::bind(config, args.bind).await?;
        gateway.run().await
    })
}
