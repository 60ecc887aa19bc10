mod client;
mod config;
mod server;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use client::GameClient;
use config::{ClientConfig, ServerConfig};
use ripple::{PacketLossSimulation, TaskRunner};
use server::GameServer;

#[derive(Parser)]
#[command(name = "ripple-host")]
#[command(about = "Headless host and test client for the ripple transport")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    #[arg(long, default_value_t = 0.0, global = true, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,
}

#[derive(Subcommand)]
enum Mode {
    /// Run an authoritative host
    Host {
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(short, long, default_value_t = ripple::DEFAULT_PORT)]
        port: u16,

        #[arg(short, long, default_value_t = 60)]
        tick_rate: u32,

        #[arg(short, long, default_value_t = 32)]
        max_clients: usize,

        #[arg(long, default_value_t = 4)]
        entities: usize,
    },
    /// Connect to a host, sync and measure ping
    Join {
        /// host or host:port
        address: String,

        #[arg(long, default_value_t = 10)]
        ping_packets: u32,

        #[arg(long, help = "Disconnect after this many seconds")]
        stay: Option<u64>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let packet_loss =
        (args.loss_percent > 0.0).then(|| PacketLossSimulation::new(args.loss_percent));

    let runtime = tokio::runtime::Runtime::new()?;
    let runner = TaskRunner::new(runtime.handle().clone());

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupted");
                running.store(false, Ordering::SeqCst);
            }
        });
    }

    match args.mode {
        Mode::Host {
            bind,
            port,
            tick_rate,
            max_clients,
            entities,
        } => {
            let config = ServerConfig {
                tick_rate,
                max_clients,
                demo_entities: entities,
                packet_loss,
                ..Default::default()
            };
            let mut server = GameServer::new(&format!("{}:{}", bind, port), config, runner)?;
            log::info!("Server started on {}", server.local_addr());

            let server_running = server.running();
            let stop = running.clone();
            runtime.spawn(async move {
                while stop.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                server_running.store(false, Ordering::SeqCst);
            });

            server.run();
            log::info!("Server shutting down");
        }
        Mode::Join {
            address,
            ping_packets,
            stay,
        } => {
            let config = ClientConfig {
                ping_packets,
                stay_for: stay.map(Duration::from_secs),
                packet_loss,
                ..Default::default()
            };
            let mut client = GameClient::connect(&address, config, runner)?;
            client.run(runtime.handle(), running)?;
        }
    }

    Ok(())
}
