use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use ripple::net::parse_address;
use ripple::{
    Connection, ConnectionManager, DEFAULT_PORT, FullSyncProgress, GameInterface, GameWorld,
    NamedVariable, NetworkHandler, NetworkRole, SyncedVariables, TaskRunner, UdpEndpoint,
};
use tokio::runtime::Handle;

use crate::config::ClientConfig;

struct ProgressLog;

impl FullSyncProgress for ProgressLog {
    fn on_update_full_synchronization_state(&self, done: usize, expected: usize) {
        log::info!("Synchronized {}/{} values", done, expected);
    }

    fn on_value_changed(&self, variable: &NamedVariable) {
        log::info!("{} = {}", variable.name, variable.value);
    }
}

pub struct GameClient {
    handler: NetworkHandler,
    sync: Arc<SyncedVariables>,
    world: Arc<Mutex<GameWorld>>,
    conn: Arc<Connection>,
    runner: TaskRunner,
    config: ClientConfig,
}

impl GameClient {
    pub fn connect(server: &str, config: ClientConfig, runner: TaskRunner) -> Result<Self> {
        let server_addr = parse_address(server, DEFAULT_PORT)
            .with_context(|| format!("Invalid server address {}", server))?;

        let socket = UdpEndpoint::bind("0.0.0.0:0")?;
        if let Some(simulation) = &config.packet_loss {
            socket.set_loss_simulation(simulation.clone());
        }

        let net = Arc::new(config.net.clone());
        let connections = Arc::new(ConnectionManager::new(1));
        let sync = Arc::new(
            SyncedVariables::new(
                NetworkRole::Client,
                connections.clone(),
                runner.clone(),
                net.clone(),
            )
            .with_progress(Arc::new(ProgressLog)),
        );
        let world = Arc::new(Mutex::new(GameWorld::new(
            NetworkRole::Client,
            connections.clone(),
        )));
        let interface = Arc::new(GameInterface::new(sync.clone(), world.clone()));
        let handler = NetworkHandler::new(
            NetworkRole::Client,
            Arc::new(socket),
            connections,
            interface,
            net,
        );

        let conn = handler.open_connection(server_addr)?;
        if conn.is_target_host_localhost() {
            log::debug!("Connecting to a local host");
        }

        Ok(Self {
            handler,
            sync,
            world,
            conn,
            runner,
            config,
        })
    }

    fn pump_until(&self, timeout: Duration, done: impl Fn(&Self) -> bool) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !done(self) {
            if !self.conn.is_open() {
                bail!("Connection to {} closed", self.conn.formatted_address());
            }
            if Instant::now() > deadline {
                bail!("Timed out after {:?}", timeout);
            }
            self.handler.update()?;
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    pub fn run(&mut self, runtime: &Handle, running: Arc<AtomicBool>) -> Result<()> {
        log::info!("Requesting full sync from {}", self.conn.formatted_address());
        self.sync.request_full_sync(&self.conn)?;
        self.pump_until(self.config.sync_timeout, |client| client.sync.is_sync_done())?;
        if !self.sync.sync_succeeded() {
            bail!("Full sync failed");
        }
        for name in self.sync.variable_names() {
            if let Some(value) = self.sync.value(&name) {
                log::info!("  {} = {}", name, value);
            }
        }

        let job = self.conn.calculate_network_ping(
            &self.runner,
            self.config.ping_packets,
            self.config.ping_allowed_fails,
        )?;
        self.pump_until(self.config.sync_timeout, |_| job.is_finished())?;
        match runtime.block_on(job.join()) {
            Some(Ok(ping)) => log::info!("Ping {} ms ({} lost)", ping.ping_ms, ping.fails),
            Some(Err(e)) => log::warn!("{}", e),
            None => log::warn!("Ping was cancelled"),
        }

        let started = Instant::now();
        let mut last_frame = started;
        let mut last_report = started;
        while running.load(Ordering::SeqCst) && self.conn.is_open() {
            if self
                .config
                .stay_for
                .is_some_and(|stay_for| started.elapsed() >= stay_for)
            {
                break;
            }

            self.handler.update()?;
            let mut world = self.world.lock().unwrap_or_else(|e| e.into_inner());
            world.tick(last_frame.elapsed().as_secs_f32());
            last_frame = Instant::now();

            if last_report.elapsed() >= Duration::from_secs(2) {
                last_report = Instant::now();
                let stats = self.conn.stats();
                log::info!(
                    "{} entities, {} packets in, {} out, {} resent",
                    world.entity_count(),
                    stats.packets_received,
                    stats.packets_sent,
                    stats.packets_resent
                );
            }
            drop(world);
            std::thread::sleep(Duration::from_millis(5));
        }

        self.sync.cancel_jobs();
        self.handler.shutdown();
        Ok(())
    }
}
