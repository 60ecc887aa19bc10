use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use glam::Vec3;
use ripple::{
    ConnectionManager, EntityKind, GameInterface, GameWorld, NetError, NetworkHandler,
    NetworkRole, SyncedValue, SyncedVariables, TaskRunner, UdpEndpoint,
};

use crate::config::ServerConfig;

pub struct GameServer {
    handler: NetworkHandler,
    sync: Arc<SyncedVariables>,
    world: Arc<Mutex<GameWorld>>,
    config: ServerConfig,
    known_clients: HashSet<SocketAddr>,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    last_score_time: Instant,
    score: i32,
    running: Arc<AtomicBool>,
}

impl GameServer {
    pub fn new(bind_addr: &str, config: ServerConfig, runner: TaskRunner) -> Result<Self, NetError> {
        let socket = UdpEndpoint::bind(bind_addr)?;
        if let Some(simulation) = &config.packet_loss {
            log::warn!("Simulating {}% packet loss", simulation.loss_percent);
            socket.set_loss_simulation(simulation.clone());
        }

        let net = Arc::new(config.net.clone());
        let connections = Arc::new(ConnectionManager::new(config.max_clients));
        let sync = Arc::new(SyncedVariables::new(
            NetworkRole::Host,
            connections.clone(),
            runner,
            net.clone(),
        ));
        sync.add_new_variable(SyncedValue::new("score", 0));
        sync.add_new_variable(SyncedValue::new("map", "arena"));
        sync.add_new_variable(SyncedValue::new("tick_rate", config.tick_rate as i32));
        sync.add_new_variable(SyncedValue::new("rcon_token", "changeme").host_only());

        let world = Arc::new(Mutex::new(GameWorld::new(
            NetworkRole::Host,
            connections.clone(),
        )));
        {
            let mut world = world.lock().unwrap_or_else(|e| e.into_inner());
            for i in 0..config.demo_entities {
                let id = world.spawn(EntityKind::Prop);
                if let Some(entity) = world.entity_mut(id) {
                    let angle = i as f32 * std::f32::consts::TAU / config.demo_entities as f32;
                    entity.position = Vec3::new(angle.cos(), 0.0, angle.sin()) * 10.0;
                    entity.velocity = Vec3::new(-angle.sin(), 0.0, angle.cos());
                }
            }
        }

        let interface = Arc::new(GameInterface::new(sync.clone(), world.clone()));
        let handler = NetworkHandler::new(
            NetworkRole::Host,
            Arc::new(socket),
            connections,
            interface,
            net,
        );

        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64);
        Ok(Self {
            handler,
            sync,
            world,
            config,
            known_clients: HashSet::new(),
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            last_score_time: Instant::now(),
            score: 0,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handler.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn world(&self) -> MutexGuard<'_, GameWorld> {
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        if let Err(e) = self.handler.update() {
            log::error!("Network error: {}", e);
        }
        self.greet_new_clients();

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }

        if now.duration_since(self.last_score_time) >= self.config.score_interval {
            self.last_score_time = now;
            self.bump_score();
        }
    }

    fn tick(&mut self) {
        let dt = self.tick_duration.as_secs_f32();
        let mut world = self.world();
        world.tick(dt);
        world.broadcast_entity_updates();
    }

    /// New clients get every entity once; values come through their own full sync.
    fn greet_new_clients(&mut self) {
        let connections = self.handler.connections().connections();
        let current: HashSet<SocketAddr> = connections.iter().map(|conn| conn.addr()).collect();

        for conn in connections
            .iter()
            .filter(|conn| !self.known_clients.contains(&conn.addr()))
        {
            let sent = self.world().send_all_entities_to_connection(conn);
            log::info!(
                "Client {} joined ({} clients), sent {} entities",
                conn.formatted_address(),
                current.len(),
                sent
            );
        }
        for gone in self.known_clients.difference(&current) {
            log::info!("Client {} left", gone);
        }
        self.known_clients = current;
    }

    fn bump_score(&mut self) {
        self.score += 1;
        match self.sync.update_variable("score", self.score) {
            Ok(true) => log::info!("Score is now {}", self.score),
            Ok(false) => {}
            Err(e) => log::error!("Failed to update score: {}", e),
        }
    }

    pub fn shutdown(&mut self) {
        self.sync.cancel_jobs();
        self.handler.shutdown();
    }
}
