use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;

use super::entity::{Entity, EntityKind};
use crate::net::{
    Connection, ConnectionManager, EntityState, Guarantee, NetworkRole, Response, ResponseKind,
};

/// Entities shared between host and clients. Network packets are queued and
/// only applied during `tick`, so systems never see the map change under them.
#[derive(Debug)]
pub struct GameWorld {
    role: NetworkRole,
    connections: Arc<ConnectionManager>,
    entities: HashMap<u32, Entity>,
    next_entity_id: u32,
    tick: u64,
    queued_creations: Vec<EntityState>,
    queued_updates: Vec<EntityState>,
    queued_destructions: Vec<u32>,
    delayed_delete_ids: Vec<u32>,
    clear_pending: bool,
}

impl GameWorld {
    pub fn new(role: NetworkRole, connections: Arc<ConnectionManager>) -> Self {
        Self {
            role,
            connections,
            entities: HashMap::new(),
            next_entity_id: 1,
            tick: 0,
            queued_creations: Vec::new(),
            queued_updates: Vec::new(),
            queued_destructions: Vec::new(),
            delayed_delete_ids: Vec::new(),
            clear_pending: false,
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Creates an entity. The host announces it to every connection.
    pub fn spawn(&mut self, kind: EntityKind) -> u32 {
        let id = self.next_entity_id;
        self.spawn_with_id(id, kind);

        if self.role.is_host() {
            if let Some(entity) = self.entities.get(&id) {
                let creation = Response::without_data(ResponseKind::EntityCreation(
                    entity.to_network_state(),
                ));
                self.connections.send_to_all(&creation, Guarantee::Critical);
            }
        }
        id
    }

    pub fn spawn_with_id(&mut self, id: u32, kind: EntityKind) {
        self.entities.insert(id, Entity::new(id, kind));
        if id >= self.next_entity_id {
            self.next_entity_id = id + 1;
        }
    }

    pub fn entity(&self, id: u32) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Mutable access marks the entity for the next update broadcast.
    pub fn entity_mut(&mut self, id: u32) -> Option<&mut Entity> {
        let entity = self.entities.get_mut(&id)?;
        entity.dirty = true;
        Some(entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Queues an inbound entity packet. Returns false for other responses.
    pub fn handle_entity_packet(&mut self, response: &Response) -> bool {
        match &response.kind {
            ResponseKind::EntityCreation(state) => self.queued_creations.push(*state),
            ResponseKind::EntityUpdate(state) => self.queued_updates.push(*state),
            ResponseKind::EntityDestruction { entity_id } => {
                self.queued_destructions.push(*entity_id)
            }
            _ => return false,
        }
        true
    }

    pub fn apply_queued_packets(&mut self) {
        for state in std::mem::take(&mut self.queued_creations) {
            match self.entities.get_mut(&state.entity_id) {
                Some(entity) => entity.apply_network_state(&state),
                None => {
                    self.entities
                        .insert(state.entity_id, Entity::from_network_state(&state));
                    if state.entity_id >= self.next_entity_id {
                        self.next_entity_id = state.entity_id + 1;
                    }
                }
            }
        }

        for state in std::mem::take(&mut self.queued_updates) {
            match self.entities.get_mut(&state.entity_id) {
                Some(entity) => entity.apply_network_state(&state),
                None => log::warn!("Update for unknown entity {}", state.entity_id),
            }
        }

        let destructions = std::mem::take(&mut self.queued_destructions);
        self.delayed_delete_ids.extend(destructions);
    }

    /// Advances the world by `dt` seconds.
    pub fn tick(&mut self, dt: f32) {
        self.flush_deletes();
        self.apply_queued_packets();

        // Stand-in for the movement system; the host owns the simulation.
        for entity in self.entities.values_mut() {
            if entity.velocity != Vec3::ZERO {
                entity.position += entity.velocity * dt;
                entity.dirty |= self.role.is_host();
            }
        }

        self.tick += 1;
    }

    fn flush_deletes(&mut self) {
        if self.clear_pending {
            self.clear_pending = false;
            self.delayed_delete_ids.clear();
            self.queued_updates.clear();
            log::debug!("Clearing {} entities", self.entities.len());
            self.entities.clear();
            return;
        }

        for id in std::mem::take(&mut self.delayed_delete_ids) {
            self.destroy_entity(id);
        }
    }

    /// Removes an entity now. The host tells every connection first.
    pub fn destroy_entity(&mut self, id: u32) -> bool {
        if self.role.is_host() && self.entities.contains_key(&id) {
            let destruction =
                Response::without_data(ResponseKind::EntityDestruction { entity_id: id });
            self.connections
                .send_to_all(&destruction, Guarantee::Critical);
        }
        self.entities.remove(&id).is_some()
    }

    /// Removes an entity at the start of the next tick.
    pub fn queue_destroy_entity(&mut self, id: u32) {
        if !self.delayed_delete_ids.contains(&id) {
            self.delayed_delete_ids.push(id);
        }
    }

    /// Drops every entity at the start of the next tick.
    pub fn mark_for_clear(&mut self) {
        self.clear_pending = true;
    }

    pub fn send_entity_to_connection(&self, id: u32, conn: &Connection) -> bool {
        let Some(entity) = self.entities.get(&id) else {
            return false;
        };

        let creation =
            Response::without_data(ResponseKind::EntityCreation(entity.to_network_state()));
        match conn.send_response(&creation, Guarantee::Critical) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Failed to send entity {} to {}: {}", id, conn.addr(), e);
                false
            }
        }
    }

    /// Sends every entity to a newly joined connection.
    pub fn send_all_entities_to_connection(&self, conn: &Connection) -> usize {
        self.entities
            .keys()
            .filter(|&&id| self.send_entity_to_connection(id, conn))
            .count()
    }

    /// Sends changed entities to all connections. Updates are superseded by
    /// the next one, so they go unreliable.
    pub fn broadcast_entity_updates(&mut self) -> usize {
        if !self.role.is_host() {
            return 0;
        }

        let mut sent = 0;
        for entity in self.entities.values_mut().filter(|entity| entity.dirty) {
            let update = Response::without_data(ResponseKind::EntityUpdate(entity.to_network_state()));
            self.connections.send_to_all(&update, Guarantee::None);
            entity.dirty = false;
            sent += 1;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::net::{MemoryNetwork, NetConfig};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn host_with_client(network: &MemoryNetwork) -> (GameWorld, Arc<Connection>) {
        let connections = Arc::new(ConnectionManager::new(4));
        network.socket(addr(2));
        let conn = Arc::new(Connection::new(
            addr(2),
            network.socket(addr(1)),
            Arc::new(NetConfig::default()),
        ));
        connections.insert(conn.clone()).unwrap();
        (GameWorld::new(NetworkRole::Host, connections), conn)
    }

    fn client_world() -> GameWorld {
        GameWorld::new(NetworkRole::Client, Arc::new(ConnectionManager::new(1)))
    }

    #[test]
    fn test_spawn_broadcasts_creation() {
        let network = MemoryNetwork::new();
        let (mut world, _conn) = host_with_client(&network);

        let a = world.spawn(EntityKind::Player);
        let b = world.spawn(EntityKind::Item);

        assert_eq!((a, b), (1, 2));
        assert_eq!(network.pending(addr(2)), 2);
    }

    #[test]
    fn test_queued_packets_apply_on_tick() {
        let mut world = client_world();
        let mut state = EntityState::new(7, EntityKind::Prop as u8);
        state.position = [1.0, 2.0, 3.0];

        assert!(world.handle_entity_packet(&Response::without_data(
            ResponseKind::EntityCreation(state)
        )));
        assert!(world.entity(7).is_none());

        world.tick(0.0);
        let entity = world.entity(7).unwrap();
        assert_eq!(entity.kind, EntityKind::Prop);
        assert_eq!(entity.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(world.spawn(EntityKind::Item), 8);
    }

    #[test]
    fn test_unknown_update_is_dropped() {
        let mut world = client_world();
        world.handle_entity_packet(&Response::without_data(ResponseKind::EntityUpdate(
            EntityState::new(99, 0),
        )));
        world.tick(0.0);
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn test_destruction_is_delayed_one_tick() {
        let mut world = client_world();
        world.spawn_with_id(3, EntityKind::Item);

        world.handle_entity_packet(&Response::without_data(ResponseKind::EntityDestruction {
            entity_id: 3,
        }));
        world.tick(0.0);
        assert!(world.entity(3).is_some());

        world.tick(0.0);
        assert!(world.entity(3).is_none());
    }

    #[test]
    fn test_non_entity_packets_rejected() {
        let mut world = client_world();
        assert!(!world.handle_entity_packet(&Response::without_data(ResponseKind::Echo)));
    }

    #[test]
    fn test_host_destroy_broadcasts() {
        let network = MemoryNetwork::new();
        let (mut world, _conn) = host_with_client(&network);
        let id = world.spawn(EntityKind::Projectile);

        world.queue_destroy_entity(id);
        world.queue_destroy_entity(id);
        assert!(world.entity(id).is_some());

        world.tick(0.016);
        assert!(world.entity(id).is_none());
        assert_eq!(network.pending(addr(2)), 2);
        assert!(!world.destroy_entity(id));
    }

    #[test]
    fn test_mark_for_clear_empties_world() {
        let mut world = client_world();
        world.spawn_with_id(1, EntityKind::Static);
        world.spawn_with_id(2, EntityKind::Static);

        world.mark_for_clear();
        assert_eq!(world.entity_count(), 2);
        world.tick(0.0);
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn test_tick_integrates_velocity_and_broadcasts_dirty() {
        let network = MemoryNetwork::new();
        let (mut world, conn) = host_with_client(&network);
        let id = world.spawn(EntityKind::Projectile);
        world.entity_mut(id).unwrap().velocity = Vec3::new(10.0, 0.0, 0.0);

        world.tick(0.5);
        assert_eq!(world.entity(id).unwrap().position, Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(world.tick_count(), 1);

        assert_eq!(world.broadcast_entity_updates(), 1);
        assert_eq!(world.broadcast_entity_updates(), 0);

        assert!(world.send_entity_to_connection(id, &conn));
        assert!(!world.send_entity_to_connection(999, &conn));
        assert_eq!(world.send_all_entities_to_connection(&conn), 1);
    }
}
