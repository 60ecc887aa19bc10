use glam::{Quat, Vec3};

use crate::net::EntityState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EntityKind {
    #[default]
    Player = 0,
    Projectile = 1,
    Item = 2,
    Static = 3,
    Prop = 4,
}

impl From<u8> for EntityKind {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Player,
            1 => Self::Projectile,
            2 => Self::Item,
            4 => Self::Prop,
            _ => Self::Static,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: u32,
    pub kind: EntityKind,
    pub position: Vec3,
    pub velocity: Vec3,
    pub orientation: Quat,
    pub flags: u16,
    /// Changed since the last update broadcast.
    pub dirty: bool,
}

impl Entity {
    pub fn new(id: u32, kind: EntityKind) -> Self {
        Self {
            id,
            kind,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            flags: 0,
            dirty: true,
        }
    }

    pub fn to_network_state(&self) -> EntityState {
        let mut state = EntityState::new(self.id, self.kind as u8);
        state.position = self.position.into();
        state.encode_velocity(self.velocity.into());
        state.encode_orientation(self.orientation.to_array());
        state.flags = self.flags;
        state
    }

    pub fn from_network_state(state: &EntityState) -> Self {
        let mut entity = Self::new(state.entity_id, EntityKind::from(state.kind));
        entity.apply_network_state(state);
        entity
    }

    pub fn apply_network_state(&mut self, state: &EntityState) {
        let quat = state.decode_orientation();
        self.kind = EntityKind::from(state.kind);
        self.position = Vec3::from(state.position);
        self.velocity = Vec3::from(state.decode_velocity());
        self.orientation = Quat::from_array(quat).normalize();
        self.flags = state.flags;
        self.dirty = false;
    }
}
