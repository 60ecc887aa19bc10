mod entity;
mod game_world;

pub use entity::{Entity, EntityKind};
pub use game_world::GameWorld;
