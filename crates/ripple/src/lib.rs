pub mod game_interface;
pub mod net;
pub mod sync;
pub mod task;
pub mod world;

pub use game_interface::GameInterface;
pub use net::{
    Connection, ConnectionManager, ConnectionState, DEFAULT_PORT, DatagramSocket, EntityState,
    Guarantee, MemoryNetwork, NetConfig, NetError, NetworkHandler, NetworkInterface, NetworkRole,
    NetworkStats, PacketError, PacketLossSimulation, Request, RequestKind, Response, ResponseKind,
    SentThing, UdpEndpoint,
};
pub use sync::{FullSyncProgress, NamedVariable, SyncedResource, SyncedValue, SyncedVariables, VariableValue};
pub use task::{ScheduledJob, TaskRunner};
pub use world::{Entity, EntityKind, GameWorld};
