use std::sync::{Arc, Mutex};

use crate::net::{
    Connection, NetError, NetworkInterface, Request, Response, ResponseHandling,
    handle_default_request, handle_default_response_only,
};
use crate::sync::SyncedVariables;
use crate::world::GameWorld;

/// Routes packets to the synced variables and the world, falling back to
/// the default handling for everything else.
pub struct GameInterface {
    sync: Arc<SyncedVariables>,
    world: Arc<Mutex<GameWorld>>,
}

impl GameInterface {
    pub fn new(sync: Arc<SyncedVariables>, world: Arc<Mutex<GameWorld>>) -> Self {
        Self { sync, world }
    }

    pub fn sync(&self) -> &Arc<SyncedVariables> {
        &self.sync
    }

    pub fn world(&self) -> &Arc<Mutex<GameWorld>> {
        &self.world
    }
}

impl NetworkInterface for GameInterface {
    fn handle_request(&self, request: &Request, conn: &Arc<Connection>) -> Result<(), NetError> {
        if self.sync.handle_sync_request(request, conn) {
            return Ok(());
        }
        handle_default_request(request, conn)
    }

    fn handle_response_only(&self, response: &Response, conn: &Arc<Connection>) -> ResponseHandling {
        if self.sync.handle_response_only_sync(response, conn) {
            return ResponseHandling::Handled;
        }

        let queued = self
            .world
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle_entity_packet(response);
        if queued {
            return ResponseHandling::Handled;
        }

        handle_default_response_only(response, conn)
    }

    fn on_connection_closed(&self, conn: &Arc<Connection>) {
        log::info!("Connection to {} removed", conn.formatted_address());
    }
}
