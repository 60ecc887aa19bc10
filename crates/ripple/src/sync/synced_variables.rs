use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::resource::SyncedResource;
use super::value::{NamedVariable, SyncedValue, VariableValue};
use crate::net::{
    CloseReason, Connection, ConnectionManager, Guarantee, NetConfig, NetError, NetworkRole,
    Request, RequestKind, Response, ResponseKind, SentThing, ServerAllowKind,
};
use crate::task::{ScheduledJob, TaskRunner, repeat_every};

/// Observer for the client side of a full sync.
pub trait FullSyncProgress: Send + Sync {
    fn on_update_full_synchronization_state(&self, done: usize, expected: usize);

    /// A value with `allow_events` changed, locally on the host or by sync on a client.
    fn on_value_changed(&self, _variable: &NamedVariable) {}
}

#[derive(Default)]
struct SyncState {
    values: Vec<SyncedValue>,
    resources: Vec<Weak<dyn SyncedResource>>,
    sync_done: bool,
    sync_succeeded: bool,
    expected_count: usize,
    synced_names: Vec<String>,
}

impl SyncState {
    fn find(&self, name: &str) -> Option<&SyncedValue> {
        self.values.iter().find(|value| value.name() == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut SyncedValue> {
        self.values.iter_mut().find(|value| value.name() == name)
    }

    fn live_resources(&mut self) -> Vec<Arc<dyn SyncedResource>> {
        self.resources.retain(|resource| resource.strong_count() > 0);
        self.resources.iter().filter_map(Weak::upgrade).collect()
    }

    /// Counts `name` towards full sync progress once. Returns the progress to
    /// report when it moved.
    fn count_synced(&mut self, name: &str) -> Option<(usize, usize)> {
        if self.sync_done || self.synced_names.iter().any(|synced| synced == name) {
            return None;
        }
        self.synced_names.push(name.to_string());
        Some((self.synced_names.len(), self.expected_count))
    }
}

/// Named values and resources replicated from the host to every client.
pub struct SyncedVariables {
    role: NetworkRole,
    connections: Arc<ConnectionManager>,
    runner: TaskRunner,
    config: Arc<NetConfig>,
    progress: Option<Arc<dyn FullSyncProgress>>,
    state: Mutex<SyncState>,
    jobs: Mutex<Vec<ScheduledJob<()>>>,
}

impl SyncedVariables {
    pub fn new(
        role: NetworkRole,
        connections: Arc<ConnectionManager>,
        runner: TaskRunner,
        config: Arc<NetConfig>,
    ) -> Self {
        Self {
            role,
            connections,
            runner,
            config,
            progress: None,
            state: Mutex::new(SyncState::default()),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn FullSyncProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn role(&self) -> NetworkRole {
        self.role
    }

    pub fn add_new_variable(&self, value: SyncedValue) -> bool {
        {
            let mut state = self.lock();
            if state.find(value.name()).is_some() {
                log::warn!("Synced variable {} already exists", value.name());
                return false;
            }
            state.values.push(value.clone());
        }

        if self.role.is_host() && value.pass_to_clients {
            self.broadcast(ResponseKind::SyncValData(value.variable));
        }
        true
    }

    /// Sets a variable on the host and pushes it to clients if it changed.
    pub fn update_variable(&self, name: &str, value: impl Into<VariableValue>) -> Result<bool, NetError> {
        if !self.role.is_host() {
            return Err(NetError::NotHost);
        }

        let value = value.into();
        let (variable, pass_to_clients, allow_events) = {
            let mut state = self.lock();
            let synced = state
                .find_mut(name)
                .ok_or_else(|| NetError::UnknownVariable(name.to_string()))?;
            if synced.variable.value == value {
                return Ok(false);
            }
            synced.variable.value = value;
            (
                synced.variable.clone(),
                synced.pass_to_clients,
                synced.allow_events,
            )
        };

        log::debug!("Synced variable {} = {}", variable.name, variable.value);
        if allow_events {
            self.notify_value_changed(&variable);
        }
        if pass_to_clients {
            self.broadcast(ResponseKind::SyncValData(variable));
        }
        Ok(true)
    }

    pub fn value(&self, name: &str) -> Option<VariableValue> {
        self.lock().find(name).map(|value| value.variable.value.clone())
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.lock()
            .values
            .iter()
            .map(|value| value.name().to_string())
            .collect()
    }

    pub fn add_resource(&self, resource: &Arc<dyn SyncedResource>) {
        let mut state = self.lock();
        state.resources.retain(|existing| {
            existing
                .upgrade()
                .is_some_and(|existing| existing.name() != resource.name())
        });
        state.resources.push(Arc::downgrade(resource));
    }

    /// Pushes the current contents of resource `name` to all clients.
    pub fn notify_resource_updated(&self, name: &str) -> bool {
        if !self.role.is_host() {
            return false;
        }
        let Some(resource) = self.resource(name) else {
            log::warn!("Updated resource {} is not registered", name);
            return false;
        };

        self.broadcast(ResponseKind::SyncResourceData {
            name: name.to_string(),
            data: resource.serialize(),
        });
        true
    }

    fn resource(&self, name: &str) -> Option<Arc<dyn SyncedResource>> {
        self.lock()
            .live_resources()
            .into_iter()
            .find(|resource| resource.name() == name)
    }

    fn broadcast(&self, kind: ResponseKind) {
        self.connections
            .send_to_all(&Response::without_data(kind), Guarantee::Critical);
    }

    /// Everything a full sync sends, in order.
    fn full_sync_items(&self) -> Vec<Response> {
        let mut state = self.lock();
        let mut items: Vec<Response> = state
            .values
            .iter()
            .filter(|value| value.pass_to_clients)
            .map(|value| Response::without_data(ResponseKind::SyncValData(value.variable.clone())))
            .collect();

        items.extend(state.live_resources().into_iter().map(|resource| {
            Response::without_data(ResponseKind::SyncResourceData {
                name: resource.name().to_string(),
                data: resource.serialize(),
            })
        }));
        items
    }

    /// Host side of the sync requests. Returns false for requests it does not own.
    pub fn handle_sync_request(&self, request: &Request, conn: &Arc<Connection>) -> bool {
        if !self.role.is_host() {
            return false;
        }

        match &request.kind {
            RequestKind::GetAllSyncValues => {
                let items = self.full_sync_items();
                log::info!(
                    "Starting full sync of {} items to {}",
                    items.len(),
                    conn.addr()
                );

                let queued = request.respond(ResponseKind::ServerAllow {
                    allow: ServerAllowKind::RequestQueued,
                    detail: items.len().to_string(),
                });
                if let Err(e) = conn.send_response(&queued, Guarantee::Critical) {
                    log::warn!("Could not queue full sync for {}: {}", conn.addr(), e);
                    return true;
                }

                let conn = Arc::clone(conn);
                let config = Arc::clone(&self.config);
                let job = self.runner.spawn(async move {
                    run_full_sync(conn, items, config).await;
                });
                let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
                jobs.retain(|job| !job.is_finished());
                jobs.push(job);
                true
            }
            RequestKind::GetSingleSyncValue { name } => {
                let variable = self
                    .lock()
                    .find(name)
                    .filter(|value| value.pass_to_clients)
                    .map(|value| value.variable.clone());

                let kind = match variable {
                    Some(variable) => ResponseKind::SyncValData(variable),
                    None => {
                        log::warn!("{} asked for unknown variable {}", conn.addr(), name);
                        ResponseKind::None
                    }
                };
                if let Err(e) = conn.send_response(&request.respond(kind), Guarantee::Critical) {
                    log::warn!("Failed to answer {}: {}", conn.addr(), e);
                }
                true
            }
            _ => false,
        }
    }

    /// Client side of the sync responses. Returns false for responses it does not own.
    pub fn handle_response_only_sync(&self, response: &Response, conn: &Arc<Connection>) -> bool {
        let is_sync = matches!(
            response.kind,
            ResponseKind::SyncValData(_)
                | ResponseKind::SyncResourceData { .. }
                | ResponseKind::SyncDataEnd { .. }
        );
        if !is_sync {
            return false;
        }
        if self.role.is_host() {
            log::warn!(
                "Host received {} from {}, ignoring",
                response.kind.name(),
                conn.addr()
            );
            return true;
        }

        match &response.kind {
            ResponseKind::SyncValData(variable) => self.apply_remote_value(variable),
            ResponseKind::SyncResourceData { name, data } => self.apply_remote_resource(name, data),
            ResponseKind::SyncDataEnd { succeeded } => {
                let progress = {
                    let mut state = self.lock();
                    state.sync_done = true;
                    state.sync_succeeded = *succeeded;
                    (state.synced_names.len(), state.expected_count)
                };
                self.report_progress(progress);

                if *succeeded {
                    log::info!("Full sync from {} done", conn.addr());
                } else {
                    log::error!("Full sync from {} failed, disconnecting", conn.addr());
                    conn.close(CloseReason::Released);
                }
            }
            _ => {}
        }
        true
    }

    fn apply_remote_value(&self, variable: &NamedVariable) {
        let (changed, progress) = {
            let mut state = self.lock();
            let changed = match state.find_mut(&variable.name) {
                Some(existing) if existing.variable.value == variable.value => None,
                Some(existing) => {
                    existing.variable.value = variable.value.clone();
                    existing.allow_events.then(|| variable.clone())
                }
                None => {
                    state.values.push(SyncedValue::new(
                        variable.name.clone(),
                        variable.value.clone(),
                    ));
                    Some(variable.clone())
                }
            };
            (changed, state.count_synced(&variable.name))
        };

        if let Some(changed) = changed {
            log::debug!("Synced {} = {}", changed.name, changed.value);
            self.notify_value_changed(&changed);
        }
        if let Some(progress) = progress {
            self.report_progress(progress);
        }
    }

    fn apply_remote_resource(&self, name: &str, data: &[u8]) {
        match self.resource(name) {
            Some(resource) => {
                if let Err(e) = resource.update_from_bytes(data) {
                    log::warn!("{}", e);
                }
            }
            None => log::warn!("Received data for unknown resource {}", name),
        }

        let progress = self.lock().count_synced(name);
        if let Some(progress) = progress {
            self.report_progress(progress);
        }
    }

    fn report_progress(&self, (done, expected): (usize, usize)) {
        if let Some(progress) = &self.progress {
            progress.on_update_full_synchronization_state(done, expected);
        }
    }

    fn notify_value_changed(&self, variable: &NamedVariable) {
        if let Some(progress) = &self.progress {
            progress.on_value_changed(variable);
        }
    }

    /// Resets the client's bookkeeping before a new full sync.
    pub fn prepare_for_full_sync(&self) {
        let mut state = self.lock();
        state.sync_done = false;
        state.sync_succeeded = false;
        state.expected_count = 0;
        state.synced_names.clear();
    }

    /// Asks the host for everything. The returned request completes when the
    /// host queued the sync; `is_sync_done` flips once all data arrived.
    pub fn request_full_sync(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<Arc<SentThing>, NetError> {
        self.prepare_for_full_sync();
        let sent = conn.send_request(RequestKind::GetAllSyncValues, Guarantee::Critical)?;

        let this = Arc::clone(self);
        let queued = Arc::clone(&sent);
        let job = self.runner.spawn(async move {
            if !queued.finished().await {
                log::warn!("Full sync request was not answered");
                return;
            }
            match queued.response().map(|response| response.kind) {
                Some(ResponseKind::ServerAllow {
                    allow: ServerAllowKind::RequestQueued,
                    detail,
                }) => match detail.parse::<usize>() {
                    Ok(count) => this.set_expected_count(count),
                    Err(_) => log::warn!("Host sent invalid sync count {:?}", detail),
                },
                other => log::warn!("Unexpected answer to full sync request: {:?}", other),
            }
        });
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).push(job);
        Ok(sent)
    }

    pub fn set_expected_count(&self, count: usize) {
        let progress = {
            let mut state = self.lock();
            state.expected_count = count;
            (state.synced_names.len(), count)
        };
        self.report_progress(progress);
    }

    pub fn is_sync_done(&self) -> bool {
        self.lock().sync_done
    }

    pub fn sync_succeeded(&self) -> bool {
        let state = self.lock();
        state.sync_done && state.sync_succeeded
    }

    pub fn expected_count(&self) -> usize {
        self.lock().expected_count
    }

    pub fn received_count(&self) -> usize {
        self.lock().synced_names.len()
    }

    pub fn cancel_jobs(&self) {
        for job in self.jobs.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            job.cancel();
        }
    }
}

/// Pushes one item per tick, waits for all of them, then sends the end marker.
/// Returns whether every item was delivered.
async fn run_full_sync(conn: Arc<Connection>, items: Vec<Response>, config: Arc<NetConfig>) -> bool {
    let mut pending = items.into_iter();
    let mut sent = Vec::new();

    let pushed_all = repeat_every(config.full_sync_start_delay, config.full_sync_interval, || {
        let Some(item) = pending.next() else {
            return ControlFlow::Break(true);
        };
        match conn.send_response(&item, Guarantee::Critical) {
            Ok(thing) => {
                sent.push(thing);
                ControlFlow::Continue(())
            }
            Err(e) => {
                log::warn!("Full sync push to {} failed: {}", conn.addr(), e);
                ControlFlow::Break(false)
            }
        }
    })
    .await;

    let mut succeeded = pushed_all;
    for thing in &sent {
        succeeded &= thing.finished().await;
    }

    let end = Response::without_data(ResponseKind::SyncDataEnd { succeeded });
    match conn.send_response(&end, Guarantee::Critical) {
        Ok(_) => log::info!(
            "Full sync of {} items to {} finished (success: {})",
            sent.len(),
            conn.addr(),
            succeeded
        ),
        Err(e) => log::warn!("Could not finish full sync to {}: {}", conn.addr(), e),
    }
    succeeded
}
