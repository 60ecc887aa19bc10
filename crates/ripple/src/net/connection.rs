use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::ack_field::{AckField, ReceivedPacketField, ReceivedState, SentAcks};
use super::config::NetConfig;
use super::error::NetError;
use super::interface::{NetworkInterface, ResponseHandling};
use super::ping::{self, PingFailure, PingResult};
use super::protocol::{
    Guarantee, MAX_HEADER_SIZE, MAX_PACKET_SIZE, PacketError, Payload, RequestKind, Response,
    ResponseKind, decode_payload, encode_packet, read_request_flag, read_sequence,
};
use super::sent::SentThing;
use super::socket::DatagramSocket;
use super::stats::NetworkStats;
use crate::task::{ScheduledJob, TaskRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NothingReceived,
    Initial,
    Closed,
}

/// While set, only the matching handshake request is accepted; anything else
/// closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionMode {
    None,
    ReceiveRemoteConsole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Released,
    RemoteClosed,
    TimedOut,
    CriticalFailure,
    RestrictionViolated,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Open,
    TimedOut,
    CriticalFailure,
    Closed,
}

struct ConnectionInner {
    state: ConnectionState,
    restriction: RestrictionMode,
    last_used_id: u32,
    last_confirmed_sent: u32,
    last_sent_at: Instant,
    last_received_at: Instant,
    waiting: Vec<Arc<SentThing>>,
    received: ReceivedPacketField,
    sent_acks: Vec<SentAcks>,
    recent: VecDeque<u32>,
    front_acks: bool,
    stats: NetworkStats,
}

impl ConnectionInner {
    fn new(now: Instant) -> Self {
        Self {
            state: ConnectionState::NothingReceived,
            restriction: RestrictionMode::None,
            last_used_id: 0,
            last_confirmed_sent: 0,
            last_sent_at: now,
            last_received_at: now,
            waiting: Vec::new(),
            received: ReceivedPacketField::new(),
            sent_acks: Vec::new(),
            recent: VecDeque::new(),
            front_acks: true,
            stats: NetworkStats::default(),
        }
    }

    /// Picks the ack window for the next header. Alternates between the
    /// oldest pending entries and the newest ones.
    fn select_acks(&mut self, ack_count: u8) -> AckField {
        let (Some(&oldest), Some(&newest)) =
            (self.received.keys().next(), self.received.keys().next_back())
        else {
            return AckField::empty();
        };

        if ack_count == 0 {
            return AckField::empty();
        }
        let ack_count = ack_count as u32;
        let front = self.front_acks;
        self.front_acks = !front;

        let acks = if front {
            AckField::build(oldest, ack_count * 2, &self.received)
        } else {
            let width = if self.received.len() > ack_count as usize {
                ack_count * 2
            } else {
                ack_count
            };
            let first = newest.saturating_sub(width - 1).max(oldest);
            AckField::build(first, width, &self.received)
        };

        for id in acks.received_ids() {
            if let Some(state) = self.received.get_mut(&id) {
                *state = ReceivedState::AckSent;
            }
        }
        acks
    }

    fn has_unflushed_acks(&self) -> bool {
        self.received
            .values()
            .any(|state| *state == ReceivedState::Received)
    }

    /// Marks our packet `id` as received by the remote. Finalized things are
    /// pushed to `done`; the caller finalizes them after unlocking.
    fn apply_remote_ack(&mut self, id: u32, done: &mut Vec<Arc<SentThing>>, now: Instant) {
        if id > self.last_used_id {
            log::warn!("Remote acked packet {} which was never sent", id);
            return;
        }
        self.last_confirmed_sent = self.last_confirmed_sent.max(id);

        match self.waiting.iter().position(|s| s.packet_number() == id) {
            // Requests finish with their response, the ack only stops resends.
            Some(pos) if self.waiting[pos].is_request() => self.waiting[pos].mark_delivered(now),
            Some(pos) => done.push(self.waiting.remove(pos)),
            None => {}
        }

        self.confirm_ack_carrier(id);
    }

    /// Our packet `id` reached the remote, so the acks it carried did too.
    fn confirm_ack_carrier(&mut self, id: u32) {
        let received = &mut self.received;
        self.sent_acks.retain(|sent_acks| {
            if sent_acks.packet_number != id {
                return true;
            }
            for acked in sent_acks.acks.received_ids() {
                received.remove(&acked);
            }
            false
        });
    }

    fn fail_packet_acks(&mut self, packet_number: u32) {
        self.sent_acks
            .retain(|sent_acks| sent_acks.packet_number != packet_number);
    }

    fn remember(&mut self, sequence: u32, history: usize) -> bool {
        if self.recent.contains(&sequence) {
            return false;
        }
        self.recent.push_back(sequence);
        while self.recent.len() > history {
            self.recent.pop_front();
        }
        true
    }
}

/// One peer of the reliable transport. All mutable state sits behind a single
/// mutex which is never held while calling into a `NetworkInterface`.
pub struct Connection {
    addr: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    config: Arc<NetConfig>,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub fn new(addr: SocketAddr, socket: Arc<dyn DatagramSocket>, config: Arc<NetConfig>) -> Self {
        Self {
            addr,
            socket,
            config,
            inner: Mutex::new(ConnectionInner::new(Instant::now())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    pub fn stats(&self) -> NetworkStats {
        self.lock().stats.clone()
    }

    pub fn restriction_mode(&self) -> RestrictionMode {
        self.lock().restriction
    }

    pub fn set_restriction_mode(&self, mode: RestrictionMode) {
        self.lock().restriction = mode;
    }

    pub fn last_confirmed_sent(&self) -> u32 {
        self.lock().last_confirmed_sent
    }

    pub fn last_used_id(&self) -> u32 {
        self.lock().last_used_id
    }

    /// Tracked packets still waiting for an ack or response.
    pub fn pending_count(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Remote packets whose ack has not been confirmed yet.
    pub fn unconfirmed_ack_count(&self) -> usize {
        self.lock().received.len()
    }

    pub fn is_target_host_localhost(&self) -> bool {
        self.addr.ip().is_loopback()
    }

    pub fn formatted_address(&self) -> String {
        self.addr.to_string()
    }

    pub fn send_request(
        &self,
        kind: RequestKind,
        guarantee: Guarantee,
    ) -> Result<Arc<SentThing>, NetError> {
        let payload = kind.encode()?;
        self.send_payload(payload, true, guarantee, false)
    }

    pub fn send_response(
        &self,
        response: &Response,
        guarantee: Guarantee,
    ) -> Result<Arc<SentThing>, NetError> {
        let payload = response.encode()?;
        self.send_payload(payload, false, guarantee, false)
    }

    fn send_payload(
        &self,
        payload: Vec<u8>,
        is_request: bool,
        guarantee: Guarantee,
        timed: bool,
    ) -> Result<Arc<SentThing>, NetError> {
        if payload.len() > MAX_PACKET_SIZE - MAX_HEADER_SIZE {
            return Err(PacketError::TooLarge(payload.len()).into());
        }

        let mut inner = self.lock();
        if inner.state == ConnectionState::Closed {
            return Err(NetError::Closed);
        }

        inner.last_used_id += 1;
        let packet_number = inner.last_used_id;
        let acks = inner.select_acks(self.config.ack_count);
        let data = encode_packet(packet_number, &acks, is_request, &payload);

        let now = Instant::now();
        self.transmit(&mut inner, &data, now);

        if !acks.is_empty() {
            inner.sent_acks.push(SentAcks {
                packet_number,
                acks,
            });
        }

        let sent = Arc::new(SentThing::new(packet_number, guarantee, is_request, payload));
        sent.set_timed(timed);
        inner.waiting.push(Arc::clone(&sent));
        Ok(sent)
    }

    fn transmit(&self, inner: &mut ConnectionInner, data: &[u8], now: Instant) {
        match self.socket.send_to(data, self.addr) {
            Ok(bytes) => inner.stats.record_sent(bytes),
            // Treated like a lost datagram, the resend logic takes over.
            Err(e) => log::warn!("Failed to send {} bytes to {}: {}", data.len(), self.addr, e),
        }
        inner.last_sent_at = now;
    }

    /// Untracked packet that keeps the connection alive and flushes pending acks.
    pub fn send_keepalive(&self) {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Closed {
            self.send_keepalive_locked(&mut inner, Instant::now());
        }
    }

    fn send_keepalive_locked(&self, inner: &mut ConnectionInner, now: Instant) {
        let Ok(payload) = Response::without_data(ResponseKind::Keepalive).encode() else {
            log::error!("Failed to encode keepalive");
            return;
        };

        inner.last_used_id += 1;
        let acks = inner.select_acks(self.config.ack_count);
        let data = encode_packet(inner.last_used_id, &acks, false, &payload);
        self.transmit(inner, &data, now);

        // Nothing will confirm an untracked carrier. A lost keepalive shows up
        // as a resend, which is acked again on arrival.
        for id in acks.received_ids() {
            inner.received.remove(&id);
        }
    }

    /// Tells the remote we are leaving and closes.
    pub fn send_close(&self) {
        self.close(CloseReason::Released);
    }

    fn send_close_locked(&self, inner: &mut ConnectionInner) {
        let Ok(payload) = Response::without_data(ResponseKind::CloseConnection).encode() else {
            log::error!("Failed to encode close packet");
            return;
        };

        inner.last_used_id += 1;
        let data = encode_packet(inner.last_used_id, &AckField::empty(), false, &payload);
        self.transmit(inner, &data, Instant::now());
    }

    /// Closes the connection and fails everything still in flight.
    pub fn close(&self, reason: CloseReason) {
        let waiting = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            if reason != CloseReason::RemoteClosed {
                self.send_close_locked(&mut inner);
            }
            inner.state = ConnectionState::Closed;
            inner.sent_acks.clear();
            inner.received.clear();
            std::mem::take(&mut inner.waiting)
        };

        log::info!(
            "Connection to {} closed ({:?}), {} packets abandoned",
            self.addr,
            reason,
            waiting.len()
        );

        for sent in waiting {
            sent.on_finalized(false);
        }
    }

    /// Processes one datagram from the remote.
    pub fn handle_packet(self: &Arc<Self>, data: &[u8], interface: &dyn NetworkInterface) {
        let mut buf = data;
        let sequence = match read_sequence(&mut buf) {
            Ok(sequence) => sequence,
            Err(e) => {
                log::warn!("Dropping packet from {}: {}", self.addr, e);
                return;
            }
        };

        {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.stats.record_received(data.len());

            if !inner.remember(sequence, self.config.duplicate_history) {
                inner.stats.duplicates += 1;
                // The remote resent it, so our ack got lost. Ack it again.
                inner.received.insert(sequence, ReceivedState::Received);
                log::trace!("Duplicate packet {} from {}", sequence, self.addr);
                return;
            }
        }

        let parsed = AckField::read(&mut buf).and_then(|acks| {
            let is_request = read_request_flag(&mut buf)?;
            let payload = decode_payload(sequence, is_request, buf)?;
            Ok((acks, payload))
        });
        let (acks, payload) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Dropping packet {} from {}: {}", sequence, self.addr, e);
                return;
            }
        };

        if self.restriction_mode() != RestrictionMode::None {
            let accepted = matches!(
                &payload,
                Payload::Request(request) if interface.accept_restricted_request(request, self)
            );
            if !accepted {
                log::warn!(
                    "Connection {} violated its restriction, closing",
                    self.addr
                );
                self.close(CloseReason::RestrictionViolated);
                return;
            }
            self.set_restriction_mode(RestrictionMode::None);
        }

        let mut record = true;
        match payload {
            Payload::Request(request) => {
                if let Err(e) = interface.handle_request(&request, self) {
                    log::warn!(
                        "Request {} from {} failed: {}",
                        request.kind.name(),
                        self.addr,
                        e
                    );
                }
            }
            Payload::Response(response) => {
                let matched = if response.response_id == 0 {
                    None
                } else {
                    self.lock()
                        .waiting
                        .iter()
                        .find(|s| s.is_request() && s.packet_number() == response.response_id)
                        .cloned()
                };

                if !interface.pre_handle_response(&response, matched.as_ref(), self) {
                    return;
                }

                if let Some(sent) = matched {
                    {
                        let mut inner = self.lock();
                        inner.waiting.retain(|s| !Arc::ptr_eq(s, &sent));
                        // A response proves the request arrived, even if its ack never does.
                        inner.confirm_ack_carrier(sent.packet_number());
                    }
                    sent.set_response(response);
                    sent.on_finalized(true);
                } else {
                    if response.response_id != 0 {
                        log::warn!(
                            "Response {} from {} matches no pending request {}",
                            response.kind.name(),
                            self.addr,
                            response.response_id
                        );
                    }
                    if response.kind != ResponseKind::None {
                        match interface.handle_response_only(&response, self) {
                            ResponseHandling::Handled => {}
                            ResponseHandling::HandledWithoutAck => record = false,
                            ResponseHandling::Unhandled => log::warn!(
                                "Unhandled response {} from {}",
                                response.kind.name(),
                                self.addr
                            ),
                        }
                    }
                }
            }
        }

        let now = Instant::now();
        let done = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }

            let mut done = Vec::new();
            for id in acks.received_ids() {
                inner.apply_remote_ack(id, &mut done, now);
            }

            inner.last_received_at = now;
            if inner.state == ConnectionState::NothingReceived {
                inner.state = ConnectionState::Initial;
            }
            if record {
                inner
                    .received
                    .entry(sequence)
                    .or_insert(ReceivedState::Received);
            }
            done
        };

        for sent in done {
            sent.on_finalized(true);
        }
    }

    /// The remote confirmed our packet `id`. Safe to call repeatedly.
    pub fn handle_remote_ack(&self, id: u32) {
        let mut done = Vec::new();
        self.lock()
            .apply_remote_ack(id, &mut done, Instant::now());
        for sent in done {
            sent.on_finalized(true);
        }
    }

    pub fn update_listening(&self) -> UpdateOutcome {
        self.update_listening_at(Instant::now())
    }

    /// Resends lost packets, fails exhausted ones and sends keepalives.
    pub fn update_listening_at(&self, now: Instant) -> UpdateOutcome {
        let mut failed = Vec::new();
        let mut critical = None;

        {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Closed => return UpdateOutcome::Closed,
                _ if now.saturating_duration_since(inner.last_received_at) > self.config.timeout() => {
                    return UpdateOutcome::TimedOut;
                }
                _ => {}
            }

            let response_deadline = self.config.packet_lost_after * self.config.critical_packet_max_tries;
            let mut i = 0;
            while i < inner.waiting.len() {
                let sent = Arc::clone(&inner.waiting[i]);
                let elapsed = now.saturating_duration_since(sent.sent_at());

                if let Some(delivered) = sent.delivered_at() {
                    // Acked request, only the response is outstanding.
                    if now.saturating_duration_since(delivered) > response_deadline {
                        log::warn!(
                            "Request {} to {} never got a response",
                            sent.packet_number(),
                            self.addr
                        );
                        inner.waiting.remove(i);
                        failed.push(sent);
                    } else {
                        i += 1;
                    }
                    continue;
                }

                // Once resent, newer acks say nothing about the new copy.
                let overtaken = sent.attempts() == 1
                    && inner.last_confirmed_sent
                        > sent.packet_number() + self.config.packet_lost_after_received_newer;
                if elapsed <= self.config.packet_lost_after && !overtaken {
                    i += 1;
                    continue;
                }

                inner.stats.packets_lost += 1;
                let resend = match sent.guarantee() {
                    Guarantee::None => false,
                    Guarantee::ResendOnce => sent.next_attempt() <= 2,
                    Guarantee::Critical => {
                        if sent.next_attempt() > self.config.critical_packet_max_tries {
                            critical = Some(sent.packet_number());
                            false
                        } else {
                            true
                        }
                    }
                };

                if resend {
                    self.resend_locked(&mut inner, &sent, now);
                    i += 1;
                } else {
                    inner.waiting.remove(i);
                    inner.fail_packet_acks(sent.packet_number());
                    failed.push(sent);
                }

                if critical.is_some() {
                    break;
                }
            }

            if critical.is_none() {
                let since_sent = now.saturating_duration_since(inner.last_sent_at);
                if since_sent > self.config.keepalive_interval
                    || (inner.has_unflushed_acks()
                        && since_sent > self.config.ack_keepalive_interval)
                {
                    self.send_keepalive_locked(&mut inner, now);
                }
            }
        }

        for sent in failed {
            sent.on_finalized(false);
        }

        if let Some(packet_number) = critical {
            log::error!(
                "Critical packet {} to {} was never acknowledged",
                packet_number,
                self.addr
            );
            self.close(CloseReason::CriticalFailure);
            return UpdateOutcome::CriticalFailure;
        }
        UpdateOutcome::Open
    }

    fn resend_locked(&self, inner: &mut ConnectionInner, sent: &SentThing, now: Instant) {
        let packet_number = sent.packet_number();
        let acks = inner.select_acks(self.config.ack_count);
        let data = encode_packet(packet_number, &acks, sent.is_request(), sent.payload());

        log::debug!(
            "Resending packet {} to {} (attempt {})",
            packet_number,
            self.addr,
            sent.attempts()
        );

        self.transmit(inner, &data, now);
        inner.stats.packets_resent += 1;
        sent.reset_sent_at(now);

        if !acks.is_empty() {
            inner.sent_acks.push(SentAcks {
                packet_number,
                acks,
            });
        }
    }

    pub fn block_until_finished(&self, sent: &SentThing) -> bool {
        sent.wait_blocking()
    }

    /// Sends `packets` timed echo requests and measures them on `runner`.
    pub fn calculate_network_ping(
        self: &Arc<Self>,
        runner: &TaskRunner,
        packets: u32,
        allowed_fails: u32,
    ) -> Result<ScheduledJob<Result<PingResult, PingFailure>>, NetError> {
        let packets = if packets == 0 {
            log::warn!("Ping needs at least one packet, sending one");
            1
        } else {
            packets
        };
        if packets >= 100 {
            log::warn!("Pinging {} with {} packets", self.addr, packets);
        }

        let payload = RequestKind::Echo.encode()?;
        let mut sent = Vec::with_capacity(packets as usize);
        for _ in 0..packets {
            sent.push(self.send_payload(payload.clone(), true, Guarantee::Critical, true)?);
        }

        let connection = Arc::clone(self);
        Ok(runner.spawn(async move {
            for packet in &sent {
                packet.finished().await;
            }

            let samples = sent.iter().map(|packet| {
                if packet.succeeded() {
                    packet.round_trip()
                } else {
                    None
                }
            });
            let result = ping::aggregate(samples, allowed_fails);

            match &result {
                Ok(ping) => {
                    connection.lock().stats.last_ping_ms = Some(ping.ping_ms);
                    log::info!("Ping to {}: {} ms", connection.addr, ping.ping_ms);
                }
                Err(e) => log::warn!("Ping to {} failed: {}", connection.addr, e),
            }
            result
        }))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves `host`, `host:port` or an IP literal, falling back to `default_port`.
pub fn parse_address(address: &str, default_port: u16) -> io::Result<SocketAddr> {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let has_port = address
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    let mut resolved = if has_port {
        address.to_socket_addrs()?
    } else {
        (address, default_port).to_socket_addrs()?
    };

    resolved.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("No address found for {}", address),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::net::interface::{DefaultInterface, handle_default_response_only};
    use crate::net::protocol::{DEFAULT_PORT, Request};
    use crate::net::socket::{MemoryNetwork, MemorySocket};

    #[derive(Default)]
    struct CountingInterface {
        requests: AtomicUsize,
        responses: AtomicUsize,
    }

    impl NetworkInterface for CountingInterface {
        fn handle_request(&self, _request: &Request, _conn: &Arc<Connection>) -> Result<(), NetError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn handle_response_only(&self, response: &Response, conn: &Arc<Connection>) -> ResponseHandling {
            self.responses.fetch_add(1, Ordering::SeqCst);
            match handle_default_response_only(response, conn) {
                ResponseHandling::Unhandled => ResponseHandling::Handled,
                other => other,
            }
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct Pair {
        network: MemoryNetwork,
        a: Arc<Connection>,
        b: Arc<Connection>,
        a_socket: Arc<MemorySocket>,
        b_socket: Arc<MemorySocket>,
    }

    fn pair() -> Pair {
        let network = MemoryNetwork::new();
        let a_socket = network.socket(addr(1));
        let b_socket = network.socket(addr(2));
        let config = Arc::new(NetConfig::default());
        let a = Arc::new(Connection::new(addr(2), a_socket.clone(), config.clone()));
        let b = Arc::new(Connection::new(addr(1), b_socket.clone(), config));
        Pair {
            network,
            a,
            b,
            a_socket,
            b_socket,
        }
    }

    fn deliver(socket: &MemorySocket, conn: &Arc<Connection>, interface: &dyn NetworkInterface) -> usize {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut count = 0;
        while let Some((len, _)) = socket.recv_from(&mut buf).unwrap() {
            conn.handle_packet(&buf[..len], interface);
            count += 1;
        }
        count
    }

    fn drain(socket: &MemorySocket) -> Vec<Vec<u8>> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut packets = Vec::new();
        while let Some((len, _)) = socket.recv_from(&mut buf).unwrap() {
            packets.push(buf[..len].to_vec());
        }
        packets
    }

    fn response() -> Response {
        Response::without_data(ResponseKind::SyncDataEnd { succeeded: true })
    }

    #[test]
    fn test_sequence_numbers_start_at_one() {
        let p = pair();
        let first = p.a.send_response(&response(), Guarantee::None).unwrap();
        let second = p.a.send_request(RequestKind::Echo, Guarantee::None).unwrap();

        assert_eq!(first.packet_number(), 1);
        assert_eq!(second.packet_number(), 2);
        assert_eq!(p.a.pending_count(), 2);
    }

    #[test]
    fn test_none_guarantee_fails_on_first_loss() {
        let p = pair();
        let sent = p.a.send_response(&response(), Guarantee::None).unwrap();

        let later = Instant::now() + Duration::from_millis(1100);
        assert_eq!(p.a.update_listening_at(later), UpdateOutcome::Open);

        assert!(sent.is_done());
        assert!(!sent.succeeded());
        assert_eq!(sent.attempts(), 1);
        assert_eq!(p.a.pending_count(), 0);
    }

    #[test]
    fn test_resend_once_then_fail() {
        let p = pair();
        let sent = p.a.send_response(&response(), Guarantee::ResendOnce).unwrap();
        drain(&p.b_socket);

        let t1 = Instant::now() + Duration::from_millis(1100);
        p.a.update_listening_at(t1);
        assert!(!sent.is_done());
        assert_eq!(drain(&p.b_socket).len(), 1);

        p.a.update_listening_at(t1 + Duration::from_millis(1100));
        assert!(sent.is_done());
        assert!(!sent.succeeded());
        assert_eq!(p.a.stats().packets_resent, 1);
    }

    #[test]
    fn test_critical_exhaustion_closes_connection() {
        let p = pair();
        let sent = p.a.send_response(&response(), Guarantee::Critical).unwrap();
        let mut now = Instant::now();

        for _ in 1..NetConfig::default().critical_packet_max_tries {
            now += Duration::from_millis(1100);
            assert_eq!(p.a.update_listening_at(now), UpdateOutcome::Open);
            assert!(!sent.is_done());
        }

        now += Duration::from_millis(1100);
        assert_eq!(p.a.update_listening_at(now), UpdateOutcome::CriticalFailure);
        assert!(sent.is_done());
        assert!(!sent.succeeded());
        assert_eq!(p.a.state(), ConnectionState::Closed);
        assert!(matches!(
            p.a.send_request(RequestKind::Echo, Guarantee::None),
            Err(NetError::Closed)
        ));
    }

    #[test]
    fn test_ack_completes_response() {
        let p = pair();
        let interface = CountingInterface::default();
        let sent = p.a.send_response(&response(), Guarantee::Critical).unwrap();

        deliver(&p.b_socket, &p.b, &interface);
        assert_eq!(p.b.unconfirmed_ack_count(), 1);

        // b acks on its next packet
        p.b.send_response(&response(), Guarantee::None).unwrap();
        deliver(&p.a_socket, &p.a, &interface);

        assert!(sent.succeeded());
        assert_eq!(p.a.last_confirmed_sent(), 1);
        assert_eq!(interface.responses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_two_phase_ack_confirmation() {
        let p = pair();
        let interface = CountingInterface::default();

        p.a.send_response(&response(), Guarantee::Critical).unwrap();
        deliver(&p.b_socket, &p.b, &interface);

        // Carries the ack for a#1 and is itself tracked.
        p.b.send_response(&response(), Guarantee::Critical).unwrap();
        deliver(&p.a_socket, &p.a, &interface);
        assert_eq!(p.b.unconfirmed_ack_count(), 1);

        // a acks b#1, which tells b its ack of a#1 arrived.
        p.a.send_response(&response(), Guarantee::Critical).unwrap();
        deliver(&p.b_socket, &p.b, &interface);
        assert_eq!(p.b.unconfirmed_ack_count(), 1);
        assert_eq!(p.b.pending_count(), 0);
    }

    #[test]
    fn test_remote_ack_is_idempotent() {
        let p = pair();
        let first = p.a.send_response(&response(), Guarantee::Critical).unwrap();
        let second = p.a.send_response(&response(), Guarantee::Critical).unwrap();

        p.a.handle_remote_ack(1);
        p.a.handle_remote_ack(1);

        assert!(first.succeeded());
        assert!(!second.is_done());
        assert_eq!(p.a.pending_count(), 1);

        p.a.handle_remote_ack(42);
        assert_eq!(p.a.pending_count(), 1);
        assert_eq!(p.a.last_confirmed_sent(), 1);
    }

    #[test]
    fn test_request_waits_for_response_not_ack() {
        let p = pair();
        let sent = p.a.send_request(RequestKind::Echo, Guarantee::Critical).unwrap();

        p.a.handle_remote_ack(sent.packet_number());
        assert!(!sent.is_done());

        // Acked requests are not resent while the response is pending.
        p.a.update_listening_at(Instant::now() + Duration::from_millis(1100));
        assert_eq!(sent.attempts(), 1);

        let interface = CountingInterface::default();
        drain(&p.b_socket);
        p.b.send_response(
            &Response::new(sent.packet_number(), ResponseKind::Echo),
            Guarantee::None,
        )
        .unwrap();
        deliver(&p.a_socket, &p.a, &interface);

        assert!(sent.succeeded());
        assert_eq!(sent.response().map(|r| r.kind), Some(ResponseKind::Echo));
        assert_eq!(interface.responses.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_duplicates_dispatched_once() {
        let p = pair();
        let interface = CountingInterface::default();
        p.a.send_request(RequestKind::Echo, Guarantee::Critical).unwrap();

        let packets = drain(&p.b_socket);
        assert_eq!(packets.len(), 1);
        p.b.handle_packet(&packets[0], &interface);
        p.b.handle_packet(&packets[0], &interface);
        p.b.handle_packet(&packets[0], &interface);

        assert_eq!(interface.requests.load(Ordering::SeqCst), 1);
        assert_eq!(p.b.stats().duplicates, 2);
    }

    #[test]
    fn test_resend_dispatched_once() {
        let p = pair();
        let interface = CountingInterface::default();
        let sent = p.a.send_request(RequestKind::Echo, Guarantee::Critical).unwrap();

        p.a.update_listening_at(Instant::now() + Duration::from_millis(1100));
        assert_eq!(sent.attempts(), 2);

        assert_eq!(deliver(&p.b_socket, &p.b, &interface), 2);
        assert_eq!(interface.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_packets_dropped() {
        let p = pair();
        let interface = CountingInterface::default();

        p.b.handle_packet(&[0, 0], &interface);
        p.b.handle_packet(&[0, 0, 0, 5, 0, 0, 0, 0, 9], &interface);
        p.b.handle_packet(&[0, 0, 0, 6, 0, 0, 0, 0, 1, 0xff, 0xff], &interface);

        assert_eq!(p.b.state(), ConnectionState::NothingReceived);
        assert_eq!(interface.requests.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_packet_moves_to_initial() {
        let p = pair();
        let interface = CountingInterface::default();
        assert_eq!(p.b.state(), ConnectionState::NothingReceived);

        p.a.send_request(RequestKind::Echo, Guarantee::None).unwrap();
        deliver(&p.b_socket, &p.b, &interface);
        assert_eq!(p.b.state(), ConnectionState::Initial);
    }

    #[test]
    fn test_restriction_violation_closes() {
        let p = pair();
        let interface = CountingInterface::default();
        p.b.set_restriction_mode(RestrictionMode::ReceiveRemoteConsole);

        p.a.send_request(RequestKind::Echo, Guarantee::None).unwrap();
        deliver(&p.b_socket, &p.b, &interface);

        assert_eq!(p.b.state(), ConnectionState::Closed);
        assert_eq!(interface.requests.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restricted_handshake_lifts_restriction() {
        let p = pair();
        let interface = CountingInterface::default();
        p.b.set_restriction_mode(RestrictionMode::ReceiveRemoteConsole);

        p.a.send_request(RequestKind::RemoteConsoleOpen { token: 7 }, Guarantee::None)
            .unwrap();
        p.a.send_request(RequestKind::Echo, Guarantee::None).unwrap();
        deliver(&p.b_socket, &p.b, &interface);

        assert_eq!(p.b.restriction_mode(), RestrictionMode::None);
        assert_eq!(p.b.state(), ConnectionState::Initial);
        assert_eq!(interface.requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_fails_waiting_and_notifies_remote() {
        let p = pair();
        let interface = CountingInterface::default();
        let sent = p.a.send_request(RequestKind::Echo, Guarantee::Critical).unwrap();
        drain(&p.b_socket);

        p.a.send_close();
        assert!(sent.is_done());
        assert!(!sent.succeeded());

        deliver(&p.b_socket, &p.b, &interface);
        assert_eq!(p.b.state(), ConnectionState::Closed);
        // Remote closed first, so b does not answer with its own close.
        assert_eq!(p.network.pending(addr(1)), 0);
    }

    #[test]
    fn test_idle_timeout() {
        let p = pair();
        let later = Instant::now() + NetConfig::default().timeout() + Duration::from_secs(1);
        assert_eq!(p.a.update_listening_at(later), UpdateOutcome::TimedOut);
        assert!(p.a.is_open());
    }

    #[test]
    fn test_ack_keepalive_flushes_acks() {
        let p = pair();
        let interface = CountingInterface::default();
        let sent = p.a.send_response(&response(), Guarantee::Critical).unwrap();
        deliver(&p.b_socket, &p.b, &interface);

        // Nothing to say yet, no keepalive.
        assert_eq!(p.b.update_listening_at(Instant::now()), UpdateOutcome::Open);

        let later = Instant::now() + Duration::from_millis(60);
        p.b.update_listening_at(later);
        assert_eq!(p.b.unconfirmed_ack_count(), 0);

        // Keepalives are not acked back.
        deliver(&p.a_socket, &p.a, &interface);
        assert!(sent.succeeded());
        assert_eq!(p.a.unconfirmed_ack_count(), 0);

        p.b.update_listening_at(later + Duration::from_millis(60));
        assert!(p.network.pending(addr(1)) == 0);
    }

    #[test]
    fn test_lost_ack_is_resent_after_duplicate() {
        let p = pair();
        let interface = CountingInterface::default();
        let sent = p.a.send_response(&response(), Guarantee::Critical).unwrap();
        deliver(&p.b_socket, &p.b, &interface);

        // b's keepalive carrying the ack is lost.
        p.network.set_link_down(addr(2), addr(1), true);
        p.b.update_listening_at(Instant::now() + Duration::from_millis(60));
        p.network.set_link_down(addr(2), addr(1), false);

        p.a.update_listening_at(Instant::now() + Duration::from_millis(1100));
        deliver(&p.b_socket, &p.b, &interface);
        assert_eq!(p.b.unconfirmed_ack_count(), 1);

        p.b.update_listening_at(Instant::now() + Duration::from_millis(200));
        deliver(&p.a_socket, &p.a, &interface);
        assert!(sent.succeeded());
    }

    #[test]
    fn test_response_confirms_acks_carried_by_request() {
        let p = pair();
        let interface = CountingInterface::default();

        // a's request carries the ack for b#1.
        p.b.send_response(&response(), Guarantee::Critical).unwrap();
        deliver(&p.a_socket, &p.a, &interface);
        let echo = p.a.send_request(RequestKind::Echo, Guarantee::Critical).unwrap();
        assert_eq!(p.a.lock().sent_acks.len(), 1);

        deliver(&p.b_socket, &p.b, &DefaultInterface);

        // b's keepalive acking the request is lost, only the reply gets through.
        p.network.set_link_down(addr(2), addr(1), true);
        p.b.update_listening_at(Instant::now() + Duration::from_millis(60));
        p.network.set_link_down(addr(2), addr(1), false);

        deliver(&p.a_socket, &p.a, &interface);
        assert!(echo.succeeded());

        let inner = p.a.lock();
        assert!(inner.sent_acks.is_empty());
        assert!(!inner.received.contains_key(&1));
    }

    #[test]
    fn test_ack_window_past_max_id_dropped() {
        let p = pair();
        let interface = CountingInterface::default();
        let sent = p.a.send_response(&response(), Guarantee::Critical).unwrap();

        let acks = AckField {
            first_packet_id: u32::MAX - 7,
            acks: vec![0xff, 0xff],
        };
        let data = encode_packet(1, &acks, false, &response().encode().unwrap());
        p.a.handle_packet(&data, &interface);

        assert!(!sent.is_done());
        assert_eq!(p.a.pending_count(), 1);
        assert!(p.a.is_open());
        assert_eq!(interface.responses.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_ack_count_sends_no_acks() {
        let network = MemoryNetwork::new();
        let a_socket = network.socket(addr(1));
        let b_socket = network.socket(addr(2));
        let config = Arc::new(NetConfig {
            ack_count: 0,
            ..NetConfig::default()
        });
        let a = Arc::new(Connection::new(addr(2), a_socket.clone(), config.clone()));
        let b = Arc::new(Connection::new(addr(1), b_socket.clone(), config));
        let interface = CountingInterface::default();

        a.send_response(&response(), Guarantee::Critical).unwrap();
        deliver(&b_socket, &b, &interface);

        // Both halves of the front/back toggle.
        b.send_response(&response(), Guarantee::Critical).unwrap();
        b.send_response(&response(), Guarantee::Critical).unwrap();
        assert_eq!(b.unconfirmed_ack_count(), 1);

        for packet in drain(&a_socket) {
            let mut buf: &[u8] = &packet[4..];
            assert!(AckField::read(&mut buf).unwrap().is_empty());
        }
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("127.0.0.1", DEFAULT_PORT).unwrap(), addr(DEFAULT_PORT));
        assert_eq!(parse_address("127.0.0.1:4000", DEFAULT_PORT).unwrap(), addr(4000));
        assert_eq!(
            parse_address("[::1]:5000", DEFAULT_PORT).unwrap(),
            "[::1]:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_address("::1", 9).unwrap(),
            "[::1]:9".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_address("localhost", DEFAULT_PORT).unwrap().port(),
            DEFAULT_PORT
        );
    }

    #[test]
    fn test_localhost_detection() {
        let p = pair();
        assert!(p.a.is_target_host_localhost());
        assert_eq!(p.a.formatted_address(), "127.0.0.1:2");
    }
}
