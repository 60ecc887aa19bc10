use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};

use super::protocol::MAX_PACKET_SIZE;
use super::stats::PacketLossSimulation;

/// Unreliable datagram channel underneath the connections.
pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Non-blocking receive. `Ok(None)` when nothing is queued.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> SocketAddr;
}

pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    loss_simulation: Mutex<PacketLossSimulation>,
}

impl UdpEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            loss_simulation: Mutex::new(PacketLossSimulation::default()),
        })
    }

    pub fn set_loss_simulation(&self, simulation: PacketLossSimulation) {
        *self
            .loss_simulation
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = simulation;
    }
}

impl DatagramSocket for UdpEndpoint {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Packet exceeds MTU",
            ));
        }

        if self
            .loss_simulation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .should_drop()
        {
            log::trace!("Simulated loss of {} bytes to {}", data.len(), addr);
            return Ok(data.len());
        }

        self.socket.send_to(data, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // Windows reports ICMP port unreachable on the next receive.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>,
    down_links: HashSet<(SocketAddr, SocketAddr)>,
    sent: HashMap<(SocketAddr, SocketAddr), u64>,
}

/// In-process datagram network. Links can be cut per direction to simulate
/// loss deterministically.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket(&self, addr: SocketAddr) -> Arc<MemorySocket> {
        self.lock().queues.entry(addr).or_default();
        Arc::new(MemorySocket {
            addr,
            network: self.clone(),
        })
    }

    /// Datagrams from `from` to `to` are silently dropped while the link is down.
    pub fn set_link_down(&self, from: SocketAddr, to: SocketAddr, down: bool) {
        let mut state = self.lock();
        if down {
            state.down_links.insert((from, to));
        } else {
            state.down_links.remove(&(from, to));
        }
    }

    /// Datagrams handed to the network from `from` to `to`, dropped ones included.
    pub fn sent_count(&self, from: SocketAddr, to: SocketAddr) -> u64 {
        self.lock().sent.get(&(from, to)).copied().unwrap_or(0)
    }

    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().queues.get(&addr).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl DatagramSocket for MemorySocket {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Packet exceeds MTU",
            ));
        }

        let mut state = self.network.lock();
        *state.sent.entry((self.addr, addr)).or_default() += 1;

        if state.down_links.contains(&(self.addr, addr)) {
            return Ok(data.len());
        }
        if let Some(queue) = state.queues.get_mut(&addr) {
            queue.push_back((data.to_vec(), self.addr));
        }
        Ok(data.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut state = self.network.lock();
        let Some((data, from)) = state.queues.get_mut(&self.addr).and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };

        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some((len, from)))
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_memory_delivery() {
        let network = MemoryNetwork::new();
        let a = network.socket(addr(1));
        let b = network.socket(addr(2));

        a.send_to(b"hello", addr(2)).unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, from) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, addr(1));
        assert!(b.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_link_down_drops_one_direction() {
        let network = MemoryNetwork::new();
        let a = network.socket(addr(1));
        let b = network.socket(addr(2));
        network.set_link_down(addr(1), addr(2), true);

        a.send_to(b"lost", addr(2)).unwrap();
        b.send_to(b"kept", addr(1)).unwrap();

        assert_eq!(network.pending(addr(2)), 0);
        assert_eq!(network.pending(addr(1)), 1);
        assert_eq!(network.sent_count(addr(1), addr(2)), 1);
    }

    #[test]
    fn test_udp_endpoint_loopback() {
        let a = UdpEndpoint::bind("127.0.0.1:0").unwrap();
        let b = UdpEndpoint::bind("127.0.0.1:0").unwrap();

        a.send_to(b"ping", b.local_addr()).unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        loop {
            if let Some((len, from)) = b.recv_from(&mut buf).unwrap() {
                assert_eq!(&buf[..len], b"ping");
                assert_eq!(from, a.local_addr());
                break;
            }
            assert!(std::time::Instant::now() < deadline, "datagram never arrived");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}
