use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::Mutex,
    thread,
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};

use crate::TrainingError;

/// Collective operations shared by every process of a training run.
///
/// Calls are blocking and must be issued in the same order with equally sized
/// buffers on every rank.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replaces `values` with the element-wise mean across ranks.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<(), TrainingError>;

    /// Replaces `values` on every rank with the contents held by `root`.
    fn broadcast(&self, values: &mut [f32], root: usize) -> Result<(), TrainingError>;

    fn barrier(&self) -> Result<(), TrainingError> {
        let mut token = [0.0f32];
        self.all_reduce_mean(&mut token)
    }
}

/// Group of a single process; every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalGroup;

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _values: &mut [f32]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn broadcast(&self, _values: &mut [f32], root: usize) -> Result<(), TrainingError> {
        if root != 0 {
            return Err(TrainingError::runtime(format!(
                "broadcast root {} outside a group of one",
                root
            )));
        }
        Ok(())
    }
}

const OP_ALL_REDUCE: u8 = 1;
const OP_BROADCAST: u8 = 2;
const HEADER_LEN: usize = 9;
const CONNECT_ATTEMPTS: usize = 600;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Star-topology process group over TCP.
///
/// Rank 0 accepts one connection per peer and performs reductions; peers exchange
/// frames with rank 0 only. A frame is a one-byte op code, a little-endian `u64`
/// element count and that many little-endian `f32` values.
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    links: Vec<Mutex<TcpStream>>,
}

impl TcpProcessGroup {
    /// Rendezvous at `master_addr:port`: rank 0 listens there, other ranks connect.
    pub fn init(
        master_addr: &str,
        port: u16,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, TrainingError> {
        if rank == 0 {
            let listener = TcpListener::bind((master_addr, port)).map_err(|err| {
                TrainingError::initialization(format!(
                    "rank 0 failed to listen on {}:{}: {}",
                    master_addr, port, err
                ))
            })?;
            Self::host(listener, world_size)
        } else {
            let addr = resolve(master_addr, port)?;
            Self::join(addr, rank, world_size)
        }
    }

    /// Rank 0 side: accepts `world_size - 1` peers on `listener`.
    pub fn host(listener: TcpListener, world_size: usize) -> Result<Self, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::initialization("world size must be positive"));
        }
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        for _ in 1..world_size {
            let (mut stream, _) = listener.accept().map_err(|err| {
                TrainingError::initialization(format!("failed to accept peer: {}", err))
            })?;
            stream.set_nodelay(true)?;
            let mut rank_bytes = [0u8; 4];
            stream.read_exact(&mut rank_bytes)?;
            let peer = u32::from_le_bytes(rank_bytes) as usize;
            if peer == 0 || peer >= world_size || slots[peer - 1].is_some() {
                return Err(TrainingError::initialization(format!(
                    "peer announced invalid or duplicate rank {}",
                    peer
                )));
            }
            slots[peer - 1] = Some(stream);
        }
        let links = slots.into_iter().flatten().map(Mutex::new).collect();
        Ok(Self {
            rank: 0,
            world_size,
            links,
        })
    }

    /// Peer side: connects to rank 0, retrying while it is not listening yet.
    pub fn join(addr: SocketAddr, rank: usize, world_size: usize) -> Result<Self, TrainingError> {
        if rank == 0 || rank >= world_size {
            return Err(TrainingError::initialization(format!(
                "rank {} cannot join a group of {} as a peer",
                rank, world_size
            )));
        }
        let mut last_error = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    stream.write_all(&(rank as u32).to_le_bytes())?;
                    return Ok(Self {
                        rank,
                        world_size,
                        links: vec![Mutex::new(stream)],
                    });
                }
                Err(err) => {
                    last_error = Some(err);
                    thread::sleep(CONNECT_BACKOFF);
                }
            }
        }
        Err(TrainingError::initialization(format!(
            "rank {} could not reach rank 0 at {}: {}",
            rank,
            addr,
            last_error.map(|err| err.to_string()).unwrap_or_default()
        )))
    }

    fn link(&self, index: usize) -> Result<std::sync::MutexGuard<'_, TcpStream>, TrainingError> {
        self.links
            .get(index)
            .ok_or_else(|| TrainingError::runtime(format!("no link {} in process group", index)))?
            .lock()
            .map_err(|_| TrainingError::runtime("process group link lock poisoned"))
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<(), TrainingError> {
        if self.world_size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            let mut sum: Vec<f32> = values.to_vec();
            for index in 0..self.links.len() {
                let mut stream = self.link(index)?;
                let incoming = read_frame(&mut *stream, OP_ALL_REDUCE, values.len())?;
                for (acc, value) in sum.iter_mut().zip(incoming) {
                    *acc += value;
                }
            }
            let scale = 1.0 / self.world_size as f32;
            for (slot, total) in values.iter_mut().zip(sum) {
                *slot = total * scale;
            }
            for index in 0..self.links.len() {
                let mut stream = self.link(index)?;
                write_frame(&mut *stream, OP_ALL_REDUCE, values)?;
            }
        } else {
            let mut stream = self.link(0)?;
            write_frame(&mut *stream, OP_ALL_REDUCE, values)?;
            let reduced = read_frame(&mut *stream, OP_ALL_REDUCE, values.len())?;
            values.copy_from_slice(&reduced);
        }
        Ok(())
    }

    fn broadcast(&self, values: &mut [f32], root: usize) -> Result<(), TrainingError> {
        if root != 0 {
            return Err(TrainingError::runtime(
                "tcp process group only broadcasts from rank 0",
            ));
        }
        if self.world_size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for index in 0..self.links.len() {
                let mut stream = self.link(index)?;
                write_frame(&mut *stream, OP_BROADCAST, values)?;
            }
        } else {
            let mut stream = self.link(0)?;
            let received = read_frame(&mut *stream, OP_BROADCAST, values.len())?;
            values.copy_from_slice(&received);
        }
        Ok(())
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TrainingError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|err| {
            TrainingError::initialization(format!("failed to resolve {}:{}: {}", host, port, err))
        })?
        .next()
        .ok_or_else(|| {
            TrainingError::initialization(format!("{}:{} resolved to no address", host, port))
        })
}

fn write_frame(stream: &mut impl Write, op: u8, values: &[f32]) -> Result<(), TrainingError> {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + values.len() * 4);
    frame.put_u8(op);
    frame.put_u64_le(values.len() as u64);
    for value in values {
        frame.put_f32_le(*value);
    }
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut impl Read, op: u8, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let mut header = &header[..];
    let received_op = header.get_u8();
    let count = header.get_u64_le() as usize;
    if received_op != op || count != expected {
        return Err(TrainingError::runtime(format!(
            "collective mismatch: expected op {} with {} values, got op {} with {}",
            op, expected, received_op, count
        )));
    }

    let mut payload = vec![0u8; count * 4];
    stream.read_exact(&mut payload)?;
    let mut payload = &payload[..];
    Ok((0..count).map(|_| payload.get_f32_le()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn spawn_group(world_size: usize) -> Vec<TcpProcessGroup> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peers: Vec<_> = (1..world_size)
            .map(|rank| thread::spawn(move || TcpProcessGroup::join(addr, rank, world_size)))
            .collect();
        let mut groups = vec![TcpProcessGroup::host(listener, world_size).unwrap()];
        for peer in peers {
            groups.push(peer.join().unwrap().unwrap());
        }
        groups
    }

    fn run_on_all<F>(groups: Vec<TcpProcessGroup>, op: F) -> Vec<Vec<f32>>
    where
        F: Fn(&TcpProcessGroup) -> Vec<f32> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let op = Arc::clone(&op);
                thread::spawn(move || op(&group))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn local_group_is_identity() {
        let group = LocalGroup;
        let mut values = [1.0, 2.0];
        group.all_reduce_mean(&mut values).unwrap();
        group.broadcast(&mut values, 0).unwrap();
        group.barrier().unwrap();
        assert_eq!(values, [1.0, 2.0]);
        assert!(group.broadcast(&mut values, 1).is_err());
    }

    #[test]
    fn all_reduce_averages_across_ranks() {
        let results = run_on_all(spawn_group(3), |group| {
            let base = group.rank() as f32;
            let mut values = vec![base, base * 2.0];
            group.all_reduce_mean(&mut values).unwrap();
            values
        });
        for values in results {
            assert_eq!(values, vec![1.0, 2.0]);
        }
    }

    #[test]
    fn broadcast_copies_root_values() {
        let results = run_on_all(spawn_group(2), |group| {
            let mut values = if group.rank() == 0 {
                vec![3.5, -1.0]
            } else {
                vec![0.0, 0.0]
            };
            group.broadcast(&mut values, 0).unwrap();
            group.barrier().unwrap();
            values
        });
        for values in results {
            assert_eq!(values, vec![3.5, -1.0]);
        }
    }

    #[test]
    fn mismatched_lengths_are_reported() {
        let results = run_on_all(spawn_group(2), |group| {
            let mut values = vec![0.0; 1 + group.rank()];
            match group.all_reduce_mean(&mut values) {
                Ok(()) => vec![0.0],
                Err(_) => vec![1.0],
            }
        });
        assert_eq!(results[0], vec![1.0]);
    }
}
