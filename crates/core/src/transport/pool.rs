use parking_lot::Mutex;

use crate::media::rtp::RTP_HEADER_LEN;

/// Largest RTP packet we emit: a 1300-byte MTU minus IP and UDP headers.
pub const MAX_PACKET_SIZE: usize = 1300 - 28;

/// Payload bytes available after the RTP header.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - RTP_HEADER_LEN;

/// A packet buffer checked out of a [`BufferPool`].
///
/// Bytes `0..12` are reserved for the RTP header, which the socket writes
/// at send time. Packetizers fill [`payload_mut`](Self::payload_mut).
#[derive(Debug)]
pub struct PacketBuffer {
    data: Vec<u8>,
}

impl PacketBuffer {
    fn new() -> Self {
        Self {
            data: vec![0; MAX_PACKET_SIZE],
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[RTP_HEADER_LEN..]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Fixed-size packet buffers with checkout/return.
///
/// Holds at most `capacity` idle buffers; checkouts beyond that allocate.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<PacketBuffer>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn checkout(&self) -> PacketBuffer {
        self.free.lock().pop().unwrap_or_else(PacketBuffer::new)
    }

    pub fn checkin(&self, buffer: PacketBuffer) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buffer);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(2);
        let mut buf = pool.checkout();
        buf.payload_mut()[0] = 0x42;
        pool.checkin(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.checkout();
        assert_eq!(buf.as_slice()[RTP_HEADER_LEN], 0x42);
        assert_eq!(buf.as_slice().len(), MAX_PACKET_SIZE);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn idle_buffers_are_capped() {
        let pool = BufferPool::new(1);
        let a = pool.checkout();
        let b = pool.checkout();
        pool.checkin(a);
        pool.checkin(b);
        assert_eq!(pool.idle(), 1);
    }
}
