//! Bounded replay buffer for late stdout subscribers.
//!
//! Keeps the last N bytes of session output so a client that subscribes after
//! the fact can be sent recent history before live data.

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct Scrollback {
    buf: Vec<u8>,
    capacity: usize,
    /// Next write position (wraps around).
    write_pos: usize,
    total_written: u64,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Append, overwriting the oldest bytes once full.
    pub fn write(&mut self, data: &[u8]) {
        if self.capacity == 0 || data.is_empty() {
            return;
        }
        self.total_written += data.len() as u64;

        // Only the last `capacity` bytes can survive.
        let data = &data[data.len().saturating_sub(self.capacity)..];
        let first = data.len().min(self.capacity - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = &data[first..];
        self.buf[..rest.len()].copy_from_slice(rest);
        self.write_pos = (self.write_pos + data.len()) % self.capacity;
    }

    /// Stored bytes, oldest first.
    pub fn read_all(&self) -> Vec<u8> {
        let len = self.len();
        let mut out = Vec::with_capacity(len);
        if self.total_written <= self.capacity as u64 {
            out.extend_from_slice(&self.buf[..len]);
        } else {
            out.extend_from_slice(&self.buf[self.write_pos..]);
            out.extend_from_slice(&self.buf[..self.write_pos]);
        }
        out
    }

    /// Replay data for a new subscriber. Once the buffer has wrapped, leading
    /// UTF-8 continuation bytes are dropped so the snapshot starts on a
    /// character boundary.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = self.read_all();
        if self.total_written > self.capacity as u64 {
            let skip = out.iter().take(3).take_while(|b| *b & 0xc0 == 0x80).count();
            out.drain(..skip);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.total_written.min(self.capacity as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.total_written = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order_before_and_after_wrap() {
        let mut sb = Scrollback::new(5);
        sb.write(b"abc");
        assert_eq!(sb.read_all(), b"abc");
        sb.write(b"de");
        sb.write(b"fg");
        assert_eq!(sb.read_all(), b"cdefg");
        assert_eq!(sb.len(), 5);
        assert_eq!(sb.total_written(), 7);
    }

    #[test]
    fn oversized_write_keeps_tail() {
        let mut sb = Scrollback::new(4);
        sb.write(b"x");
        sb.write(b"0123456789");
        assert_eq!(sb.read_all(), b"6789");
    }

    #[test]
    fn snapshot_starts_on_char_boundary() {
        let mut sb = Scrollback::new(3);
        sb.write("a€".as_bytes());
        assert_eq!(sb.snapshot(), "€".as_bytes());
        sb.write(b"z");
        assert_eq!(sb.read_all(), [0x82, 0xac, b'z']);
        assert_eq!(sb.snapshot(), b"z");
    }

    #[test]
    fn zero_capacity_and_clear() {
        let mut sb = Scrollback::new(0);
        sb.write(b"test");
        assert!(sb.is_empty());

        let mut sb = Scrollback::new(8);
        sb.write(b"abc");
        sb.clear();
        assert!(sb.is_empty());
        assert_eq!(sb.snapshot(), Vec::<u8>::new());
    }
}
