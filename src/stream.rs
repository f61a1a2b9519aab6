//! Buffered byte I/O over a connected socket.
//!
//! [`Writer`] collects output in a fixed buffer and hands it to
//! [`Device::send`] whenever the buffer fills, so it can be driven a byte
//! or a `write!` at a time. [`Reader`] pulls received data through
//! [`Device::receive`] in chunks of its buffer size.

use core::fmt;

use crate::bus::Bus;
use crate::device::Device;
use crate::socket::SocketId;
use crate::Error;

/// Buffered writer for an established socket.
pub struct Writer<'d, B, const N: usize> {
    dev: &'d mut Device<B>,
    socket: SocketId,
    buf: [u8; N],
    len: usize,
    error: Option<Error>,
}

impl<'d, B: Bus, const N: usize> Writer<'d, B, N> {
    pub fn new(dev: &'d mut Device<B>, socket: SocketId) -> Self {
        Writer {
            dev,
            socket,
            buf: [0; N],
            len: 0,
            error: None,
        }
    }

    pub fn push(&mut self, byte: u8) -> Result<(), Error> {
        if self.len == N {
            self.flush()?;
        }
        self.buf[self.len] = byte;
        self.len += 1;
        if self.len == N {
            self.flush()?;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        data.iter().try_for_each(|&b| self.push(b))
    }

    /// Sends whatever is buffered.
    pub fn flush(&mut self) -> Result<(), Error> {
        if self.len == 0 {
            return Ok(());
        }
        let sent = self.dev.send(self.socket, &self.buf[..self.len], false)?;
        log::trace!("{}: flushed {} bytes, {} acknowledged", self.socket, self.len, sent);
        self.len = 0;
        Ok(())
    }

    /// Flushes and releases the device.
    pub fn finish(mut self) -> Result<(), Error> {
        self.flush()
    }

    /// The error behind the last failed [`fmt::Write`] call.
    #[inline]
    pub fn error(&self) -> Option<Error> {
        self.error
    }
}

impl<B: Bus, const N: usize> fmt::Write for Writer<'_, B, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes()).map_err(|e| {
            self.error = Some(e);
            fmt::Error
        })
    }
}

/// Buffered reader for a connected socket.
pub struct Reader<'d, B, const N: usize> {
    dev: &'d mut Device<B>,
    socket: SocketId,
    buf: [u8; N],
    pos: usize,
    filled: usize,
    /// Bytes known to be waiting in the device.
    available: u16,
}

impl<'d, B: Bus, const N: usize> Reader<'d, B, N> {
    pub fn new(dev: &'d mut Device<B>, socket: SocketId) -> Self {
        Reader {
            dev,
            socket,
            buf: [0; N],
            pos: 0,
            filled: 0,
            available: 0,
        }
    }

    /// Blocks until data arrives and returns how much is waiting.
    pub fn wait(&mut self) -> Result<u16, Error> {
        self.available = self.dev.wait_for_data(self.socket)?;
        Ok(self.available)
    }

    fn fill(&mut self) -> Result<bool, Error> {
        if self.available == 0 {
            self.available = self.dev.received(self.socket)?;
        }
        let n = N.min(self.available.into());
        if n == 0 {
            return Ok(false);
        }
        self.dev.receive(self.socket, &mut self.buf[..n])?;
        self.available -= n as u16;
        self.pos = 0;
        self.filled = n;
        Ok(true)
    }

    /// Returns the next received byte, or `None` if nothing is waiting.
    pub fn read_byte(&mut self) -> Result<Option<u8>, Error> {
        if self.pos == self.filled && !self.fill()? {
            return Ok(None);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }

    /// Reads as much as is waiting, up to `out.len()` bytes.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        let mut n = 0;
        while n < out.len() {
            match self.read_byte()? {
                Some(b) => out[n] = b,
                None => break,
            }
            n += 1;
        }
        Ok(n)
    }
}

impl<B: Bus, const N: usize> Iterator for Reader<'_, B, N> {
    type Item = Result<u8, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_byte().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChip;
    use crate::Addr;
    use core::fmt::Write as _;

    fn connected() -> Result<(Device<MockChip>, SocketId), Error> {
        let mut dev = Device::new(MockChip::new());
        let s = SocketId::new(0).unwrap();
        dev.start_client(s, Addr([10, 0, 0, 2]), 80)?;
        Ok((dev, s))
    }

    #[test]
    fn writer_flushes_when_full() -> Result<(), Error> {
        let (mut dev, s) = connected()?;
        let mut w = Writer::<_, 8>::new(&mut dev, s);
        write!(w, "HTTP/1.0 {} OK\r\n", 200).unwrap();
        w.push(b'\n')?;
        w.finish()?;

        let sent = &dev.bus().sent;
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().take(2).all(|p| p.data.len() == 8));
        let all: Vec<u8> = sent.iter().flat_map(|p| p.data.iter().copied()).collect();
        assert_eq!(all, b"HTTP/1.0 200 OK\r\n\n");
        Ok(())
    }

    #[test]
    fn writer_reports_send_errors() -> Result<(), Error> {
        let (mut dev, s) = connected()?;
        dev.stop(s)?;
        let mut w = Writer::<_, 4>::new(&mut dev, s);
        assert!(w.write_str("closed!").is_err());
        assert_eq!(w.error(), Some(Error::NotConnected));
        Ok(())
    }

    #[test]
    fn reader_pulls_chunks() -> Result<(), Error> {
        let (mut dev, s) = connected()?;
        dev.bus_mut().deliver_stream(s, b"GET /index.html");
        let mut r = Reader::<_, 4>::new(&mut dev, s);
        assert_eq!(r.wait()?, 15);
        let mut first = [0; 3];
        assert_eq!(r.read(&mut first)?, 3);
        assert_eq!(&first, b"GET");
        let rest = r.collect::<Result<Vec<_>, _>>()?;
        assert_eq!(rest, b" /index.html");
        assert_eq!(dev.received(s)?, 0);
        Ok(())
    }

    #[test]
    fn reader_sees_nothing_when_idle() -> Result<(), Error> {
        let (mut dev, s) = connected()?;
        let mut r = Reader::<_, 16>::new(&mut dev, s);
        assert_eq!(r.read_byte()?, None);
        Ok(())
    }
}
