/*!
Register and buffer-memory access over the W5500 serial bus.

Every access is one frame: a 16-bit address (register offset or
buffer-memory address), a control byte selecting the block and the
direction, then the data phase. The frame is bracketed by chip
select and deselect; only one frame may be in flight at a time.
 */

use byteorder::{ByteOrder, NetworkEndian};

/// Read/write bit of the control byte.
pub const RWB_WRITE: u8 = 0b100;

/// The byte-level serial link to the chip.
///
/// Implementations own chip-select handling and the clock/phase
/// setup; this crate only ever shuttles bytes through `transfer`.
pub trait Bus {
    /// Asserts chip select.
    fn select(&mut self);
    /// Releases chip select, ending the current frame.
    fn deselect(&mut self);
    /// Clocks one byte out and returns the byte clocked in.
    fn transfer(&mut self, byte: u8) -> u8;
}

impl<T: Bus + ?Sized> Bus for &mut T {
    #[inline]
    fn select(&mut self) {
        (**self).select()
    }

    #[inline]
    fn deselect(&mut self) {
        (**self).deselect()
    }

    #[inline]
    fn transfer(&mut self, byte: u8) -> u8 {
        (**self).transfer(byte)
    }
}

/// A blocking sleep.
pub trait Delay {
    fn delay_ms(&mut self, ms: u32);
}

impl<T: Delay + ?Sized> Delay for &mut T {
    #[inline]
    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

/// Framed register and memory access on top of a [`Bus`].
#[derive(Debug)]
pub struct Transport<B> {
    bus: B,
}

impl<B> Transport<B> {
    pub fn new(bus: B) -> Self {
        Transport { bus }
    }

    /// Consumes the transport and returns the underlying bus.
    #[inline]
    pub fn into_inner(self) -> B {
        self.bus
    }

    #[inline]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    #[inline]
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

impl<B: Bus> Transport<B> {
    /// Runs `f` inside one select/deselect bracket after sending the
    /// address and control phases.
    fn frame<R>(&mut self, address: u16, control: u8, f: impl FnOnce(&mut B) -> R) -> R {
        let mut header = [0; 2];
        NetworkEndian::write_u16(&mut header, address);
        self.bus.select();
        self.bus.transfer(header[0]);
        self.bus.transfer(header[1]);
        self.bus.transfer(control);
        let r = f(&mut self.bus);
        self.bus.deselect();
        r
    }

    pub fn read_u8(&mut self, address: u16, control: u8) -> u8 {
        self.frame(address, control, |bus| bus.transfer(0))
    }

    pub fn write_u8(&mut self, address: u16, control: u8, value: u8) {
        self.frame(address, control | RWB_WRITE, |bus| {
            bus.transfer(value);
        })
    }

    pub fn read_u16(&mut self, address: u16, control: u8) -> u16 {
        let mut b = [0; 2];
        self.read(address, control, &mut b);
        NetworkEndian::read_u16(&b)
    }

    pub fn write_u16(&mut self, address: u16, control: u8, value: u16) {
        let mut b = [0; 2];
        NetworkEndian::write_u16(&mut b, value);
        self.write(address, control, &b)
    }

    pub fn read(&mut self, address: u16, control: u8, buf: &mut [u8]) {
        self.frame(address, control, |bus| {
            for b in buf.iter_mut() {
                *b = bus.transfer(0);
            }
        })
    }

    pub fn write(&mut self, address: u16, control: u8, data: &[u8]) {
        self.frame(address, control | RWB_WRITE, |bus| {
            for &b in data {
                bus.transfer(b);
            }
        })
    }

    /// Writes `count` copies of `value` starting at `address`.
    pub fn fill(&mut self, address: u16, control: u8, value: u8, count: u16) {
        self.frame(address, control | RWB_WRITE, |bus| {
            for _ in 0..count {
                bus.transfer(value);
            }
        })
    }
}
