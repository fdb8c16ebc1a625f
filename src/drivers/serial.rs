/*
 * 16550 UART Serial Driver
 *
 * Byte sink for kernel diagnostics. The logger writes every record through
 * COM1; nothing in the core reads from the port. Initialization programs
 * 115200 baud, 8N1, FIFOs on.
 */

use core::fmt;

use spin::Mutex;
use x86_64::instructions::port::Port;

/// COM1 base I/O port.
const COM1_BASE: u16 = 0x3F8;

/// A 16550-compatible UART addressed through port I/O.
pub struct SerialPort {
    data: Port<u8>,
    int_en: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_sts: Port<u8>,
}

/// Line status bit: transmit holding register empty.
const LINE_STS_OUTPUT_EMPTY: u8 = 1 << 5;

impl SerialPort {
    pub const fn new(base: u16) -> SerialPort {
        SerialPort {
            data: Port::new(base),
            int_en: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_sts: Port::new(base + 5),
        }
    }

    /// Program the UART: divisor for 115200 baud, 8 data bits, no parity,
    /// one stop bit, FIFOs enabled and cleared.
    pub fn init(&mut self) {
        unsafe {
            self.int_en.write(0x00); // no UART interrupts
            self.line_ctrl.write(0x80); // DLAB on
            self.data.write(0x01); // divisor low: 115200 baud
            self.int_en.write(0x00); // divisor high
            self.line_ctrl.write(0x03); // 8N1, DLAB off
            self.fifo_ctrl.write(0xC7); // FIFO on, clear, 14-byte threshold
            self.modem_ctrl.write(0x0B); // DTR + RTS + OUT2
        }
    }

    fn wait_for_transmit(&mut self) {
        unsafe { while self.line_sts.read() & LINE_STS_OUTPUT_EMPTY == 0 {} }
    }

    /// Send one byte, expanding '\n' to "\r\n" for terminal consumers.
    pub fn send(&mut self, byte: u8) {
        if byte == b'\n' {
            self.wait_for_transmit();
            unsafe { self.data.write(b'\r') };
        }
        self.wait_for_transmit();
        unsafe { self.data.write(byte) };
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

/// The COM1 port used by the logger.
pub static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));

/// Initialize the serial console. Must run before the logger is installed.
pub fn init() {
    SERIAL1.lock().init();
}

/// Print formatted output to COM1.
///
/// Interrupts are disabled around the lock so an interrupt handler logging
/// mid-write cannot deadlock against the interrupted writer.
pub fn print(args: fmt::Arguments) {
    use core::fmt::Write;

    x86_64::instructions::interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}
