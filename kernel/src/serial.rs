//! Serial port (COM1) output
//!
//! The serial line is the kernel's reporting channel: the console mirrors
//! into it, and panics print here even when everything else is wedged.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; the port is owned by
        // this Mutex for the kernel's lifetime.
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Write raw bytes to COM1.
pub fn write_bytes(bytes: &[u8]) {
    let mut port = SERIAL1.lock();
    for &b in bytes {
        port.send(b);
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(target_os = "none")]
    {
        use core::fmt::Write;
        x86_64::instructions::interrupts::without_interrupts(|| {
            SERIAL1
                .lock()
                .write_fmt(args)
                .expect("printing to serial failed");
        });
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = args;
    }
}
