//! COM1 serial console.
//!
//! Once initialised this registers itself as the klog backend, replacing
//! the raw early-boot COM1 path with a locked one.

use core::fmt::{self, Write};

use uart_16550::SerialPort;

use vtprobe_lib::{InitFlag, IrqMutex, klog, klog_info};

const COM1_BASE: u16 = 0x3F8;

// SAFETY: 0x3F8 is the standard COM1 base port.
static SERIAL: IrqMutex<SerialPort> = IrqMutex::new(unsafe { SerialPort::new(COM1_BASE) });
static SERIAL_INIT: InitFlag = InitFlag::new();

pub fn init() {
    if !SERIAL_INIT.init_once() {
        return;
    }

    SERIAL.lock().init();
    klog::klog_register_backend(serial_klog_backend);
    klog_info!("serial: COM1 console ready");
}

/// klog backend: one lock acquisition per log line, so lines from
/// different contexts do not interleave.
fn serial_klog_backend(args: fmt::Arguments<'_>) {
    let mut port = SERIAL.lock();
    let _ = port.write_fmt(args);
    let _ = port.write_str("\n");
}
