//! Raw console device.
//!
//! Byte-at-a-time terminal model over arbitrary host streams.  As with the
//! disk, hardware interrupts collapse to completion callbacks fired inline:
//! `fetch_char` pulls the next input byte into the device register and
//! signals read-avail, `put_char` emits one byte and signals write-done.

use std::io::{Read, Write};

pub struct Console {
    input: spin::Mutex<Box<dyn Read + Send>>,
    output: spin::Mutex<Box<dyn Write + Send>>,
    incoming: spin::Mutex<Option<u8>>,
}

impl Console {
    pub fn new(input: Box<dyn Read + Send>, output: Box<dyn Write + Send>) -> Self {
        Self {
            input: spin::Mutex::new(input),
            output: spin::Mutex::new(output),
            incoming: spin::Mutex::new(None),
        }
    }

    /// Pull the next input byte into the device register.  End of input
    /// reads as NUL.  `avail` plays the read-avail interrupt.
    pub fn fetch_char(&self, avail: impl FnOnce()) {
        let mut byte = [0u8; 1];
        let got = {
            let mut input = self.input.lock();
            matches!(input.read(&mut byte), Ok(1))
        };
        *self.incoming.lock() = Some(if got { byte[0] } else { 0 });
        avail();
    }

    /// Take the byte latched by the last `fetch_char`.
    pub fn get_char(&self) -> u8 {
        self.incoming
            .lock()
            .take()
            .expect("console read with no char available")
    }

    /// Emit one byte.  `done` plays the write-done interrupt.
    pub fn put_char(&self, byte: u8, done: impl FnOnce()) {
        {
            let mut output = self.output.lock();
            output.write_all(&[byte]).expect("console write failed");
            let _ = output.flush();
        }
        done();
    }
}
