//! Shared test plumbing: a machine wired to a capturable console.

use rill::{Host, HostStream, Machine, MemoryStream};
use std::cell::RefCell;
use std::rc::Rc;

/// Console handle shared between the machine and the test.
pub struct SharedConsole(pub Rc<RefCell<MemoryStream>>);

impl HostStream for SharedConsole {
    fn write_str(&mut self, s: &str) {
        self.0.borrow_mut().write_str(s);
    }
    fn read_byte(&mut self) -> Option<u8> {
        self.0.borrow_mut().read_byte()
    }
    fn peek_byte(&mut self) -> Option<u8> {
        self.0.borrow_mut().peek_byte()
    }
    fn available(&self) -> usize {
        self.0.borrow().available()
    }
    fn read_line(&mut self) -> Option<String> {
        self.0.borrow_mut().read_line()
    }
    fn set_timeout_ms(&mut self, ms: u32) {
        self.0.borrow_mut().set_timeout_ms(ms);
    }
    fn timeout_ms(&self) -> u32 {
        self.0.borrow().timeout_ms()
    }
}

/// A fresh machine plus a handle on its console stream.
pub fn machine() -> (Machine, Rc<RefCell<MemoryStream>>) {
    let console = Rc::new(RefCell::new(MemoryStream::new()));
    let mut host = Host::default();
    host.console = Box::new(SharedConsole(Rc::clone(&console)));
    (Machine::new(host), console)
}

/// Console output so far.
pub fn output(console: &Rc<RefCell<MemoryStream>>) -> String {
    console.borrow().output.clone()
}

/// Drop output collected so far.
pub fn clear_output(console: &Rc<RefCell<MemoryStream>>) {
    console.borrow_mut().output.clear();
}
