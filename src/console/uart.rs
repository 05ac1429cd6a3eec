//! Low-level driver routines for a 16550a UART (spec.md §8 — external
//! collaborator, kept to the minimum needed to type-check and to give
//! the console layer somewhere to read/write bytes).
#![allow(non_upper_case_globals)]

use crate::console::consoleintr;
use crate::proc::scheduler::wakeup;
use crate::queue::Queue;
use crate::sync::spinlock::Spinlock;
use core::ptr::addr_of;

const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1;
const LCR_EIGHT_BITS: u8 = 3;
const LCR_BAUD_LATCH: u8 = 1 << 7;
const LSR_RX_READY: u8 = 1 << 0;
const LSR_TX_IDLE: u8 = 1 << 5;

pub static UART0: Uart = Uart::new(crate::riscv::memlayout::UART0 as usize);

enum Register {
    ReceiveHolding,
    TransmitHolding,
    InterruptEnable,
    FIFOControl,
    LineControl,
    LineStatus,
}
impl Register {
    fn offset(&self) -> usize {
        match self {
            Register::ReceiveHolding | Register::TransmitHolding => 0,
            Register::InterruptEnable => 1,
            Register::FIFOControl => 2,
            Register::LineControl => 3,
            Register::LineStatus => 5,
        }
    }
    fn ptr(&self, base: usize) -> *mut u8 {
        (base + self.offset()) as *mut u8
    }
    fn read(&self, base: usize) -> u8 {
        unsafe { self.ptr(base).read_volatile() }
    }
    fn write(&self, base: usize, value: u8) {
        unsafe { self.ptr(base).write_volatile(value) }
    }
}

pub struct Uart {
    base_address: usize,
    buffer: Spinlock,
    queue: core::cell::UnsafeCell<Queue<u8>>,
}
unsafe impl Sync for Uart {}

impl Uart {
    pub const fn new(base_address: usize) -> Uart {
        Uart {
            base_address,
            buffer: Spinlock::new("uart"),
            queue: core::cell::UnsafeCell::new(Queue::new()),
        }
    }

    /// Initialize the UART: 8N1 at 38.4K, FIFOs on, RX/TX interrupts on.
    pub unsafe fn initialize(&self) {
        Register::InterruptEnable.write(self.base_address, 0x00);
        Register::LineControl.write(self.base_address, LCR_BAUD_LATCH);
        *(self.base_address as *mut u8) = 0x03;
        *((self.base_address + 1) as *mut u8) = 0x00;
        Register::LineControl.write(self.base_address, LCR_EIGHT_BITS);
        Register::FIFOControl.write(self.base_address, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);
        Register::InterruptEnable.write(self.base_address, IER_TX_ENABLE | IER_RX_ENABLE);
    }

    pub fn interrupt(&self) {
        while let Some(b) = self.read_byte() {
            consoleintr(b);
        }
        self.send_buffered_bytes();
    }

    pub fn read_byte(&self) -> Option<u8> {
        if Register::LineStatus.read(self.base_address) & LSR_RX_READY != 0 {
            Some(Register::ReceiveHolding.read(self.base_address))
        } else {
            None
        }
    }

    /// Write one byte with no buffering or interrupts; used for kernel
    /// printing, which must work even with interrupts disabled.
    pub fn write_byte(&self, b: u8) {
        while Register::LineStatus.read(self.base_address) & LSR_TX_IDLE == 0 {
            core::hint::spin_loop();
        }
        Register::TransmitHolding.write(self.base_address, b);
    }

    pub fn write_slice(&self, bytes: &[u8]) {
        for b in bytes {
            self.write_byte(*b);
        }
    }

    /// Write a byte through the output queue, sleeping if it's full.
    /// Must not be called from an interrupt handler.
    pub fn write_byte_buffered(&self, b: u8) {
        let mut guard = self.buffer.lock();
        while unsafe { &*self.queue.get() }.space_remaining() == 0 {
            guard = guard.sleep(addr_of!(*self).cast_mut().cast());
        }
        unsafe { &mut *self.queue.get() }
            .push_back(b)
            .expect("space in the uart queue");
        drop(guard);
        self.send_buffered_bytes();
    }

    pub fn write_slice_buffered(&self, bytes: &[u8]) {
        for b in bytes {
            self.write_byte_buffered(*b);
        }
    }

    fn send_buffered_bytes(&self) {
        let _guard = self.buffer.lock();
        let queue = unsafe { &mut *self.queue.get() };
        loop {
            if Register::LineStatus.read(self.base_address) & LSR_TX_IDLE == 0 {
                return;
            }
            let Some(b) = queue.pop_front() else {
                return;
            };
            unsafe {
                wakeup(addr_of!(*self).cast_mut().cast());
            }
            Register::TransmitHolding.write(self.base_address, b);
        }
    }
}
