#![no_std]
#![no_main]

//! Trigger shims. Each program reads the fields its site exposes, stamps them and
//! forwards a fixed-size event to user space; no decision is made here.

mod probes;

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
