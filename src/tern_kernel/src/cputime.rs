//! High-resolution CPU time
//!
//! The cputime counter is a free-running 32-bit counter provided by
//! [`PortTimer`] that is independent of the OS tick. Conversions to time
//! units are exact when [`KernelCfg::CPUTIME_FREQ`] is 1 MHz.
use core::hint::spin_loop;

use crate::{time::tick_lt, KernelCfg, PortTimer};

/// Read the cputime counter.
#[inline]
pub fn get32<Traits: PortTimer>() -> u32 {
    // Safety: Reading the counter has no side effects
    unsafe { Traits::cputime_get32() }
}

/// The longest span [`tick_lt`] can tell apart from a wrapped-around one.
const MAX_SPAN: u32 = i32::MAX as u32;

const fn saturate(x: u64) -> u32 {
    if x > u32::MAX as u64 {
        u32::MAX
    } else {
        x as u32
    }
}

const fn usecs_to_ticks64(usecs: u32, freq: u32) -> u64 {
    (usecs as u64 * freq as u64).div_ceil(1_000_000)
}

/// Convert microseconds to cputime ticks, rounding up. Saturates at
/// `u32::MAX`.
pub const fn usecs_to_ticks_with(usecs: u32, freq: u32) -> u32 {
    if freq == 1_000_000 {
        usecs
    } else {
        saturate(usecs_to_ticks64(usecs, freq))
    }
}

/// Convert cputime ticks to microseconds, rounding down. Saturates at
/// `u32::MAX`.
pub const fn ticks_to_usecs_with(ticks: u32, freq: u32) -> u32 {
    if freq == 1_000_000 {
        ticks
    } else {
        saturate(ticks as u64 * 1_000_000 / freq as u64)
    }
}

/// Convert nanoseconds to cputime ticks, rounding up. Saturates at
/// `u32::MAX`.
pub const fn nsecs_to_ticks_with(nsecs: u32, freq: u32) -> u32 {
    saturate((nsecs as u64 * freq as u64).div_ceil(1_000_000_000))
}

/// Convert cputime ticks to nanoseconds, rounding down. Saturates at
/// `u32::MAX`.
pub const fn ticks_to_nsecs_with(ticks: u32, freq: u32) -> u32 {
    saturate(ticks as u64 * 1_000_000_000 / freq as u64)
}

#[inline]
pub fn usecs_to_ticks<Traits: KernelCfg>(usecs: u32) -> u32 {
    usecs_to_ticks_with(usecs, Traits::CPUTIME_FREQ)
}

#[inline]
pub fn ticks_to_usecs<Traits: KernelCfg>(ticks: u32) -> u32 {
    ticks_to_usecs_with(ticks, Traits::CPUTIME_FREQ)
}

#[inline]
pub fn nsecs_to_ticks<Traits: KernelCfg>(nsecs: u32) -> u32 {
    nsecs_to_ticks_with(nsecs, Traits::CPUTIME_FREQ)
}

#[inline]
pub fn ticks_to_nsecs<Traits: KernelCfg>(ticks: u32) -> u32 {
    ticks_to_nsecs_with(ticks, Traits::CPUTIME_FREQ)
}

/// Busy-wait for at least `ticks` cputime ticks. This doesn't yield the
/// processor.
pub fn delay_ticks<Traits: PortTimer>(ticks: u32) {
    delay_ticks64::<Traits>(ticks as u64);
}

/// Busy-wait for at least `usecs` microseconds. This doesn't yield the
/// processor.
pub fn delay_usecs<Traits: PortTimer + KernelCfg>(usecs: u32) {
    delay_ticks64::<Traits>(usecs_to_ticks64(usecs, Traits::CPUTIME_FREQ));
}

fn delay_ticks64<Traits: PortTimer>(mut ticks: u64) {
    while ticks > 0 {
        let span = if ticks > MAX_SPAN as u64 {
            MAX_SPAN
        } else {
            ticks as u32
        };
        spin_for::<Traits>(span);
        ticks -= span as u64;
    }
}

/// `span` must not exceed [`MAX_SPAN`].
fn spin_for<Traits: PortTimer>(span: u32) {
    let until = get32::<Traits>().wrapping_add(span);
    while tick_lt(get32::<Traits>(), until) {
        spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[quickcheck]
    fn identity_at_1mhz(x: u32) -> bool {
        usecs_to_ticks_with(x, 1_000_000) == x && ticks_to_usecs_with(x, 1_000_000) == x
    }

    #[test]
    fn rounding_direction() {
        // 32768 Hz: one tick is ~30.5 µs
        assert_eq!(usecs_to_ticks_with(1, 32768), 1);
        assert_eq!(usecs_to_ticks_with(31, 32768), 2);
        assert_eq!(ticks_to_usecs_with(1, 32768), 30);
        assert_eq!(ticks_to_usecs_with(32768, 32768), 1_000_000);
        assert_eq!(nsecs_to_ticks_with(1, 1_000_000), 1);
        assert_eq!(ticks_to_nsecs_with(3, 1_000_000), 3000);
    }

    #[quickcheck]
    fn usecs_to_ticks_never_undershoots(usecs: u32, freq: u32) -> bool {
        let usecs = usecs % 1_000_000;
        let freq = freq % 100_000_000 + 1;
        let ticks = usecs_to_ticks_with(usecs, freq) as u64;
        ticks * 1_000_000 >= usecs as u64 * freq as u64
            && (ticks == 0 || (ticks - 1) * 1_000_000 < usecs as u64 * freq as u64)
    }

    #[test]
    fn conversions_saturate() {
        // 300 s at 16 MHz is 4.8e9 ticks
        assert_eq!(usecs_to_ticks_with(300_000_000, 16_000_000), u32::MAX);
        assert_eq!(nsecs_to_ticks_with(u32::MAX, 4_000_000_000), u32::MAX);
        assert_eq!(ticks_to_nsecs_with(u32::MAX, 1_000_000), u32::MAX);
        assert_eq!(ticks_to_usecs_with(u32::MAX, 32768), u32::MAX);
    }

    /// A cputime counter that advances by `STEP` on every read, so that long
    /// delays finish after a few iterations. `READS` counts the reads to
    /// measure delays that exceed the counter's range.
    struct FastClock;

    const STEP: u64 = 1 << 28;
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    static READS: AtomicU32 = AtomicU32::new(0);

    unsafe impl PortTimer for FastClock {
        unsafe fn cputime_get32() -> u32 {
            READS.fetch_add(1, Ordering::Relaxed);
            COUNTER.fetch_add(STEP as u32, Ordering::Relaxed)
        }
    }

    impl KernelCfg for FastClock {
        const CPUTIME_FREQ: u32 = 16_000_000;
    }

    /// The counter's advance from the first read in `f` to the last one.
    fn elapsed_during(f: impl FnOnce()) -> u64 {
        let before = READS.load(Ordering::Relaxed);
        f();
        (READS.load(Ordering::Relaxed) - before - 1) as u64 * STEP
    }

    // Both cases share `FastClock`'s counters
    #[test]
    fn long_delays_are_not_cut_short() {
        let elapsed = elapsed_during(|| delay_ticks::<FastClock>(u32::MAX));
        assert!(elapsed >= u32::MAX as u64, "{elapsed}");

        let elapsed = elapsed_during(|| delay_usecs::<FastClock>(300_000_000));
        assert!(elapsed >= 4_800_000_000, "{elapsed}");
    }
}
