//! System call surface.
//!
//! The numbered table is the ABI between user-mode tasks and the kernel.
//! The mode-switch entry in `arch` saves the caller's register file, swaps
//! in the kernel self block, dispatches through [`dispatch`], stores the
//! result in the caller's saved return register and restores. On the host
//! the user wrappers call [`dispatch`] directly, which keeps the whole
//! table exercisable by unit tests.

use crate::kstat::{KernelStats, NetStats};
use crate::sched::{self, AlarmSpec};
use crate::sync::Completion;

pub const SYS_WAIT: usize = 0;
pub const SYS_WAKE: usize = 1;
pub const SYS_SLEEP: usize = 2;
pub const SYS_YIELD: usize = 3;
pub const SYS_EVENT_SET: usize = 4;
pub const SYS_EVENT_WAIT: usize = 5;
pub const SYS_ALARM: usize = 6;
pub const SYS_UTT_DONE: usize = 7;
pub const SYS_RESET: usize = 8;
pub const SYS_KSTAT: usize = 9;
pub const SYS_NETSTAT: usize = 10;

type SyscallFn = fn(usize) -> i32;

/// Numbering is part of the ABI; slots must not move.
static SYSCALL_TABLE: [SyscallFn; 11] = [
    sys_wait,       // 0
    sys_wake,       // 1
    sys_sleep,      // 2
    sys_yield,      // 3
    sys_event_set,  // 4
    sys_event_wait, // 5
    sys_alarm,      // 6
    sys_utt_done,   // 7
    sys_reset,      // 8
    sys_kstat,      // 9
    sys_netstat,    // 10
];

/// Central dispatch. Out-of-range numbers return -1.
pub fn dispatch(num: usize, arg: usize) -> i32 {
    match SYSCALL_TABLE.get(num) {
        Some(f) => f(arg),
        None => {
            crate::kprintln!("invalid syscall: {:#x}", num);
            -1
        }
    }
}

fn sys_wait(arg: usize) -> i32 {
    if arg == 0 {
        return -1;
    }
    // SAFETY: the caller passed a live completion; the address space is
    // flat, so the pointer is usable as-is.
    let c = unsafe { &*(arg as *const Completion) };
    sched::wait_on(c)
}

fn sys_wake(arg: usize) -> i32 {
    if arg == 0 {
        return -1;
    }
    // SAFETY: as for sys_wait.
    let c = unsafe { &*(arg as *const Completion) };
    sched::wake_all(c)
}

/// The argument is in ticks: the caller does the ms conversion so the
/// kernel fast path carries no division.
fn sys_sleep(arg: usize) -> i32 {
    sched::sleep_ticks(arg as u32)
}

fn sys_yield(_arg: usize) -> i32 {
    sched::request_schedule();
    0
}

fn sys_event_set(arg: usize) -> i32 {
    sched::event_set(arg as u32)
}

fn sys_event_wait(arg: usize) -> i32 {
    sched::event_wait(arg as u32)
}

fn sys_alarm(arg: usize) -> i32 {
    if arg == 0 {
        return -1;
    }
    // SAFETY: as for sys_wait.
    let spec = unsafe { &*(arg as *const AlarmSpec) };
    sched::set_alarm(spec)
}

fn sys_utt_done(_arg: usize) -> i32 {
    sched::alarm_done()
}

fn sys_reset(_arg: usize) -> i32 {
    crate::arch_reset();
    0
}

/// Copy kernel statistics into the caller's record. The record size is
/// fixed by the ABI type, so the copy is bounded.
fn sys_kstat(arg: usize) -> i32 {
    if arg == 0 {
        return -1;
    }
    // SAFETY: the caller passed a properly sized stats record.
    let out = unsafe { &mut *(arg as *mut KernelStats) };
    crate::kstat::kstat_get(out)
}

/// Copy the first interface's name and counters into the caller's record.
fn sys_netstat(arg: usize) -> i32 {
    if arg == 0 {
        return -1;
    }
    // SAFETY: as for sys_kstat.
    let out = unsafe { &mut *(arg as *mut NetStats) };
    crate::kstat::netstat_get(out)
}

/// The in-kernel destination the alarm machinery points a task at. Runs
/// the user handler in the task's own context, then parks on `utt_done`
/// until the scheduler restores the pre-alarm continuation.
pub extern "C" fn alarm_trampoline(handler: fn()) {
    handler();
    loop {
        let _ = user::utt_done();
    }
}

// ── User-side wrappers ──────────────────────────────────────────────────────

pub mod user {
    use super::*;
    use crate::time::ms_to_ticks;

    #[cfg(target_arch = "arm")]
    fn raw_syscall(num: usize, arg: usize) -> i32 {
        let ret: i32;
        // r0 carries the number in and the result out; r1 the argument.
        unsafe {
            core::arch::asm!(
                "svc #0",
                inout("r0") num => ret,
                in("r1") arg,
                options(nostack),
            );
        }
        ret
    }

    #[cfg(not(target_arch = "arm"))]
    fn raw_syscall(num: usize, arg: usize) -> i32 {
        super::dispatch(num, arg)
    }

    pub fn wait(c: &Completion) -> i32 {
        raw_syscall(SYS_WAIT, c as *const Completion as usize)
    }

    pub fn wake(c: &Completion) -> i32 {
        raw_syscall(SYS_WAKE, c as *const Completion as usize)
    }

    /// Sleep for `ms` milliseconds. The tick conversion happens here, on
    /// the caller's side of the trap.
    pub fn sleep(ms: u32) -> i32 {
        raw_syscall(SYS_SLEEP, ms_to_ticks(ms) as usize)
    }

    pub fn yield_now() -> i32 {
        raw_syscall(SYS_YIELD, 0)
    }

    pub fn event_set(mask: u32) -> i32 {
        raw_syscall(SYS_EVENT_SET, mask as usize)
    }

    pub fn event_wait(mask: u32) -> i32 {
        raw_syscall(SYS_EVENT_WAIT, mask as usize)
    }

    pub fn alarm(spec: &AlarmSpec) -> i32 {
        raw_syscall(SYS_ALARM, spec as *const AlarmSpec as usize)
    }

    pub fn utt_done() -> i32 {
        raw_syscall(SYS_UTT_DONE, 0)
    }

    pub fn reset() -> i32 {
        raw_syscall(SYS_RESET, 0)
    }

    pub fn kstat(out: &mut KernelStats) -> i32 {
        raw_syscall(SYS_KSTAT, out as *mut KernelStats as usize)
    }

    pub fn netstat(out: &mut NetStats) -> i32 {
        raw_syscall(SYS_NETSTAT, out as *mut NetStats as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{TaskMode, TaskState};
    use crate::testutil::kernel_lock;
    use crate::time;

    fn noop() {}

    #[test]
    fn out_of_range_number_fails() {
        let _g = kernel_lock();
        crate::sched::reset_for_test();
        assert_eq!(dispatch(11, 0), -1);
        assert_eq!(dispatch(usize::MAX, 0), -1);
    }

    #[test]
    fn null_pointer_arguments_fail() {
        let _g = kernel_lock();
        crate::sched::reset_for_test();
        assert_eq!(dispatch(SYS_WAIT, 0), -1);
        assert_eq!(dispatch(SYS_WAKE, 0), -1);
        assert_eq!(dispatch(SYS_ALARM, 0), -1);
        assert_eq!(dispatch(SYS_KSTAT, 0), -1);
        assert_eq!(dispatch(SYS_NETSTAT, 0), -1);
    }

    #[test]
    fn sleep_parks_with_tick_deadline() {
        let _g = kernel_lock();
        crate::sched::reset_for_test();
        crate::sched::sched_init().unwrap();
        let a = crate::sched::spawn(noop, "a", TaskMode::System).unwrap();
        crate::sched::set_current_for_test(a);

        time::set_ticks_for_test(500);
        // user::sleep converts ms → ticks before trapping.
        assert_eq!(user::sleep(1000), 0);
        assert_eq!(crate::sched::task_state(a), Some(TaskState::Sleep));
        assert_eq!(crate::sched::task_wakeup(a), Some(600));
    }

    #[test]
    fn wait_and_wake_round_trip() {
        let _g = kernel_lock();
        crate::sched::reset_for_test();
        crate::sched::sched_init().unwrap();
        let a = crate::sched::spawn(noop, "a", TaskMode::System).unwrap();
        crate::sched::set_current_for_test(a);

        let c = Completion::new(4);
        assert_eq!(user::wait(&c), 0);
        assert_eq!(crate::sched::task_state(a), Some(TaskState::Sleep));
        assert_eq!(user::wake(&c), 0);
        assert_eq!(crate::sched::task_state(a), Some(TaskState::Run));
    }

    #[test]
    fn kstat_copies_counters() {
        let _g = kernel_lock();
        crate::sched::reset_for_test();
        let mut stats = KernelStats::default();
        assert_eq!(user::kstat(&mut stats), 0);
    }
}
