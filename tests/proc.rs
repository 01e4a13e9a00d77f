mod common;

use common::*;
use kernel::error::Error::*;
use kernel::param::*;
use kernel::proc::ProcState;
use kernel::stat::Time;
use std::sync::Mutex;

fn running(ctx: &kernel::UserCtx) -> usize {
    ctx.kernel()
        .ps()
        .iter()
        .filter(|p| p.status == ProcState::Running)
        .count()
}

#[test]
fn init_exit_status_stops_the_machine() {
    let m = machine();
    let status = m.k.run(|ctx| {
        assert_eq!(running(ctx), 1);
        let pid = ctx.getpid();
        assert!(pid > 0);
        // init is its own parent
        assert_eq!(ctx.getppid(), pid);
        assert_eq!(ctx.wait(), Err(NoChildProcesses));
        assert_eq!(ctx.errno(), NoChildProcesses.errno());
        ctx.exit(3);
    });
    assert_eq!(status, 3 << 8);
}

#[test]
fn returning_from_init_is_exit_zero() {
    let m = machine();
    assert_eq!(m.k.run(|_| {}), 0);
}

#[test]
fn fork_exit_wait() {
    let m = machine();
    let status = m.k.run(|ctx| {
        let me = ctx.getpid();
        let child = ctx
            .fork(move |ctx| {
                assert_eq!(running(ctx), 1);
                assert_eq!(ctx.getppid(), me);
                ctx.exit(5);
            })
            .unwrap();
        assert_ne!(child, me);
        assert_eq!(ctx.wait(), Ok((child, 5 << 8)));
        assert_eq!(ctx.wait(), Err(NoChildProcesses));

        // A returning child exits with 0.
        let child = ctx.fork(|_| {}).unwrap();
        assert_eq!(ctx.wait(), Ok((child, 0)));
    });
    assert_eq!(status, 0);
}

#[test]
fn reaped_slots_are_reused() {
    let m = machine();
    m.k.run(|ctx| {
        let k = ctx.kernel().clone();
        let mut pids = Vec::new();
        for _ in 0..3 * PTABSIZE {
            let pid = ctx.fork(|ctx| ctx.exit(0)).unwrap();
            assert_eq!(ctx.wait().map(|(p, _)| p), Ok(pid));
            pids.push(pid);
        }
        pids.dedup();
        assert_eq!(pids.len(), 3 * PTABSIZE);
        let live = k.ps().iter().filter(|p| p.status != ProcState::Empty).count();
        assert_eq!(live, 1);
    });
}

#[test]
fn full_table_refuses_fork() {
    let m = machine();
    m.k.run(|ctx| {
        let mut n = 0;
        loop {
            match ctx.fork(|ctx| {
                let _ = ctx.pause();
            }) {
                Ok(_) => n += 1,
                Err(e) => {
                    assert_eq!(e, WouldBlock);
                    break;
                }
            }
        }
        assert_eq!(n, PTABSIZE - 1);
        ctx.exit(0);
    });
}

#[test]
fn orphans_go_to_init() {
    let m = machine();
    m.k.run(|ctx| {
        let init = ctx.getpid();
        let middle = ctx
            .fork(move |ctx| {
                ctx.fork(move |ctx| {
                    // Give init a turn before asking.
                    for _ in 0..MAXTICKS {
                        ctx.tick();
                    }
                    assert_eq!(ctx.getppid(), init);
                    ctx.exit(7);
                })
                .unwrap();
                ctx.exit(1);
            })
            .unwrap();
        let mut seen = Vec::new();
        while let Ok((pid, status)) = ctx.wait() {
            seen.push((pid == middle, status));
        }
        seen.sort();
        assert_eq!(seen, vec![(false, 7 << 8), (true, 1 << 8)]);
    });
}

static ORDER: Mutex<Vec<&str>> = Mutex::new(Vec::new());

#[test]
fn memory_survives_swapping() {
    let m = machine();
    let status = m.k.run(|ctx| {
        let at = 0x2000;
        ctx.poke(at, b"parent").unwrap();
        let child = ctx
            .fork(move |ctx| {
                // The child starts with a copy of the parent's memory.
                assert_eq!(ctx.peek(at, 6).unwrap(), b"parent");
                ctx.poke(at, b"child!").unwrap();
                ORDER.lock().unwrap().push("child");
                ctx.exit(0);
            })
            .unwrap();

        // Use up the time slice: the child gets the CPU and runs to
        // completion before the parent is swapped back in.
        for _ in 0..MAXTICKS {
            ctx.tick();
        }
        ORDER.lock().unwrap().push("parent");
        assert_eq!(ctx.peek(at, 6).unwrap(), b"parent");
        assert_eq!(ctx.wait(), Ok((child, 0)));

        let t = ctx.times().unwrap();
        assert!(t.utime.ticks() >= MAXTICKS as u32);
        assert!(t.etime.ticks() >= MAXTICKS as u32);
    });
    assert_eq!(status, 0);
    assert_eq!(*ORDER.lock().unwrap(), vec!["child", "parent"]);
    assert!(m.swap.writes() > 0);
}

#[test]
fn user_memory_is_bounded() {
    let m = machine();
    m.k.run(|ctx| {
        assert_eq!(ctx.poke(0, b"x"), Err(BadAddress));
        assert_eq!(ctx.peek((UDATA_ADDR - 1) as u16, 2), Err(BadAddress));
        assert!(ctx.peek(PROGBASE as u16, 16).is_ok());
    });
}

#[test]
fn brk_and_sbrk() {
    let m = machine();
    m.k.run(|ctx| {
        assert_eq!(ctx.brk(0x1000), Ok(()));
        assert_eq!(ctx.brk_addr(), 0x1000);
        assert_eq!(ctx.sbrk(0x100), Ok(0x1000));
        assert_eq!(ctx.brk_addr(), 0x1100);
        assert_eq!(ctx.brk(0x10), Err(OutOfMemory));
        assert_eq!(ctx.sbrk(0xffff), Err(OutOfMemory));
        assert_eq!(ctx.brk((UDATA_ADDR - 10) as u16), Err(OutOfMemory));
        assert_eq!(ctx.brk_addr(), 0x1100);
    });
}

#[test]
fn ids() {
    let m = machine();
    m.k.run(|ctx| {
        assert_eq!(ctx.getuid(), 0);
        ctx.stime(Time::from_secs(2000)).unwrap();
        ctx.setgid(7).unwrap();
        ctx.setuid(42).unwrap();
        assert_eq!((ctx.getuid(), ctx.getgid()), (42, 7));
        assert_eq!(ctx.setuid(0), Err(NotPermitted));
        assert_eq!(ctx.stime(Default::default()), Err(NotPermitted));
        assert_eq!(ctx.time().unwrap().secs(), 2000);

        // Children inherit the ids.
        ctx.fork(|ctx| {
            let ok = ctx.getuid() == 42 && ctx.getgid() == 7;
            ctx.exit(ok as u16);
        })
        .unwrap();
        assert_eq!(ctx.wait().map(|(_, s)| s), Ok(1 << 8));
    });
}
