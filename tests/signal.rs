mod common;

use common::*;
use kernel::error::Error::*;
use kernel::param::*;
use kernel::signal::*;
use kernel::{SigAction, UserCtx};
use std::sync::atomic::{AtomicU16, Ordering};

static CAUGHT: AtomicU16 = AtomicU16::new(0);

fn on_int(_ctx: &mut UserCtx, sig: u16) {
    CAUGHT.fetch_add(sig, Ordering::SeqCst);
}

#[test]
fn caught_signal_runs_once() {
    let m = machine();
    m.k.run(|ctx| {
        let child = ctx
            .fork(|ctx| {
                assert_eq!(ctx.signal(SIGINT, SigAction::Catch(on_int)), Ok(SIG_DFL));
                let pid = ctx.getpid() as i16;
                ctx.kill(pid, SIGINT as i16).unwrap();
                assert_eq!(CAUGHT.load(Ordering::SeqCst), SIGINT);

                // The handler was a one-shot: this one kills.
                ctx.kill(pid, SIGINT as i16).unwrap();
                ctx.exit(1);
            })
            .unwrap();
        assert_eq!(ctx.wait(), Ok((child, SIGINT)));
    });
    assert_eq!(CAUGHT.load(Ordering::SeqCst), SIGINT);
}

#[test]
fn dispositions() {
    let m = machine();
    m.k.run(|ctx| {
        assert_eq!(ctx.signal(SIGKILL, SigAction::Ignore), Err(InvalidArgument));
        assert_eq!(ctx.signal(0, SigAction::Ignore), Err(InvalidArgument));
        assert_eq!(ctx.signal(NSIGS as u16, SigAction::Default), Err(InvalidArgument));

        assert_eq!(ctx.signal(SIGTERM, SigAction::Ignore), Ok(SIG_DFL));
        let addr = ctx.signal(SIGTERM, SigAction::Catch(on_int)).unwrap();
        assert_eq!(addr, SIG_IGN);
        let addr = ctx.signal(SIGTERM, SigAction::Ignore).unwrap();
        assert!(addr as usize >= PROGBASE);

        // Ignored signals are never posted, and children inherit that.
        let pid = ctx.getpid() as i16;
        ctx.kill(pid, SIGTERM as i16).unwrap();
        ctx.fork(|ctx| {
            let pid = ctx.getpid() as i16;
            ctx.kill(pid, SIGTERM as i16).unwrap();
            ctx.exit(4);
        })
        .unwrap();
        assert_eq!(ctx.wait().map(|(_, s)| s), Ok(4 << 8));
    });
}

#[test]
fn kill_checks_its_arguments() {
    let m = machine();
    m.k.run(|ctx| {
        let pid = ctx.getpid() as i16;
        assert_eq!(ctx.kill(pid, 0), Err(InvalidArgument));
        assert_eq!(ctx.kill(pid, 16), Err(InvalidArgument));
        assert_eq!(ctx.kill(999, SIGTERM as i16), Err(InvalidArgument));
        assert_eq!(ctx.errno(), InvalidArgument.errno());
    });
}

#[test]
fn kill_wakes_a_paused_process() {
    let m = machine();
    m.k.run(|ctx| {
        let child = ctx
            .fork(|ctx| {
                let _ = ctx.pause();
                ctx.exit(1);
            })
            .unwrap();
        // Let the child get as far as pause().
        for _ in 0..MAXTICKS {
            ctx.tick();
        }
        ctx.kill(child as i16, SIGTERM as i16).unwrap();
        assert_eq!(ctx.wait(), Ok((child, SIGTERM)));
    });
}

static WOKEN: AtomicU16 = AtomicU16::new(0);

fn on_wake(_ctx: &mut UserCtx, sig: u16) {
    WOKEN.store(sig, Ordering::SeqCst);
}

#[test]
fn signal_interrupts_wait() {
    let m = machine();
    m.k.run(|ctx| {
        ctx.signal(SIGHUP, SigAction::Catch(on_wake)).unwrap();
        let child = ctx
            .fork(|ctx| {
                let ppid = ctx.getppid() as i16;
                ctx.kill(ppid, SIGHUP as i16).unwrap();
                loop {
                    let _ = ctx.pause();
                }
            })
            .unwrap();
        assert_eq!(ctx.wait(), Err(Interrupted));
        assert_eq!(WOKEN.load(Ordering::SeqCst), SIGHUP);

        ctx.kill(child as i16, SIGKILL as i16).unwrap();
        assert_eq!(ctx.wait(), Ok((child, SIGKILL)));
    });
}

static ALARMS: AtomicU16 = AtomicU16::new(0);

fn on_alarm(_ctx: &mut UserCtx, _sig: u16) {
    ALARMS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn alarm_ends_pause() {
    let m = machine();
    m.k.run(|ctx| {
        assert_eq!(ctx.alarm(5), 0);
        assert_eq!(ctx.alarm(0), 5);

        ctx.signal(SIGALRM, SigAction::Catch(on_alarm)).unwrap();
        assert_eq!(ctx.alarm(2), 0);
        assert_eq!(ctx.pause(), Err(Interrupted));
        assert_eq!(ALARMS.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.time().unwrap().secs(), 1002);
    });
}

#[test]
fn default_alarm_kills() {
    let m = machine();
    m.k.run(|ctx| {
        let child = ctx
            .fork(|ctx| {
                ctx.alarm(1);
                let _ = ctx.pause();
                ctx.exit(1);
            })
            .unwrap();
        assert_eq!(ctx.wait(), Ok((child, SIGALRM)));
    });
}

#[test]
#[should_panic(expected = "no runnable process")]
fn pause_with_nothing_to_wait_for() {
    let m = machine();
    m.k.run(|ctx| {
        let _ = ctx.pause();
    });
}
