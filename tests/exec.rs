mod common;

use common::*;
use kernel::error::Error::*;
use kernel::param::*;
use kernel::signal::*;
use kernel::{Program, SigAction, UserCtx};
use std::sync::Mutex;

const SHOW: u16 = 0x10;
const INIT: u16 = 0x11;
const BIG: u16 = 0x12;

static SEEN: Mutex<Vec<(Vec<String>, Vec<String>)>> = Mutex::new(Vec::new());

fn show(ctx: &mut UserCtx) {
    SEEN.lock().unwrap().push(ctx.args());
    ctx.exit(9);
}

fn programs() -> kernel::mkfs::FsImg {
    let mut fsimg = image();
    fsimg.add_exec(ROOTINODE, "show", SHOW, 100).unwrap();
    fsimg.add_exec(ROOTINODE, "nobody", 0x7777, 100).unwrap();
    fsimg.add_exec(ROOTINODE, "big", BIG, 40 * BSIZE).unwrap();
    fsimg
        .add_file(ROOTINODE, "script", 0o755, b"#!/bin/sh\n")
        .unwrap();
    fsimg.add_file(ROOTINODE, "data", 0o644, &[EMAGIC, 0x10, 0]).unwrap();
    fsimg
}

fn noop(_ctx: &mut UserCtx, _sig: u16) {}

#[test]
fn exec_passes_arguments() {
    let m = machine_with(programs(), &[(SHOW, show as Program)]);
    let status = m.k.run(|ctx| {
        let child = ctx
            .fork(|ctx| {
                ctx.signal(SIGINT, SigAction::Catch(noop)).unwrap();
                ctx.signal(SIGQUIT, SigAction::Ignore).unwrap();
                let e = ctx.execve("/show", &["show", "-l", "/tmp"], &["HOME=/", "TERM=uzi"]);
                panic!("exec failed: {}", e);
            })
            .unwrap();
        assert_eq!(ctx.wait(), Ok((child, 9 << 8)));
    });
    assert_eq!(status, 0);
    let seen = SEEN.lock().unwrap();
    assert!(seen.contains(&(
        vec!["show".to_string(), "-l".to_string(), "/tmp".to_string()],
        vec!["HOME=/".to_string(), "TERM=uzi".to_string()],
    )));
}

fn check_image(ctx: &mut UserCtx) {
    // Caught signals went back to the default, ignored ones stay ignored.
    let old = ctx.signal(SIGINT, SigAction::Default).unwrap();
    let ign = ctx.signal(SIGQUIT, SigAction::Default).unwrap();
    // The whole file is in memory and the break sits right after it.
    let end = PROGBASE + 41 * BSIZE;
    let ok = old == SIG_DFL
        && ign == SIG_IGN
        && ctx.peek(PROGBASE as u16, 3).unwrap() == [EMAGIC, BIG as u8, 0]
        && ctx.peek((PROGBASE + BSIZE) as u16, 16).unwrap() == [0u8; 16]
        && ctx.brk_addr() as usize == end;
    ctx.exit(if ok { 0 } else { 1 });
}

#[test]
fn exec_replaces_the_image() {
    let m = machine_with(programs(), &[(BIG, check_image as Program)]);
    m.k.run(|ctx| {
        ctx.poke((PROGBASE + BSIZE) as u16, b"leftover data...").unwrap();
        ctx.fork(|ctx| {
            ctx.signal(SIGINT, SigAction::Catch(noop)).unwrap();
            ctx.signal(SIGQUIT, SigAction::Ignore).unwrap();
            let e = ctx.execve("/big", &["big"], &[]);
            panic!("exec failed: {}", e);
        })
        .unwrap();
        assert_eq!(ctx.wait().map(|(_, s)| s), Ok(0));
    });
}

#[test]
fn exec_failures_come_back() {
    let m = machine_with(programs(), &[(SHOW, show as Program)]);
    m.k.run(|ctx| {
        assert_eq!(ctx.execve("/missing", &["x"], &[]), NotFound);
        assert_eq!(ctx.execve("/nobody", &["x"], &[]), ExecFileFormatError);
        assert_eq!(ctx.execve("/script", &["x"], &[]), ExecFileFormatError);
        assert_eq!(ctx.execve("/tmp", &["x"], &[]), PermissionDenied);

        // Execute bits matter even to the super-user.
        assert_eq!(ctx.execve("/data", &["x"], &[]), PermissionDenied);

        let long = "a".repeat(600);
        assert_eq!(ctx.execve("/show", &[long.as_str()], &[]), ArgumentListTooLong);
        assert_eq!(ctx.errno(), ArgumentListTooLong.errno());
    });
}

fn init(ctx: &mut UserCtx) {
    let (argv, envp) = ctx.args();
    assert_eq!(argv, vec!["init".to_string()]);
    assert!(envp.is_empty());
    let fd = ctx.open("/dev/tty", 2).unwrap();
    ctx.write(fd, b"init running\n").unwrap();
    ctx.exit(2);
}

#[test]
fn boot_runs_slash_init() {
    let mut fsimg = image();
    fsimg.add_exec(ROOTINODE, "init", INIT, 64).unwrap();
    let m = machine_with(fsimg, &[(INIT, init as Program)]);
    assert_eq!(m.k.boot(), 2 << 8);
    assert_eq!(m.console.output(), b"init running\n");
}

#[test]
fn boot_without_init() {
    let m = machine();
    assert_eq!(m.k.boot(), 1 << 8);
}
