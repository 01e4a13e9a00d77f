// Context switch.
//
// Every process runs on its own host thread, but only the thread that
// holds the baton may execute. swtch() passes the baton to the next
// process and parks the caller until somebody passes it back; to the
// parked process the whole episode looks like an ordinary call that
// returns once it has been swapped in again.
//
// halt() takes the baton away from everybody. Threads that are parked
// at that point stay parked for good; only Kernel::run's wait_halt()
// wakes up.

use std::any::Any;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

pub enum Halt {
    Shutdown(u16),             // init exited with this status
    Panic(Box<dyn Any + Send>), // a kernel panic inside some process
}

#[derive(Default)]
struct Turn {
    running: Option<usize>, // process table slot holding the baton
    halted: Option<Halt>,
}

#[derive(Default)]
pub struct Context {
    turn: Mutex<Turn>,
    cv: Condvar,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    fn turn(&self) -> MutexGuard<'_, Turn> {
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn park<'a>(&self, mut turn: MutexGuard<'a, Turn>, me: usize) -> MutexGuard<'a, Turn> {
        while turn.running != Some(me) || turn.halted.is_some() {
            turn = self.cv.wait(turn).unwrap_or_else(PoisonError::into_inner);
        }
        turn
    }

    // Block the calling thread until slot `me` is given the baton.
    pub fn enter(&self, me: usize) {
        let turn = self.turn();
        let _turn = self.park(turn, me);
    }

    // Give the baton to `to` without waiting for it to come back.
    // Used by a process that is about to vanish.
    pub fn handoff(&self, to: usize) {
        let mut turn = self.turn();
        turn.running = Some(to);
        self.cv.notify_all();
    }

    // Pass the baton from `me` to `to` and sleep until it returns.
    pub fn swtch(&self, me: usize, to: usize) {
        let mut turn = self.turn();
        turn.running = Some(to);
        self.cv.notify_all();
        let _turn = self.park(turn, me);
    }

    pub fn running(&self) -> Option<usize> {
        self.turn().running
    }

    // Stop the machine. The first halt wins.
    pub fn halt(&self, why: Halt) {
        let mut turn = self.turn();
        if turn.halted.is_none() {
            turn.halted = Some(why);
        }
        turn.running = None;
        self.cv.notify_all();
    }

    pub fn wait_halt(&self) -> Halt {
        let mut turn = self.turn();
        loop {
            if let Some(why) = turn.halted.take() {
                return why;
            }
            turn = self.cv.wait(turn).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn baton_alternates() {
        let cpu = Arc::new(Context::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let (c, l) = (Arc::clone(&cpu), Arc::clone(&log));
        let t = thread::spawn(move || {
            c.enter(1);
            l.lock().unwrap().push("b1");
            c.swtch(1, 0);
            l.lock().unwrap().push("b2");
            c.halt(Halt::Shutdown(3));
        });

        cpu.handoff(0);
        cpu.enter(0);
        log.lock().unwrap().push("a1");
        cpu.swtch(0, 1);
        log.lock().unwrap().push("a2");
        cpu.handoff(1);

        match cpu.wait_halt() {
            Halt::Shutdown(s) => assert_eq!(s, 3),
            Halt::Panic(_) => panic!("unexpected panic"),
        }
        t.join().unwrap();
        assert_eq!(*log.lock().unwrap(), ["a1", "b1", "a2", "b2"]);
        assert_eq!(cpu.running(), None);
    }
}
