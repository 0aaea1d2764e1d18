//! Scoped remote background process.
//!
//! The single place the pipeline departs from strictly sequential
//! blocking calls: a stage may run its action alongside a helper daemon
//! on the remote host. The helper is spawned, given a settle interval,
//! confirmed alive, and a stop attempt is guaranteed on every exit path
//! out of the scope, including action and verification failures. A failed
//! stop attempt is logged and swallowed; the run's outcome is the body's.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::command::shell_quote;
use crate::error::StageError;
use crate::session::CommandChannel;

/// Pause between the polite TERM and the follow-up check that decides
/// whether a KILL is needed.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Spawn `command` on the remote host, wait `settle`, confirm it is
/// alive, run `body`, then stop the process again.
pub fn with_background_process<T>(
    chan: &mut dyn CommandChannel,
    command: &str,
    settle: Duration,
    body: impl FnOnce(&mut dyn CommandChannel) -> Result<T, StageError>,
) -> Result<T, StageError> {
    let spawn = format!("nohup {command} >/dev/null 2>&1 & echo $!");
    let out = chan.run(&spawn)?;
    if !out.success() {
        return Err(StageError::action(format!(
            "could not spawn `{command}`: exit {}",
            out.exit_code
        )));
    }
    let pid: u32 = match out.stdout.trim().parse() {
        Ok(pid) => pid,
        Err(_) => {
            // The helper may well be running even though its pid is
            // unreadable; sweep it by command line before giving up.
            if let Err(err) = chan.run(&format!("pkill -f {} 2>/dev/null", shell_quote(command))) {
                warn!(command, error = %err, "sweep after unreadable pid failed");
            }
            return Err(StageError::action(format!(
                "could not read pid of `{command}` from {:?}",
                out.stdout.trim()
            )));
        }
    };
    debug!(command, pid, "background process started");

    thread::sleep(settle);
    let alive = chan.run(&format!("kill -0 {pid} 2>/dev/null"))?;
    if !alive.success() {
        return Err(StageError::action(format!(
            "background process `{command}` (pid {pid}) exited during the settle interval"
        )));
    }

    let result = body(chan);
    stop(chan, pid, command);
    result
}

fn stop(chan: &mut dyn CommandChannel, pid: u32, what: &str) {
    match chan.run(&format!("kill {pid} 2>/dev/null")) {
        Ok(_) => {}
        Err(err) => {
            warn!(process = what, pid, error = %err, "stop attempt failed");
            return;
        }
    }
    thread::sleep(STOP_GRACE);
    match chan.run(&format!("kill -0 {pid} 2>/dev/null")) {
        Ok(out) if out.success() => match chan.run(&format!("kill -9 {pid} 2>/dev/null")) {
            Ok(_) => debug!(process = what, pid, "background process force killed"),
            Err(err) => warn!(process = what, pid, error = %err, "force kill failed"),
        },
        Ok(_) => debug!(process = what, pid, "background process stopped"),
        Err(err) => warn!(process = what, pid, error = %err, "liveness recheck failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::session::ExecOutput;

    struct Replay {
        responses: Vec<ExecOutput>,
        log: Vec<String>,
    }

    impl Replay {
        fn new(responses: Vec<ExecOutput>) -> Self {
            Self {
                responses,
                log: Vec::new(),
            }
        }
    }

    impl CommandChannel for Replay {
        fn run(&mut self, command: &str) -> Result<ExecOutput, SessionError> {
            self.log.push(command.to_string());
            if self.responses.is_empty() {
                return Err(SessionError::Closed);
            }
            Ok(self.responses.remove(0))
        }
    }

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    fn dead() -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 1,
        }
    }

    #[test]
    fn test_spawn_body_stop() {
        let mut chan = Replay::new(vec![
            ok("12345\n"), // spawn
            ok(""),        // liveness after settle
            ok("created"), // body command
            ok(""),        // TERM
            dead(),        // gone after grace
        ]);
        let result = with_background_process(
            &mut chan,
            "redis-server --port 6379",
            Duration::ZERO,
            |chan| chan.run("do-the-work").map_err(StageError::from),
        )
        .unwrap();
        assert_eq!(result.stdout, "created");
        assert!(chan.log[0].starts_with("nohup redis-server --port 6379"));
        assert!(chan.log[0].ends_with("& echo $!"));
        assert!(chan.log.contains(&"kill 12345 2>/dev/null".to_string()));
    }

    #[test]
    fn test_stop_is_attempted_when_the_body_fails() {
        let mut chan = Replay::new(vec![
            ok("777\n"),
            ok(""),
            ok(""),  // TERM
            dead(),  // gone after grace
        ]);
        let result: Result<(), StageError> = with_background_process(
            &mut chan,
            "redis-server",
            Duration::ZERO,
            |_chan| Err(StageError::action("site already exists")),
        );
        assert!(result.is_err());
        assert!(chan.log.contains(&"kill 777 2>/dev/null".to_string()));
    }

    #[test]
    fn test_survivor_gets_force_killed() {
        let mut chan = Replay::new(vec![
            ok("777\n"),
            ok(""),
            ok(""), // TERM
            ok(""), // still alive after grace
            ok(""), // KILL
        ]);
        with_background_process(&mut chan, "redis-server", Duration::ZERO, |_chan| Ok(()))
            .unwrap();
        assert!(chan.log.contains(&"kill -9 777 2>/dev/null".to_string()));
    }

    #[test]
    fn test_death_during_settle_is_an_action_failure() {
        let mut chan = Replay::new(vec![ok("777\n"), dead()]);
        let result = with_background_process(&mut chan, "redis-server", Duration::ZERO, |chan| {
            chan.run("never-reached").map_err(StageError::from)
        });
        match result {
            Err(StageError::Action { reason }) => {
                assert!(reason.contains("settle interval"));
            }
            other => panic!("expected action failure, got {other:?}"),
        }
        assert!(!chan.log.iter().any(|cmd| cmd == "never-reached"));
        assert!(!chan.log.contains(&"kill 777 2>/dev/null".to_string()));
    }

    #[test]
    fn test_unreadable_pid_sweeps_before_failing() {
        let mut chan = Replay::new(vec![ok("no pid here"), ok("")]);
        let result = with_background_process(&mut chan, "redis-server", Duration::ZERO, |_chan| {
            Ok(())
        });
        match result {
            Err(StageError::Action { reason }) => assert!(reason.contains("could not read pid")),
            other => panic!("expected action failure, got {other:?}"),
        }
        assert!(
            chan.log
                .iter()
                .any(|cmd| cmd.starts_with("pkill -f 'redis-server'")),
            "a helper with an unreadable pid still gets a stop attempt"
        );
    }
}
