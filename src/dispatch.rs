/*!
 * Command Dispatch
 *
 * Routes each command to the worker owning its key. The key is the first
 * argument, hashed with xxh3 (seedless, so stable for the life of the
 * process) modulo the fixed worker count. Keyless commands carry no ordering
 * requirement and go to a random worker.
 */

use crate::protocol::{Command, Reply};
use crate::shard::Task;
use crossbeam::channel::{bounded, Sender};
use rand::Rng;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("worker {0} is no longer accepting tasks")]
    WorkerGone(usize),
    #[error("worker {0} dropped the request without replying")]
    NoReply(usize),
}

/// Shard index for `key` among `shards` workers
#[inline]
pub fn shard_for_key(key: &[u8], shards: usize) -> usize {
    (xxh3_64(key) % shards as u64) as usize
}

/// Fan-out point in front of the workers' bounded queues
pub struct Dispatcher {
    queues: Vec<Sender<Task>>,
}

impl Dispatcher {
    /// # Panics
    /// If `queues` is empty.
    pub fn new(queues: Vec<Sender<Task>>) -> Self {
        assert!(!queues.is_empty(), "dispatcher needs at least one worker");
        Self { queues }
    }

    pub fn shards(&self) -> usize {
        self.queues.len()
    }

    pub fn route(&self, cmd: &Command) -> usize {
        match cmd.key() {
            Some(key) => shard_for_key(key, self.queues.len()),
            None => rand::thread_rng().gen_range(0..self.queues.len()),
        }
    }

    /// Enqueue a task on its shard, blocking while that queue is full
    pub fn dispatch(&self, task: Task) -> Result<usize, DispatchError> {
        let shard = self.route(&task.command);
        self.queues[shard]
            .send(task)
            .map_err(|_| DispatchError::WorkerGone(shard))?;
        Ok(shard)
    }

    /// Dispatch `command` and wait for its reply
    pub fn execute(&self, command: Command) -> Result<Reply, DispatchError> {
        let (tx, rx) = bounded(1);
        let shard = self.dispatch(Task { command, reply: tx })?;
        rx.recv().map_err(|_| DispatchError::NoReply(shard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crossbeam::channel::Receiver;
    use std::time::Duration;

    fn cmd(name: &str, args: &[&str]) -> Command {
        Command::new(name, args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect())
    }

    fn queues(n: usize, cap: usize) -> (Vec<Sender<Task>>, Vec<Receiver<Task>>) {
        (0..n).map(|_| bounded(cap)).unzip()
    }

    #[test]
    fn same_key_same_shard() {
        let (tx, _rx) = queues(8, 1);
        let d = Dispatcher::new(tx);
        let a = d.route(&cmd("SET", &["user:1", "x"]));
        let b = d.route(&cmd("GET", &["user:1"]));
        let c = d.route(&cmd("TTL", &["user:1"]));
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a, shard_for_key(b"user:1", 8));
    }

    #[test]
    fn keys_spread_across_shards() {
        let mut counts = [0usize; 4];
        for i in 0..4000 {
            counts[shard_for_key(format!("key:{i}").as_bytes(), 4)] += 1;
        }
        for c in counts {
            assert!(c > 700, "uneven distribution: {counts:?}");
        }
    }

    #[test]
    fn keyless_commands_route_anywhere_in_range() {
        let (tx, _rx) = queues(3, 1);
        let d = Dispatcher::new(tx);
        for _ in 0..100 {
            assert!(d.route(&cmd("PING", &[])) < 3);
        }
    }

    #[test]
    fn full_queue_blocks_the_sender() {
        let (tx, rx) = queues(1, 1);
        let d = std::sync::Arc::new(Dispatcher::new(tx));
        let (r1, _keep1) = bounded(1);
        d.dispatch(Task { command: cmd("GET", &["a"]), reply: r1 }).unwrap();

        let blocked = {
            let d = d.clone();
            std::thread::spawn(move || {
                let (r2, _keep2) = bounded(1);
                d.dispatch(Task { command: cmd("GET", &["b"]), reply: r2 })
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());

        rx[0].recv().unwrap();
        assert_eq!(blocked.join().unwrap(), Ok(0));
    }

    #[test]
    fn gone_worker_is_reported() {
        let (tx, rx) = queues(1, 1);
        drop(rx);
        let d = Dispatcher::new(tx);
        assert_eq!(d.execute(cmd("PING", &[])), Err(DispatchError::WorkerGone(0)));
    }
}
