/*!
 * Shards and Workers
 *
 * A shard is one partition of the keyspace: a `Store` plus the command
 * registry used to run requests against it. A worker is the one thread that
 * owns a shard for the life of the process. It drains a bounded task queue
 * in arrival order, so two commands on the same key always execute in the
 * order they were enqueued, and it runs active expiration between tasks.
 */

use crate::commands::CommandRegistry;
use crate::lifecycle::Lifecycle;
use crate::protocol::{Command, Reply};
use crate::storage::Store;
use crossbeam::channel::{select, tick, Receiver, Sender};
use log::{debug, info};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A single-execution unit: one store and the commands that may touch it
#[repr(align(64))]
pub struct Shard {
    pub id: usize,
    pub store: Store,
    registry: Arc<CommandRegistry>,
}

impl Shard {
    pub fn new(id: usize, store: Store, registry: Arc<CommandRegistry>) -> Self {
        Self { id, store, registry }
    }

    /// Execute one command against this shard's store
    pub fn exec(&mut self, cmd: &Command) -> Reply {
        self.registry.execute(cmd, &mut self.store)
    }

    /// One active-expiration cycle over this shard
    pub fn expire_cycle(&mut self) -> usize {
        let removed = self.store.active_expire_cycle();
        if removed > 0 {
            debug!("shard {} expired {} keys", self.id, removed);
        }
        removed
    }
}

/// A request on its way to a worker, with the slot its reply goes back through
pub struct Task {
    pub command: Command,
    pub reply: Sender<Reply>,
}

/// Start the worker thread that owns `shard`
///
/// The worker stops when every task sender is gone or when its lifecycle
/// refuses new work during shutdown.
pub fn spawn_worker(
    mut shard: Shard,
    tasks: Receiver<Task>,
    lifecycle: Arc<Lifecycle>,
    expire_every: Duration,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("worker-{}", shard.id))
        .spawn(move || {
            info!("worker {} started", shard.id);
            let ticker = tick(expire_every);
            loop {
                let running = select! {
                    recv(tasks) -> task => match task {
                        Ok(task) => match lifecycle.begin() {
                            Some(_busy) => {
                                let reply = shard.exec(&task.command);
                                // the requester may have given up; nothing to do then
                                let _ = task.reply.send(reply);
                                true
                            }
                            None => false,
                        },
                        Err(_) => false,
                    },
                    recv(ticker) -> _ => match lifecycle.begin() {
                        Some(_busy) => {
                            shard.expire_cycle();
                            true
                        }
                        None => false,
                    },
                };
                if !running {
                    break;
                }
            }
            info!("worker {} stopped", shard.id);
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::KeyspaceStats;
    use bytes::Bytes;
    use crossbeam::channel::bounded;

    fn shard() -> Shard {
        Shard::new(
            0,
            Store::new(StoreConfig::default(), Arc::new(KeyspaceStats::default())),
            Arc::new(CommandRegistry::with_builtins()),
        )
    }

    fn cmd(parts: &[&str]) -> Command {
        Command::new(
            parts[0],
            parts[1..].iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect(),
        )
    }

    #[test]
    fn test_shard_alignment() {
        assert_eq!(std::mem::align_of::<Shard>(), 64, "Shard struct should be aligned to 64 bytes");
    }

    #[test]
    fn worker_replies_in_queue_order() {
        let (tx, rx) = bounded(8);
        let lifecycle = Arc::new(Lifecycle::new("worker-0"));
        let handle = spawn_worker(shard(), rx, lifecycle, Duration::from_millis(50)).unwrap();

        let mut replies = Vec::new();
        for i in 0..100 {
            let (rtx, rrx) = bounded(1);
            tx.send(Task { command: cmd(&["SET", "k", &i.to_string()]), reply: rtx }).unwrap();
            replies.push(rrx);
        }
        for r in replies {
            assert_eq!(r.recv().unwrap(), Reply::ok());
        }
        let (rtx, rrx) = bounded(1);
        tx.send(Task { command: cmd(&["GET", "k"]), reply: rtx }).unwrap();
        assert_eq!(rrx.recv().unwrap(), Reply::Bulk(Bytes::from("99")));

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn worker_sweeps_expired_keys_in_the_background() {
        let (tx, rx) = bounded(8);
        let lifecycle = Arc::new(Lifecycle::new("worker-0"));
        let stats = Arc::new(KeyspaceStats::default());
        let shard = Shard::new(
            0,
            Store::new(StoreConfig::default(), stats.clone()),
            Arc::new(CommandRegistry::with_builtins()),
        );
        let handle = spawn_worker(shard, rx, lifecycle.clone(), Duration::from_millis(10)).unwrap();

        let (rtx, rrx) = bounded(1);
        tx.send(Task { command: cmd(&["SET", "gone", "v", "EX", "1"]), reply: rtx }).unwrap();
        assert_eq!(rrx.recv().unwrap(), Reply::ok());
        assert_eq!(stats.keys(), 1);

        std::thread::sleep(Duration::from_millis(1200));
        assert_eq!(stats.keys(), 0);

        // a claimed worker stops instead of running more work
        lifecycle.request_drain();
        while !lifecycle.try_shutdown() {
            std::thread::yield_now();
        }
        handle.join().unwrap();
        drop(tx);
    }
}
