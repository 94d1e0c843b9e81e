/*!
 * Command Registry
 *
 * Maps command names to handlers. Every handler sees the raw arguments and
 * the store of the shard the command was routed to, and produces a `Reply`.
 * Extra command families plug in through [`CommandRegistry::register`]
 * without touching the dispatch path.
 */

use crate::protocol::{Command, Reply};
use crate::storage::{MemberSet, Store, Ttl, Value};
use bytes::Bytes;
use std::collections::HashMap;

/// Reply for a value of the wrong kind
const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";

/// A command implementation
pub trait CommandHandler: Send + Sync {
    fn execute(&self, args: &[Bytes], store: &mut Store) -> Reply;
}

impl<F> CommandHandler for F
where
    F: Fn(&[Bytes], &mut Store) -> Reply + Send + Sync,
{
    fn execute(&self, args: &[Bytes], store: &mut Store) -> Reply {
        self(args, store)
    }
}

/// Name to handler table, shared read-only by every shard
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Box<dyn CommandHandler>>,
}

impl CommandRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the core and set commands
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register("PING", ping);
        r.register("SET", set);
        r.register("GET", get);
        r.register("DEL", del);
        r.register("EXISTS", exists);
        r.register("EXPIRE", expire);
        r.register("TTL", ttl);
        r.register("INFO", info);
        r.register("SADD", sadd);
        r.register("SREM", srem);
        r.register("SMEMBERS", smembers);
        r.register("SISMEMBER", sismember);
        r
    }

    /// Add or replace the handler for `name` (case-insensitive)
    pub fn register<H>(&mut self, name: &str, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.handlers
            .insert(name.to_ascii_uppercase(), Box::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_ascii_uppercase())
    }

    pub fn execute(&self, cmd: &Command, store: &mut Store) -> Reply {
        match self.handlers.get(&cmd.name) {
            Some(handler) => handler.execute(&cmd.args, store),
            None => Reply::error(format!(
                "ERR unknown command '{}'",
                cmd.name.to_ascii_lowercase()
            )),
        }
    }
}

fn parse_i64(b: &[u8]) -> Option<i64> {
    std::str::from_utf8(b).ok()?.parse().ok()
}

// PING [message]
fn ping(args: &[Bytes], _store: &mut Store) -> Reply {
    match args {
        [] => Reply::Simple("PONG".into()),
        [msg] => Reply::Bulk(msg.clone()),
        _ => Reply::wrong_arity("ping"),
    }
}

// SET key value [EX seconds]
fn set(args: &[Bytes], store: &mut Store) -> Reply {
    let ttl_ms = match args {
        [_, _] => 0,
        [_, _, opt, secs] if opt.eq_ignore_ascii_case(b"EX") => match parse_i64(secs) {
            Some(secs) => secs.saturating_mul(1000),
            None => return Reply::error(NOT_AN_INTEGER),
        },
        [_, _, _, _] => return Reply::error("ERR syntax error"),
        _ => return Reply::wrong_arity("set"),
    };
    store.set(args[0].clone(), Value::Str(args[1].clone()), ttl_ms);
    Reply::ok()
}

// GET key
fn get(args: &[Bytes], store: &mut Store) -> Reply {
    let [key] = args else {
        return Reply::wrong_arity("get");
    };
    match store.get(key) {
        Some(entry) => match &entry.value {
            Value::Str(v) => Reply::Bulk(v.clone()),
            _ => Reply::error(WRONGTYPE),
        },
        None => Reply::Nil,
    }
}

// DEL key
fn del(args: &[Bytes], store: &mut Store) -> Reply {
    let [key] = args else {
        return Reply::wrong_arity("del");
    };
    Reply::Integer(store.delete(key) as i64)
}

// EXISTS key
fn exists(args: &[Bytes], store: &mut Store) -> Reply {
    let [key] = args else {
        return Reply::wrong_arity("exists");
    };
    Reply::Integer(store.exists(key) as i64)
}

// EXPIRE key seconds
fn expire(args: &[Bytes], store: &mut Store) -> Reply {
    let [key, secs] = args else {
        return Reply::wrong_arity("expire");
    };
    let Some(secs) = parse_i64(secs) else {
        return Reply::error(NOT_AN_INTEGER);
    };
    if !store.exists(key) {
        return Reply::Integer(0);
    }
    if secs <= 0 {
        store.delete(key);
    } else {
        store.set_expiry(key, secs.saturating_mul(1000));
    }
    Reply::Integer(1)
}

// TTL key: -2 missing, -1 no expiry, else whole seconds left
fn ttl(args: &[Bytes], store: &mut Store) -> Reply {
    let [key] = args else {
        return Reply::wrong_arity("ttl");
    };
    match store.ttl(key) {
        Ttl::Missing => Reply::Integer(-2),
        Ttl::Persistent => Reply::Integer(-1),
        Ttl::Remaining(ms) => Reply::Integer((ms / 1000) as i64),
    }
}

// INFO [section]
fn info(args: &[Bytes], store: &mut Store) -> Reply {
    if args.len() > 1 {
        return Reply::wrong_arity("info");
    }
    let stats = store.stats();
    let body = format!(
        "# Keyspace\r\ndb0:keys={},expires={},avg_ttl=0\r\n",
        stats.keys(),
        stats.expires()
    );
    Reply::Bulk(Bytes::from(body))
}

// SADD key member [member ...]
fn sadd(args: &[Bytes], store: &mut Store) -> Reply {
    let [key, members @ ..] = args else {
        return Reply::wrong_arity("sadd");
    };
    if members.is_empty() {
        return Reply::wrong_arity("sadd");
    }
    match store.get_mut(key) {
        Some(entry) => match &mut entry.value {
            Value::Set(set) => {
                let added = members.iter().filter(|m| set.insert((*m).clone())).count();
                Reply::Integer(added as i64)
            }
            _ => Reply::error(WRONGTYPE),
        },
        None => {
            let set: MemberSet = members.iter().cloned().collect();
            let added = set.len();
            store.set(key.clone(), Value::Set(set), 0);
            Reply::Integer(added as i64)
        }
    }
}

// SREM key member [member ...]
fn srem(args: &[Bytes], store: &mut Store) -> Reply {
    let [key, members @ ..] = args else {
        return Reply::wrong_arity("srem");
    };
    if members.is_empty() {
        return Reply::wrong_arity("srem");
    }
    let (removed, now_empty) = match store.get_mut(key) {
        Some(entry) => match &mut entry.value {
            Value::Set(set) => {
                let removed = members.iter().filter(|m| set.remove(*m)).count();
                (removed, set.is_empty())
            }
            _ => return Reply::error(WRONGTYPE),
        },
        None => return Reply::Integer(0),
    };
    if now_empty {
        store.delete(key);
    }
    Reply::Integer(removed as i64)
}

// SMEMBERS key
fn smembers(args: &[Bytes], store: &mut Store) -> Reply {
    let [key] = args else {
        return Reply::wrong_arity("smembers");
    };
    match store.get(key) {
        Some(entry) => match &entry.value {
            Value::Set(set) => Reply::Array(set.iter().cloned().map(Reply::Bulk).collect()),
            _ => Reply::error(WRONGTYPE),
        },
        None => Reply::Array(Vec::new()),
    }
}

// SISMEMBER key member
fn sismember(args: &[Bytes], store: &mut Store) -> Reply {
    let [key, member] = args else {
        return Reply::wrong_arity("sismember");
    };
    match store.get(key) {
        Some(entry) => match &entry.value {
            Value::Set(set) => Reply::Integer(set.contains(member) as i64),
            _ => Reply::error(WRONGTYPE),
        },
        None => Reply::Integer(0),
    }
}
