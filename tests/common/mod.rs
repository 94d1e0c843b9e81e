#![allow(dead_code)]

use nietzsche::{CommandRegistry, Config, Mode, Server, ShutdownCoordinator};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Config for an in-process server on an ephemeral loopback port
pub fn test_config(mode: Mode) -> Config {
    Config {
        bind: [127, 0, 0, 1].into(),
        port: 0,
        mode,
        io_handlers: 2,
        workers: 2,
        active_expire_frequency: Duration::from_millis(50),
        ..Config::default()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub coordinator: Arc<ShutdownCoordinator>,
}

pub fn start(config: Config) -> TestServer {
    start_with(config, CommandRegistry::with_builtins())
}

pub fn start_with(config: Config, registry: CommandRegistry) -> TestServer {
    let server = Server::bind(config).expect("bind").with_registry(registry);
    let addr = server.local_addr();
    let coordinator = server.coordinator();
    std::thread::spawn(move || server.run());
    TestServer { addr, coordinator }
}

/// A decoded RESP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Resp>),
}

impl Resp {
    pub fn simple(s: &str) -> Self {
        Resp::Simple(s.to_string())
    }

    pub fn bulk(s: &str) -> Self {
        Resp::Bulk(s.as_bytes().to_vec())
    }
}

pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("Failed to connect");
        stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
        stream.set_write_timeout(Some(Duration::from_secs(30))).unwrap();
        let writer = stream.try_clone().unwrap();
        Self {
            reader: BufReader::new(stream),
            writer,
        }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).expect("Failed to write command");
    }

    pub fn send(&mut self, parts: &[&[u8]]) {
        self.send_raw(&encode(parts));
    }

    /// Send one request and read its reply
    pub fn cmd(&mut self, parts: &[&str]) -> Resp {
        let parts: Vec<&[u8]> = parts.iter().map(|p| p.as_bytes()).collect();
        self.send(&parts);
        self.read()
    }

    pub fn read(&mut self) -> Resp {
        read_reply(&mut self.reader)
    }

    /// True once the server has closed the connection
    pub fn at_eof(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(self.reader.read(&mut buf), Ok(0))
    }
}

pub fn encode(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for p in parts {
        out.extend_from_slice(format!("${}\r\n", p.len()).as_bytes());
        out.extend_from_slice(p);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn read_line<R: BufRead>(r: &mut R) -> String {
    let mut line = String::new();
    r.read_line(&mut line).expect("Failed to read reply line");
    assert!(line.ends_with("\r\n"), "unterminated reply line: {line:?}");
    line.truncate(line.len() - 2);
    line
}

pub fn read_reply<R: BufRead>(r: &mut R) -> Resp {
    let line = read_line(r);
    let (tag, rest) = line.split_at(1);
    match tag {
        "+" => Resp::Simple(rest.to_string()),
        "-" => Resp::Error(rest.to_string()),
        ":" => Resp::Int(rest.parse().expect("integer reply")),
        "$" => {
            let len: i64 = rest.parse().expect("bulk length");
            if len < 0 {
                return Resp::Nil;
            }
            let mut data = vec![0u8; len as usize + 2];
            r.read_exact(&mut data).expect("Failed to read bulk body");
            data.truncate(len as usize);
            Resp::Bulk(data)
        }
        "*" => {
            let n: usize = rest.parse().expect("array length");
            Resp::Array((0..n).map(|_| read_reply(r)).collect())
        }
        _ => panic!("unexpected reply: {line:?}"),
    }
}
