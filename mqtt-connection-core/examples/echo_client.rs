#[macro_use]
extern crate log;

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::process;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use hexplay::HexViewBuilder;
use mqtt_packet::{parse, Connect, Packet, ProtocolVersion, WriteTo};
use nom::Err as NomErr;
use mqtt_connection_core::{AckCompletion, ConnectionCore, Failure, Listener, QoS, Transport};
use structopt::StructOpt;
use url::Url;

#[derive(StructOpt, Debug)]
#[structopt(name = "echo_client", about = "subscribes to a topic and echoes what it receives")]
struct Opt {
    /// mqtt://host:port overriding --host/--port, e.g. mqtt://localhost:1883
    #[structopt(short, long)]
    url: Option<Url>,

    #[structopt(short, long, default_value = "localhost")]
    host: String,

    #[structopt(short, long, default_value = "1883")]
    port: u16,

    #[structopt(short, long, default_value = "a/b")]
    topic: String,

    #[structopt(short, long)]
    id: Option<String>,

    /// Seconds between keep-alive PINGREQs.
    #[structopt(short, long, default_value = "60")]
    keep_alive: u16,
}

impl Opt {
    fn server(&self) -> Result<(String, u16)> {
        if let Some(ref url) = self.url {
            let host = url.host_str().ok_or_else(|| anyhow!("missing hostname"))?.to_string();
            let port = url.port().unwrap_or(1883);
            Ok((host, port))
        } else {
            Ok((self.host.clone(), self.port))
        }
    }

    fn client_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| format!("echo_client{}", process::id()))
    }
}

/// A blocking `TcpStream` wrapped up as a [`Transport`].
///
/// Real deployments would integrate with a reactor and make `offer` genuinely
/// non-blocking; this demo writes synchronously and never reports `full`, which
/// is fine for a single-subscriber example but not a transport to build on.
struct TcpTransport {
    stream: TcpStream,
    on_stopped: Rc<RefCell<Option<Box<dyn FnOnce()>>>>,
}

impl Transport for TcpTransport {
    fn offer(&mut self, frame: Bytes) -> bool {
        match self.stream.write_all(&frame) {
            Ok(()) => true,
            Err(err) => {
                warn!("write failed: {}", err);
                false
            }
        }
    }

    fn full(&self) -> bool {
        false
    }

    fn resume_read(&mut self) {}

    fn suspend_read(&mut self) {}

    fn stop(&mut self, on_stopped: Box<dyn FnOnce()>) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        // deferred past this call, per the `Transport::stop` contract
        *self.on_stopped.borrow_mut() = Some(on_stopped);
    }
}

struct EchoListener;

impl Listener for EchoListener {
    fn deliver(&mut self, topic: &str, payload: &[u8], ack: AckCompletion) {
        info!("{}:\n{}", topic, HexViewBuilder::new(payload).finish());
        ack.complete();
    }

    fn failure(&mut self, failure: &Failure) {
        error!("connection failed: {}", failure);
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    debug!("{:#?}", opt);

    let (host, port) = opt.server()?;
    let mut stream = TcpStream::connect((host.as_str(), port))?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    handshake(&mut stream, &opt.client_id(), opt.keep_alive)?;

    let on_stopped = Rc::new(RefCell::new(None));
    let transport = TcpTransport {
        stream: stream.try_clone()?,
        on_stopped: Rc::clone(&on_stopped),
    };

    let core = ConnectionCore::new(transport, Duration::from_secs(u64::from(opt.keep_alive)));
    core.listener(EchoListener);

    let topic = opt.topic.clone();
    core.subscribe(&[(topic.as_str(), QoS::AtMostOnce)], |res| match res {
        Ok(status) => info!("subscribed: {:?}", status),
        Err(failure) => error!("subscribe failed: {}", failure),
    });

    let mut buf = BytesMut::with_capacity(4096);
    let mut read_buf = [0u8; 4096];

    loop {
        if let Some(on_stopped) = on_stopped.borrow_mut().take() {
            on_stopped();
            break;
        }

        match stream.read(&mut read_buf) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&read_buf[..n]);
                while let Ok((remaining, packet)) = parse(&buf, ProtocolVersion::V311) {
                    let consumed = buf.len() - remaining.len();
                    core.process_frame(packet);
                    let _ = buf.split_to(consumed);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                core.process_failure(Failure::from(err));
            }
        }

        core.poll_heartbeat();

        if core.failure().is_some() {
            break;
        }
    }

    Ok(())
}

fn handshake(stream: &mut TcpStream, client_id: &str, keep_alive: u16) -> Result<()> {
    let connect = Packet::Connect(Connect {
        protocol_version: ProtocolVersion::V311,
        clean_session: true,
        keep_alive,
        properties: None,
        client_id,
        last_will: None,
        username: None,
        password: None,
    });

    let mut buf = BytesMut::with_capacity(connect.size());
    connect.write_to(&mut buf);
    stream.write_all(&buf)?;

    let mut ack_buf = [0u8; 16];
    let n = stream.read(&mut ack_buf)?;

    match parse(&ack_buf[..n], ProtocolVersion::V311) {
        Ok((_, Packet::ConnectAck(ack))) => {
            debug!("connected: {:?}", ack.return_code);
            Ok(())
        }
        Ok((_, other)) => Err(anyhow!("unexpected handshake response: {:?}", other)),
        Err(NomErr::Incomplete(_)) => Err(anyhow!("incomplete CONNACK")),
        Err(err) => Err(anyhow!("malformed CONNACK: {:?}", err)),
    }
}
