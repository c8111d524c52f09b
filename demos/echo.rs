//! Two connections joined in memory. The server side runs an upper-casing
//! echo command on a session channel, the client streams text through it.

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};
use anyhow::{anyhow, bail, Context, Result};

use std::io::{Read, Write};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use simplelog::*;

use sunset_mux::packets::ChannelOpenType;
use sunset_mux::*;

const TIMEOUT: Duration = Duration::from_secs(10);

/// One direction of the in-memory transport
struct Pipe {
    tx: Mutex<mpsc::Sender<Vec<u8>>>,
}

impl Session for Pipe {
    fn write_packet(&self, buf: PacketBuf) -> WriteFuture {
        match self.tx.lock().send(buf.into_vec()) {
            Ok(()) => WriteFuture::completed(()),
            Err(_) => WriteFuture::failed(Error::ChannelClosed),
        }
    }
}

fn deliver(rx: mpsc::Receiver<Vec<u8>>, to: &Arc<Channels>, name: &'static str) {
    let to = Arc::downgrade(to);
    thread::spawn(move || {
        for p in rx {
            let Some(to) = to.upgrade() else {
                break;
            };
            if let Err(e) = to.dispatch_packet(&p) {
                warn!("{name}: dispatch failed: {e}");
            }
        }
    });
}

fn connect(config: &ChanConfig) -> (Arc<Channels>, Arc<Channels>) {
    let (atx, arx) = mpsc::channel();
    let (btx, brx) = mpsc::channel();
    let a = Channels::new(Arc::new(Pipe { tx: Mutex::new(atx) }), config.clone());
    let b = Channels::new(Arc::new(Pipe { tx: Mutex::new(btx) }), config.clone());
    deliver(arx, &b, "server");
    deliver(brx, &a, "client");
    (a, b)
}

struct EchoServer;

impl ChannelOpener for EchoServer {
    fn open(&self, ch: &Arc<Channel>, ty: &ChannelOpenType<'_>) -> Result<(), ChanFail> {
        if !matches!(ty, ChannelOpenType::Session) {
            return Err(ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE);
        }
        ch.add_session_handlers();
        ch.add_request_handler(handler_fn(|_ch, req| {
            Ok(if req.req == "exec" { ReqResult::Success } else { ReqResult::Unsupported })
        }));
        let input = ChanInput::new(ch, ChanData::Normal)
            .map_err(|_| ChanFail::SSH_OPEN_RESOURCE_SHORTAGE)?;
        let ch = ch.clone();
        thread::spawn(move || {
            if let Err(e) = echo(ch, input) {
                warn!("echo failed: {e:#}");
            }
        });
        Ok(())
    }
}

fn echo(ch: Arc<Channel>, mut input: ChanInput) -> Result<()> {
    let mut out = ChanOutput::new(ch.clone(), ChanData::Normal);
    let mut buf = [0u8; 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        buf[..n].make_ascii_uppercase();
        out.write_all(&buf[..n])?;
        out.flush()?;
    }
    out.close()?;
    ch.exit_status(0)?;
    ch.close(false);
    Ok(())
}

fn main() -> Result<()> {
    setup_log();

    let mut config = ChanConfig::default();
    // small enough that the transfer needs several window adjustments
    config.window = 4096;
    config.max_packet = 1024;
    let (client, server) = connect(&config);
    server.set_opener(Arc::new(EchoServer));

    let (ch, opened) = client.open(ChannelOpenType::Session)?;
    opened.wait(TIMEOUT).context("Opening channel")?;
    info!("opened channel {}, peer {:?}", ch.num(), ch.recipient());

    let mut input = ChanInput::new(&ch, ChanData::Normal)?;
    if !ch.exec("upcase")?.wait(TIMEOUT)? {
        bail!("exec refused");
    }

    let msg = "the quick brown fox jumps over the lazy dog\n".repeat(500);
    let mut out = ChanOutput::new(ch.clone(), ChanData::Normal);
    let sent = msg.clone();
    let w = thread::spawn(move || -> Result<()> {
        out.write_all(sent.as_bytes())?;
        out.close()?;
        Ok(())
    });

    let mut reply = String::new();
    input.read_to_string(&mut reply)?;
    w.join().map_err(|_| anyhow!("writer panicked"))??;

    if reply != msg.to_ascii_uppercase() {
        bail!("reply mismatch");
    }
    info!("echoed {} bytes", reply.len());

    ch.closed_future().wait(TIMEOUT).context("Waiting for close")?;
    info!("exit {:?}, {} channels left", ch.exit(), client.count());
    Ok(())
}

fn setup_log() {
    let conf = simplelog::ConfigBuilder::new()
        .add_filter_allow_str("sunset_mux")
        .add_filter_allow_str("echo")
        .build();

    CombinedLogger::init(vec![TermLogger::new(
        LevelFilter::Debug,
        conf,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .unwrap();
}
