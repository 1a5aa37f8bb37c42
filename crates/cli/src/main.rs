use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use rxtx::config::{DEFAULT_MTU, DEFAULT_PORT_BASE};
use rxtx::{AddressFamily, ControlMessage, Session, SessionConfig, control};

/// RTP video clock rate.
const CLOCK_RATE: u32 = 90_000;

#[derive(Parser)]
#[command(
    name = "rxtx-send",
    about = "Send a synthetic RTP video stream to one or more receivers",
    after_help = "Control commands on stdin: pause | play | port <n> | dest <addr> | fec <percents ...|cfg ...>\n\
                  Close stdin (Ctrl-D) to stop."
)]
struct Args {
    /// Comma-separated list of receivers
    destinations: String,

    /// First receive port
    #[arg(long, default_value_t = DEFAULT_PORT_BASE)]
    recv_port: u16,

    /// First send port
    #[arg(long, default_value_t = DEFAULT_PORT_BASE)]
    send_port: u16,

    /// Use IPv6
    #[arg(short = '6', long)]
    ipv6: bool,

    /// Interface for multicast (IPv4 address or IPv6 interface index)
    #[arg(long)]
    mcast_if: Option<String>,

    /// Maximum packet size
    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: usize,

    /// Initial FEC, e.g. "percents 1500 100000 5" or "cfg 32:8"
    #[arg(long)]
    fec: Option<String>,

    /// Packets per second, 0 for unpaced
    #[arg(long, default_value_t = 0)]
    packet_rate: u64,

    /// Frames per second of the synthetic stream
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Size of one synthetic frame in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    frame_size: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let fps = args.fps.max(1);

    let config = SessionConfig {
        destinations: args.destinations,
        recv_port_base: args.recv_port,
        send_port_base: args.send_port,
        family: AddressFamily::from_ipv6_flag(args.ipv6),
        multicast_if: args.mcast_if,
        mtu: args.mtu,
        fec: args.fec,
        packet_rate: args.packet_rate,
        ..SessionConfig::default()
    };

    let session = match Session::open(config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Unable to open session: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (handle, control_thread) = control::spawn(session.clone());

    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ControlMessage>() {
                Ok(message) => {
                    if handle.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "ignoring command"),
            }
        }
    });

    let frame_interval = Duration::from_secs(1) / fps;
    let mut frame = vec![0u8; args.frame_size];
    let mut next = Instant::now();
    let mut frames: u64 = 0;

    while !control_thread.is_finished() {
        frame.fill(frames as u8);
        match session.send_frame(&frame, CLOCK_RATE / fps) {
            Ok(_) => {}
            Err(e) if e.is_fatal() => break,
            Err(e) => tracing::warn!(error = %e, "frame not sent"),
        }
        session.poll_incoming();
        frames += 1;

        next += frame_interval;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    let outcome = match control_thread.join() {
        Ok(result) => result,
        Err(_) => {
            eprintln!("Control thread panicked");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(frames, participants = session.participant_count(), "stopping");
    drop(session);

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Session terminated: {e}");
            ExitCode::FAILURE
        }
    }
}
