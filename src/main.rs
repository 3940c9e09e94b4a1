//! pcmstream demo - 正弦波打进 PCM 传输层
//!
//! 演示完整路径：open → hw_params/sw_params → 写循环（自动启动）→
//! drain → close。virt 后端另起一条"驱动线程"按采样率节拍消费，
//! null 后端即写即弃。

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;

use pcmstream::device::virt::{VirtBackend, VirtCtl};
use pcmstream::{Access, Device, Direction, HwConfig, SampleFormat, State};

/// pcmstream demo - sine tone through the PCM transport layer
#[derive(Parser)]
#[command(name = "pcmstream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backend to open: null (discard) or virt (paced virtual device)
    #[arg(short, long, default_value = "virt")]
    device: String,

    /// Sample rate in Hz
    #[arg(short, long, default_value = "48000")]
    rate: u32,

    /// Channel count
    #[arg(short, long, default_value = "2")]
    channels: u32,

    /// Period size in frames
    #[arg(short, long, default_value = "1024")]
    period: u64,

    /// Buffer size in frames
    #[arg(short, long, default_value = "4096")]
    buffer: u64,

    /// Tone frequency in Hz
    #[arg(short, long, default_value = "440.0")]
    frequency: f64,

    /// Playback length in seconds
    #[arg(short = 't', long, default_value = "3.0")]
    seconds: f64,

    /// Print the installed hw/sw setup before playing
    #[arg(long)]
    dump: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let (mut dev, ctl) = open_backend(&cli.device)?;

    let cfg = HwConfig::new(
        Access::RwInterleaved,
        SampleFormat::S16Le,
        cli.channels,
        cli.rate,
        cli.period,
        cli.buffer,
    );
    dev.hw_params(cfg)
        .with_context(|| format!("installing hw config on '{}'", cli.device))?;

    if cli.dump {
        print!("{}", dev.dump_setup());
        println!();
    }

    // virt 后端的"驱动"：按采样率节拍消费，直到 stop 标志落下
    let running = Arc::new(AtomicBool::new(true));
    let driver = ctl.map(|ctl| spawn_driver(ctl, cli.rate, cli.period, running.clone()));

    let result = play_tone(&dev, &cli);

    running.store(false, Ordering::SeqCst);
    if let Some(t) = driver {
        t.join().expect("driver thread panicked");
    }

    result?;
    dev.close()?;
    println!("Done.");
    Ok(())
}

fn open_backend(name: &str) -> anyhow::Result<(Device, Option<VirtCtl>)> {
    match name {
        "virt" => {
            let (dev, ctl) = VirtBackend::open(Direction::Playback);
            Ok((dev, Some(ctl)))
        }
        "null" => Ok((
            pcmstream::device::open("null", Direction::Playback)?,
            None,
        )),
        other => anyhow::bail!("unknown backend '{}' (expected: null, virt)", other),
    }
}

/// 虚拟设备的消费线程：每个周期推进 period 帧
fn spawn_driver(
    ctl: VirtCtl,
    rate: u32,
    period: u64,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let tick = Duration::from_micros(period * 1_000_000 / rate as u64);
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            thread::sleep(tick);
            // 设备还没启动/已经停了：下一拍再看
            let _ = ctl.advance(period);
        }
    })
}

fn play_tone(dev: &Device, cli: &Cli) -> anyhow::Result<()> {
    let frame_bytes = cli.channels as usize * 2;
    let total_frames = (cli.seconds * cli.rate as f64) as u64;
    let mut phase = 0f64;
    let step = std::f64::consts::TAU * cli.frequency / cli.rate as f64;

    println!(
        "Playing {:.0} Hz tone for {:.1}s ({} frames) on '{}'",
        cli.frequency, cli.seconds, total_frames, cli.device
    );

    let started = Instant::now();
    let mut written = 0u64;
    let mut buf = vec![0u8; cli.period as usize * frame_bytes];
    while written < total_frames {
        let frames = cli.period.min(total_frames - written);
        fill_sine(&mut buf, frames, cli.channels, &mut phase, step);
        let n = dev
            .writei(&buf[..frames as usize * frame_bytes], frames)
            .context("write failed")?;
        written += n;

        let status = dev.status()?;
        print!(
            "\r  {:6.2}s | state: {:<8} | delay: {:5} | avail: {:5}  ",
            started.elapsed().as_secs_f64(),
            status.state.name(),
            status.delay,
            status.avail
        );
        io::stdout().flush()?;
    }
    println!();

    log::info!("wrote {} frames, draining", written);
    dev.drain()?;
    // virt 后端排空靠驱动线程把余量耗完
    while dev.state() == State::Draining {
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

/// 按当前相位生成 S16LE 交织正弦帧
fn fill_sine(buf: &mut [u8], frames: u64, channels: u32, phase: &mut f64, step: f64) {
    let mut i = 0;
    for _ in 0..frames {
        let sample = (phase.sin() * i16::MAX as f64 * 0.3) as i16;
        *phase += step;
        for _ in 0..channels {
            let b = sample.to_le_bytes();
            buf[i] = b[0];
            buf[i + 1] = b[1];
            i += 2;
        }
    }
}
