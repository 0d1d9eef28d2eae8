//! frame_receiver - pull frames from one sensor of a running streamerd

use anyhow::{anyhow, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use sensor_streamer::{
    FrameReceiver, ReceivedFrame, SampleOrder, SensorRole, StreamerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Streamer host.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
    /// Sensor role (depth_ahat, depth_long_throw, left_front, right_front, color_video).
    #[arg(long, default_value = "depth_long_throw")]
    sensor: SensorRole,
    /// TCP frame port (defaults to the sensor's stock port).
    #[arg(long)]
    stream_port: Option<u16>,
    /// UDP request port (defaults to the sensor's stock port).
    #[arg(long)]
    request_port: Option<u16>,
    /// Frames to fetch before exiting.
    #[arg(long, default_value_t = 30)]
    frames: u32,
    /// Milliseconds to wait before re-requesting a frame.
    #[arg(long, default_value_t = 200)]
    retry_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let defaults = StreamerConfig::default();
    let stock = match args.sensor {
        SensorRole::ColorVideo => &defaults.video.sensor,
        SensorRole::LeftFront => &defaults.left_front,
        SensorRole::RightFront => &defaults.right_front,
        SensorRole::DepthAhat | SensorRole::DepthLongThrow => &defaults.depth,
    };
    let stream_addr = SocketAddr::new(args.host, args.stream_port.unwrap_or(stock.stream_port));
    let request_addr =
        SocketAddr::new(args.host, args.request_port.unwrap_or(stock.request_port));

    let mut receiver = FrameReceiver::connect(
        args.sensor,
        stream_addr,
        request_addr,
        Some(Duration::from_secs(10)),
    )?;

    let retry = Duration::from_millis(args.retry_ms.max(1));
    let started = Instant::now();
    let mut last_timestamp = None;
    for index in 0..args.frames {
        let frame = receiver.fetch(retry, 50)?;
        if let Some(last) = last_timestamp {
            if frame.header.absolute_timestamp <= last {
                return Err(anyhow!(
                    "frame {} timestamp {} does not advance past {}",
                    index,
                    frame.header.absolute_timestamp,
                    last
                ));
            }
        }
        last_timestamp = Some(frame.header.absolute_timestamp);
        log_frame(index, &frame)?;
    }

    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        log::info!(
            "{}: {} frames in {:.2}s ({:.1} fps)",
            args.sensor,
            args.frames,
            elapsed,
            f64::from(args.frames) / elapsed
        );
    }
    Ok(())
}

fn log_frame(index: u32, frame: &ReceivedFrame) -> Result<()> {
    let h = &frame.header;
    let [x, y, z] = h.pose.translation();
    let mut summary = format!(
        "#{} ts={} {}x{} bpp={} stride={} bytes={} pos=({:.3}, {:.3}, {:.3})",
        index,
        h.absolute_timestamp,
        h.width,
        h.height,
        h.bytes_per_pixel,
        h.row_stride,
        h.payload_byte_length,
        x,
        y,
        z
    );
    if let Some(focal) = h.focal_length {
        summary.push_str(&format!(" fx={:.1} fy={:.1}", focal.fx, focal.fy));
    }
    if let Some(order) = SampleOrder::for_role(frame.role) {
        let planes = frame.depth_planes(order)?;
        let invalid = planes.depth.iter().filter(|d| **d == 0).count();
        summary.push_str(&format!(" invalid_depth={}", invalid));
    }
    log::info!("{}: {}", frame.role, summary);
    Ok(())
}
