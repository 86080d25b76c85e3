/// Stream synthetic channel frames through the droplet analyzer
///
/// Droplets of a few sizes flow left to right through a 640x200 channel while
/// a dust speck sits still in the middle. Frames are produced faster than the
/// pipeline consumes them, so some are dropped by the scheduler.
///
/// Usage:
///   cargo run --release --example synthetic_stream [frames] [export.csv]
use anyhow::{Context, Result};
use dropscope::{
    CalibrationProfile, Dimension, DropletAnalyzer, ExportFormat, Frame, PipelineConfig, Roi,
    SubmitOutcome,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 200;
const CHANNEL_TOP: i64 = 60;
const CHANNEL_BOTTOM: i64 = 140;

struct Droplet {
    x: f64,
    y: f64,
    radius: f64,
    speed: f64,
}

fn render(droplets: &[Droplet], rng: &mut StdRng, frame_id: u64) -> Frame {
    let mut data = vec![0u8; (WIDTH * HEIGHT) as usize];
    for y in 0..HEIGHT as i64 {
        let wall = y == CHANNEL_TOP || y == CHANNEL_BOTTOM;
        for x in 0..WIDTH as i64 {
            let base: u8 = if wall { 90 } else { 40 };
            data[(y * WIDTH as i64 + x) as usize] = base + rng.gen_range(0..4);
        }
    }

    // Static speck of dust
    for y in 98..104 {
        for x in 318..324 {
            data[(y * WIDTH as i64 + x) as usize] = 180;
        }
    }

    for d in droplets {
        let r = d.radius.ceil() as i64;
        let (cx, cy) = (d.x.round() as i64, d.y.round() as i64);
        for y in (cy - r).max(0)..=(cy + r).min(HEIGHT as i64 - 1) {
            for x in (cx - r).max(0)..=(cx + r).min(WIDTH as i64 - 1) {
                let dx = (x - cx) as f64;
                let dy = (y - cy) as f64;
                if dx * dx + dy * dy <= d.radius * d.radius {
                    data[(y * WIDTH as i64 + x) as usize] = 210;
                }
            }
        }
    }

    let mut frame = Frame::gray(data, WIDTH, HEIGHT, frame_id);
    frame.timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    frame
}

fn spawn_droplet(rng: &mut StdRng) -> Droplet {
    Droplet {
        x: -10.0,
        y: rng.gen_range((CHANNEL_TOP + 15) as f64..(CHANNEL_BOTTOM - 15) as f64),
        radius: [6.0, 8.0, 11.0][rng.gen_range(0..3)],
        speed: rng.gen_range(6.0..12.0),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dropscope::init()?;

    let args: Vec<String> = std::env::args().collect();
    let total_frames: u64 = match args.get(1) {
        Some(n) => n.parse().context("frame count must be an integer")?,
        None => 600,
    };
    let export_path = args.get(2).cloned();

    let config = PipelineConfig {
        background_warmup_frames: 10,
        channel_band: Some((CHANNEL_TOP as f64, CHANNEL_BOTTOM as f64)),
        ..PipelineConfig::default()
    };
    let analyzer = DropletAnalyzer::new(config, CalibrationProfile::new(2.5, -0.5))?;
    analyzer.set_roi(Roi::new(0, 0, WIDTH, HEIGHT))?;
    analyzer.start()?;

    let mut rng = StdRng::seed_from_u64(42);
    let mut droplets: Vec<Droplet> = Vec::new();
    let (mut accepted, mut replaced) = (0u64, 0u64);
    let start = Instant::now();

    for frame_id in 0..total_frames {
        // Empty channel while the background warms up
        if frame_id >= 10 && rng.gen_bool(0.3) {
            droplets.push(spawn_droplet(&mut rng));
        }
        for d in droplets.iter_mut() {
            d.x += d.speed;
        }
        droplets.retain(|d| d.x - d.radius < WIDTH as f64);

        let frame = render(&droplets, &mut rng, frame_id);
        match analyzer.submit_frame(frame)? {
            SubmitOutcome::Accepted => accepted += 1,
            SubmitOutcome::Replaced { .. } => replaced += 1,
            SubmitOutcome::Stale | SubmitOutcome::Stopped => {}
        }

        // Warm-up frames must all reach the background model
        if frame_id < 10 {
            analyzer.wait_idle(Duration::from_secs(5));
        } else {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    analyzer.wait_idle(Duration::from_secs(10));
    let elapsed = start.elapsed();
    let status = analyzer.status();
    analyzer.stop()?;

    println!("\nStream finished in {:.2}s", elapsed.as_secs_f64());
    println!(
        "  submitted {} (accepted {}, replaced {}), processed {}",
        total_frames, accepted, replaced, status.frame_count
    );
    if let Some(err) = &status.last_error {
        println!("  halted: {}", err);
    }

    let report = analyzer.statistics();
    println!("\nDroplets measured: {}", report.count);
    for (name, s) in [
        ("equivalent diameter", &report.equivalent_diameter),
        ("major axis", &report.major_axis),
        ("minor axis", &report.minor_axis),
        ("area", &report.area),
    ] {
        println!(
            "  {:<20} mean {:>5} std {:>4} min {:>5} max {:>5} mode {:>5} {}",
            name, s.mean, s.std, s.min, s.max, s.mode, s.unit
        );
    }

    let snapshot = analyzer.histogram(Dimension::EquivalentDiameter);
    let peak = snapshot.counts.iter().copied().max().unwrap_or(0).max(1);
    println!("\nEquivalent diameter ({}):", snapshot.unit);
    for (i, &count) in snapshot.counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let bar = "#".repeat((count * 40 / peak) as usize);
        println!("  {:>7.1} {:>5} {}", snapshot.bins[i], count, bar);
    }

    println!("\nStage timing (ms):");
    for (stage, t) in analyzer.performance() {
        println!(
            "  {:<20} mean {:>7.3} p95 {:>7.3} p99 {:>7.3} n={}",
            format!("{:?}", stage),
            t.mean,
            t.p95,
            t.p99,
            t.count
        );
    }

    if let Some(path) = export_path {
        let format: ExportFormat = path
            .rsplit('.')
            .next()
            .unwrap_or("csv")
            .parse()
            .unwrap_or(ExportFormat::Csv);
        let bytes = analyzer.export(format)?;
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path))?;
        println!("\nExported measurements to {}", path);
    }

    Ok(())
}
