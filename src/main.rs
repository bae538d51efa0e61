//! Headless player binary: plays one media file, logging progress.

use std::time::{Duration, Instant};

use tracing::info;

use strix::sink::NullVideoSink;
use strix::{Player, PlayerSettings};

/// Default tick when no frame deadline is closer.
const REFRESH_RATE: f64 = 0.01;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: strix <media-path>");
        std::process::exit(2);
    };

    let settings = PlayerSettings {
        auto_exit: true,
        ..PlayerSettings::default()
    };
    let mut player = match Player::open(&path, settings) {
        Ok(player) => player,
        Err(e) => {
            eprintln!("failed to open {path}: {e}");
            std::process::exit(1);
        }
    };

    let mut sink = NullVideoSink::new();
    let mut last_report = Instant::now();
    while player.is_running() {
        let mut remaining = REFRESH_RATE;
        player.refresh(&mut sink, &mut remaining);
        if remaining > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(remaining));
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            let (position, frame) = player.progress();
            if position.is_finite() {
                match player.duration() {
                    Some(total) => info!(?frame, "at {position:.2}s / {total:.2}s"),
                    None => info!(?frame, "at {position:.2}s"),
                }
            }
        }
    }

    let stats = player.stats();
    info!(
        early = stats.early,
        late = stats.late,
        displayed = sink.frames_displayed,
        "playback done"
    );
}
